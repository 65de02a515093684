//! Two-channel UHJ encoding of a first-order B-Format bus.

use super::{BUFFER_LINE_SIZE, BufferLine};
use std::f32::consts::{FRAC_1_SQRT_2, PI};

/// Taps of the wide-band 90 degree phase shifter.
pub const UHJ_FILTER_LENGTH: usize = 256;
/// Delay added by the encoder, in samples.
pub const UHJ_DELAY: usize = UHJ_FILTER_LENGTH / 2;

const HISTORY: usize = UHJ_FILTER_LENGTH - 1;
const INV_SQRT3: f32 = 0.577_350_26;

fn hilbert_coeffs() -> Vec<f32> {
    (0..UHJ_FILTER_LENGTH)
        .map(|k| {
            let m = k as i32 - UHJ_DELAY as i32;
            if m % 2 == 0 {
                return 0.0;
            }
            let x = m as f32 / UHJ_FILTER_LENGTH as f32;
            let window = 0.42 + 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos();
            2.0 / (PI * m as f32) * window
        })
        .collect()
}

/// Encodes W, X and Y (ACN order, N3D) into left/right.
#[derive(Debug, Clone)]
pub struct UhjEncoder {
    coeffs: Vec<f32>,
    /// Phase-shifted input: -0.3420201 W + 0.5098604 X.
    shift: Vec<f32>,
    /// Unshifted mid: 0.9396926 W + 0.1855740 X.
    mid: Vec<f32>,
    /// Unshifted side: 0.6554516 Y.
    side: Vec<f32>,
}

impl Default for UhjEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl UhjEncoder {
    pub fn new() -> Self {
        let len = HISTORY + BUFFER_LINE_SIZE;
        Self {
            coeffs: hilbert_coeffs(),
            shift: vec![0.0; len],
            mid: vec![0.0; len],
            side: vec![0.0; len],
        }
    }

    /// Encodes `count` frames of `ambi` (W, Y, Z, X) into `left` and `right`.
    pub fn encode(&mut self, ambi: &[BufferLine], left: &mut [f32], right: &mut [f32], count: usize) {
        for i in 0..count {
            let w = ambi[0][i] * FRAC_1_SQRT_2;
            let y = ambi[1][i] * INV_SQRT3;
            let x = ambi[3][i] * INV_SQRT3;
            self.shift[HISTORY + i] = -0.342_020_1 * w + 0.509_860_4 * x;
            self.mid[HISTORY + i] = 0.939_692_6 * w + 0.185_574 * x;
            self.side[HISTORY + i] = 0.655_451_6 * y;
        }

        for i in 0..count {
            let now = HISTORY + i;
            let shifted: f32 = self
                .coeffs
                .iter()
                .enumerate()
                .map(|(k, c)| c * self.shift[now - k])
                .sum();
            let s = self.mid[now - UHJ_DELAY];
            let d = shifted + self.side[now - UHJ_DELAY];
            left[i] = (s + d) * 0.5;
            right[i] = (s - d) * 0.5;
        }

        for line in [&mut self.shift, &mut self.mid, &mut self.side] {
            line.copy_within(count..count + HISTORY, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::new_bus;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_hilbert_is_antisymmetric() {
        let c = hilbert_coeffs();
        assert_eq!(c[UHJ_DELAY], 0.0);
        for m in 1..UHJ_DELAY {
            assert_abs_diff_eq!(c[UHJ_DELAY + m], -c[UHJ_DELAY - m], epsilon = 1e-7);
        }
    }

    #[test]
    fn test_omni_impulse_sums_to_mid_after_delay() {
        let mut encoder = UhjEncoder::new();
        let mut bus = new_bus(4);
        bus[0][0] = 1.0;
        let mut left = vec![0.0; 512];
        let mut right = vec![0.0; 512];
        encoder.encode(&bus, &mut left[..256], &mut right[..256], 256);
        bus[0][0] = 0.0;
        encoder.encode(&bus, &mut left[256..], &mut right[256..], 256);

        for n in 0..512 {
            let sum = left[n] + right[n];
            let expected = if n == UHJ_DELAY { 0.939_692_6 * FRAC_1_SQRT_2 } else { 0.0 };
            assert_abs_diff_eq!(sum, expected, epsilon = 1e-6);
        }
        // The shifted difference is zero at the centre tap.
        assert_abs_diff_eq!(left[UHJ_DELAY] - right[UHJ_DELAY], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_left_source_favours_left() {
        let mut encoder = UhjEncoder::new();
        let mut bus = new_bus(4);
        for i in 0..BUFFER_LINE_SIZE {
            let v = (i as f32 * 0.05).sin();
            bus[0][i] = v;
            bus[1][i] = v * 1.732_050_8;
        }
        let mut left = vec![0.0; BUFFER_LINE_SIZE];
        let mut right = vec![0.0; BUFFER_LINE_SIZE];
        encoder.encode(&bus, &mut left, &mut right, BUFFER_LINE_SIZE);
        let energy = |s: &[f32]| s[UHJ_FILTER_LENGTH..].iter().map(|x| x * x).sum::<f32>();
        assert!(energy(&left) > 2.0 * energy(&right));
    }
}
