//! Gain-interpolated accumulation into bus lines.

use super::{BufferLine, GAIN_SILENCE_THRESHOLD};

/// Steps smaller than this are treated as already at the target.
const MIN_GAIN_STEP: f32 = 1e-5;

/// Adds `data` into each line of `out` starting at `out_pos`.
///
/// Gains move linearly from `current` toward `target` over `counter`
/// samples and then hold. `current` is left at the gain reached after this
/// call.
pub fn mix_samples(
    data: &[f32],
    out: &mut [BufferLine],
    current: &mut [f32],
    target: &[f32],
    counter: usize,
    out_pos: usize,
) {
    let delta = if counter > 0 { 1.0 / counter as f32 } else { 0.0 };
    let min_len = counter.min(data.len());

    for ((line, gain_cur), &gain_target) in out.iter_mut().zip(current.iter_mut()).zip(target) {
        let dst = &mut line[out_pos..out_pos + data.len()];
        let mut gain = *gain_cur;
        let step = (gain_target - gain) * delta;

        let mut pos = 0;
        if step.abs() > MIN_GAIN_STEP {
            while pos < min_len {
                dst[pos] += data[pos] * (gain + step * pos as f32);
                pos += 1;
            }
            gain = if pos == counter {
                gain_target
            } else {
                gain + step * pos as f32
            };
        } else {
            gain = gain_target;
        }
        *gain_cur = gain;

        if gain.abs() <= GAIN_SILENCE_THRESHOLD {
            continue;
        }
        for (d, s) in dst[pos..].iter_mut().zip(&data[pos..]) {
            *d += s * gain;
        }
    }
}

/// Adds `data` into a single line with a fixed gain.
pub fn mix_line(data: &[f32], out: &mut [f32], gain: f32) {
    if gain.abs() <= GAIN_SILENCE_THRESHOLD {
        return;
    }
    for (d, s) in out.iter_mut().zip(data) {
        *d += s * gain;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::{BUFFER_LINE_SIZE, new_bus};
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_linear_ramp_over_counter() {
        let data = vec![1.0f32; 960];
        let mut out = new_bus(2);
        let mut current = [0.0, 1.0];
        mix_samples(&data, &mut out, &mut current, &[1.0, 0.0], 960, 0);
        for n in 0..960 {
            assert_abs_diff_eq!(out[0][n], n as f32 / 960.0, epsilon = 1e-6);
            assert_abs_diff_eq!(out[1][n], 1.0 - n as f32 / 960.0, epsilon = 1e-6);
        }
        assert_eq!(current, [1.0, 0.0]);
    }

    #[test]
    fn test_ramp_shorter_than_block_then_holds() {
        let data = vec![1.0f32; 16];
        let mut out = new_bus(1);
        let mut current = [0.0];
        mix_samples(&data, &mut out, &mut current, &[2.0], 4, 0);
        assert_abs_diff_eq!(out[0][2], 1.0, epsilon = 1e-6);
        assert!(out[0][4..16].iter().all(|&s| s == 2.0));
        assert_eq!(current[0], 2.0);
    }

    #[test]
    fn test_partial_ramp_keeps_progress() {
        let data = vec![1.0f32; 4];
        let mut out = new_bus(1);
        let mut current = [0.0];
        mix_samples(&data, &mut out, &mut current, &[1.0], 8, 0);
        assert_abs_diff_eq!(current[0], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_silent_gain_skips_and_offsets() {
        let data = vec![1.0f32; 8];
        let mut out = new_bus(1);
        let mut current = [0.0];
        mix_samples(&data, &mut out, &mut current, &[0.0], 0, 100);
        assert!(out[0].iter().all(|&s| s == 0.0));

        let mut current = [0.5];
        mix_samples(&data, &mut out, &mut current, &[0.5], 0, BUFFER_LINE_SIZE - 8);
        assert_eq!(out[0][BUFFER_LINE_SIZE - 1], 0.5);
        assert_eq!(out[0][BUFFER_LINE_SIZE - 9], 0.0);
    }
}
