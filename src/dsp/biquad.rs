//! Second-order shelf filters for the direct and send paths.

use std::f32::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiquadType {
    /// Attenuates above the reference frequency.
    HighShelf,
    /// Attenuates below the reference frequency.
    LowShelf,
}

/// Transposed direct form II biquad.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadFilter {
    z1: f32,
    z2: f32,
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl Default for BiquadFilter {
    fn default() -> Self {
        Self {
            z1: 0.0,
            z2: 0.0,
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }
}

impl BiquadFilter {
    pub fn clear(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    /// Sets a shelf from its normalised corner frequency, linear shelf gain
    /// and slope (1.0 being the steepest without overshoot).
    pub fn set_params_from_slope(&mut self, ty: BiquadType, f0norm: f32, gain: f32, slope: f32) {
        // Limit -60dB
        let gain = gain.max(0.001);
        let amp = gain.sqrt();
        let rcp_q = ((amp + 1.0 / amp) * (1.0 / slope - 1.0) + 2.0).sqrt();
        self.set_params(ty, f0norm, amp, rcp_q);
    }

    fn set_params(&mut self, ty: BiquadType, f0norm: f32, amp: f32, rcp_q: f32) {
        let w0 = 2.0 * PI * f0norm;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let alpha = sin_w0 / 2.0 * rcp_q;
        let sqrt_amp_alpha_2 = 2.0 * amp.sqrt() * alpha;

        let (b, a) = match ty {
            BiquadType::HighShelf => (
                [
                    amp * ((amp + 1.0) + (amp - 1.0) * cos_w0 + sqrt_amp_alpha_2),
                    -2.0 * amp * ((amp - 1.0) + (amp + 1.0) * cos_w0),
                    amp * ((amp + 1.0) + (amp - 1.0) * cos_w0 - sqrt_amp_alpha_2),
                ],
                [
                    (amp + 1.0) - (amp - 1.0) * cos_w0 + sqrt_amp_alpha_2,
                    2.0 * ((amp - 1.0) - (amp + 1.0) * cos_w0),
                    (amp + 1.0) - (amp - 1.0) * cos_w0 - sqrt_amp_alpha_2,
                ],
            ),
            BiquadType::LowShelf => (
                [
                    amp * ((amp + 1.0) - (amp - 1.0) * cos_w0 + sqrt_amp_alpha_2),
                    2.0 * amp * ((amp - 1.0) - (amp + 1.0) * cos_w0),
                    amp * ((amp + 1.0) - (amp - 1.0) * cos_w0 - sqrt_amp_alpha_2),
                ],
                [
                    (amp + 1.0) + (amp - 1.0) * cos_w0 + sqrt_amp_alpha_2,
                    -2.0 * ((amp - 1.0) + (amp + 1.0) * cos_w0),
                    (amp + 1.0) + (amp - 1.0) * cos_w0 - sqrt_amp_alpha_2,
                ],
            ),
        };

        self.b0 = b[0] / a[0];
        self.b1 = b[1] / a[0];
        self.b2 = b[2] / a[0];
        self.a1 = a[1] / a[0];
        self.a2 = a[2] / a[0];
    }

    /// Copies coefficients, keeping this filter's history.
    pub fn copy_params_from(&mut self, other: &Self) {
        self.b0 = other.b0;
        self.b1 = other.b1;
        self.b2 = other.b2;
        self.a1 = other.a1;
        self.a2 = other.a2;
    }

    pub fn process(&mut self, src: &[f32], dst: &mut [f32]) {
        let (b0, b1, b2, a1, a2) = (self.b0, self.b1, self.b2, self.a1, self.a2);
        let (mut z1, mut z2) = (self.z1, self.z2);
        for (out, &input) in dst.iter_mut().zip(src) {
            let y = input * b0 + z1;
            z1 = input * b1 - y * a1 + z2;
            z2 = input * b2 - y * a2;
            *out = y;
        }
        self.z1 = z1;
        self.z2 = z2;
    }

    pub fn process_in_place(&mut self, samples: &mut [f32]) {
        let (b0, b1, b2, a1, a2) = (self.b0, self.b1, self.b2, self.a1, self.a2);
        let (mut z1, mut z2) = (self.z1, self.z2);
        for sample in samples.iter_mut() {
            let input = *sample;
            let y = input * b0 + z1;
            z1 = input * b1 - y * a1 + z2;
            z2 = input * b2 - y * a2;
            *sample = y;
        }
        self.z1 = z1;
        self.z2 = z2;
    }
}

/// Which shelves a path needs, from its HF and LF gains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterType {
    #[default]
    None,
    LowPass,
    HighPass,
    BandPass,
}

impl FilterType {
    pub fn from_gains(gain_hf: f32, gain_lf: f32) -> Self {
        match (gain_hf != 1.0, gain_lf != 1.0) {
            (false, false) => Self::None,
            (true, false) => Self::LowPass,
            (false, true) => Self::HighPass,
            (true, true) => Self::BandPass,
        }
    }
}

/// Runs `src` through the shelves selected by `ty` into `dst`.
///
/// Unused filters have their history cleared so a later switch starts clean.
pub fn apply_filters(
    ty: FilterType,
    low_pass: &mut BiquadFilter,
    high_pass: &mut BiquadFilter,
    src: &[f32],
    dst: &mut [f32],
) {
    match ty {
        FilterType::None => {
            low_pass.clear();
            high_pass.clear();
            dst.copy_from_slice(src);
        }
        FilterType::LowPass => {
            low_pass.process(src, dst);
            high_pass.clear();
        }
        FilterType::HighPass => {
            low_pass.clear();
            high_pass.process(src, dst);
        }
        FilterType::BandPass => {
            low_pass.process(src, dst);
            high_pass.process_in_place(dst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn settle(filter: &mut BiquadFilter, input: impl Fn(usize) -> f32) -> f32 {
        let src: Vec<f32> = (0..4096).map(input).collect();
        let mut dst = vec![0.0; src.len()];
        filter.process(&src, &mut dst);
        dst[2048..].iter().fold(0.0f32, |m, v| m.max(v.abs()))
    }

    #[test]
    fn test_high_shelf_keeps_dc() {
        let mut filter = BiquadFilter::default();
        filter.set_params_from_slope(BiquadType::HighShelf, 5000.0 / 48000.0, 0.25, 1.0);
        assert_abs_diff_eq!(settle(&mut filter, |_| 1.0), 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_high_shelf_attenuates_nyquist() {
        let mut filter = BiquadFilter::default();
        filter.set_params_from_slope(BiquadType::HighShelf, 5000.0 / 48000.0, 0.25, 1.0);
        let peak = settle(&mut filter, |n| if n % 2 == 0 { 1.0 } else { -1.0 });
        assert_abs_diff_eq!(peak, 0.25, epsilon = 0.01);
    }

    #[test]
    fn test_low_shelf_attenuates_dc() {
        let mut filter = BiquadFilter::default();
        filter.set_params_from_slope(BiquadType::LowShelf, 250.0 / 48000.0, 0.5, 1.0);
        assert_abs_diff_eq!(settle(&mut filter, |_| 1.0), 0.5, epsilon = 0.01);
    }

    #[test]
    fn test_filter_type_selection() {
        assert_eq!(FilterType::from_gains(1.0, 1.0), FilterType::None);
        assert_eq!(FilterType::from_gains(0.5, 1.0), FilterType::LowPass);
        assert_eq!(FilterType::from_gains(1.0, 0.5), FilterType::HighPass);
        assert_eq!(FilterType::from_gains(0.5, 0.5), FilterType::BandPass);
    }

    #[test]
    fn test_no_filter_is_identity() {
        let mut lp = BiquadFilter::default();
        let mut hp = BiquadFilter::default();
        let src = [0.1, -0.2, 0.3];
        let mut dst = [0.0; 3];
        apply_filters(FilterType::None, &mut lp, &mut hp, &src, &mut dst);
        assert_eq!(dst, src);
    }
}
