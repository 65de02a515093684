//! Sample-rate conversion kernels.
//!
//! Every kernel reads from a source line where `origin` indexes the sample
//! at the current position, with [`MAX_RESAMPLER_EDGE`] samples of history
//! before it, and writes exactly `dst.len()` output samples.

use super::{MAX_RESAMPLER_EDGE, MIXER_FRAC_BITS, MIXER_FRAC_MASK, MIXER_FRAC_ONE};
use std::f64::consts::PI;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResamplerKind {
    Point,
    #[default]
    Linear,
    Cubic,
    FastBSinc12,
    BSinc12,
    FastBSinc24,
    BSinc24,
}

impl ResamplerKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "point" | "nearest" => Self::Point,
            "linear" => Self::Linear,
            "cubic" => Self::Cubic,
            "fast_bsinc12" => Self::FastBSinc12,
            "bsinc12" => Self::BSinc12,
            "fast_bsinc24" => Self::FastBSinc24,
            "bsinc24" | "bsinc" => Self::BSinc24,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Point => "Nearest",
            Self::Linear => "Linear",
            Self::Cubic => "Cubic",
            Self::FastBSinc12 => "11th order Sinc (fast)",
            Self::BSinc12 => "11th order Sinc",
            Self::FastBSinc24 => "23rd order Sinc (fast)",
            Self::BSinc24 => "23rd order Sinc",
        }
    }
}

const BSINC_PHASE_BITS: u32 = 5;
const BSINC_PHASE_COUNT: usize = 1 << BSINC_PHASE_BITS;
const BSINC_SCALE_COUNT: usize = 16;
/// Lowest cutoff, reached at a 4:1 downsampling step.
const BSINC_MIN_CUTOFF: f64 = 0.25;

/// Windowed-sinc coefficients over cutoff scales and sub-sample phases.
pub(crate) struct BSincTable {
    taps: usize,
    /// `[scale][phase 0..=PHASE_COUNT][tap]`
    coeffs: Vec<f32>,
}

impl BSincTable {
    fn generate(taps: usize, beta: f64) -> Self {
        let half = (taps / 2) as f64;
        let phases = BSINC_PHASE_COUNT + 1;
        let mut coeffs = Vec::with_capacity(BSINC_SCALE_COUNT * phases * taps);
        for scale in 0..BSINC_SCALE_COUNT {
            let cutoff =
                1.0 - (1.0 - BSINC_MIN_CUTOFF) * scale as f64 / (BSINC_SCALE_COUNT - 1) as f64;
            for phase in 0..phases {
                let offset = phase as f64 / BSINC_PHASE_COUNT as f64;
                let row: Vec<f64> = (0..taps)
                    .map(|k| {
                        let x = k as f64 - (half - 1.0) - offset;
                        cutoff * sinc(cutoff * x) * kaiser(beta, x / half)
                    })
                    .collect();
                let sum: f64 = row.iter().sum();
                coeffs.extend(row.iter().map(|c| (c / sum) as f32));
            }
        }
        Self { taps, coeffs }
    }

    fn row(&self, scale: usize, phase: usize) -> &[f32] {
        let start = (scale * (BSINC_PHASE_COUNT + 1) + phase) * self.taps;
        &self.coeffs[start..start + self.taps]
    }
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-9 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// Zeroth-order modified Bessel function of the first kind.
fn bessel_i0(x: f64) -> f64 {
    let mut term = 1.0;
    let mut sum = 1.0;
    let half = x / 2.0;
    for k in 1..50 {
        term *= half / k as f64;
        let add = term * term;
        sum += add;
        if add < sum * 1e-15 {
            break;
        }
    }
    sum
}

fn kaiser(beta: f64, t: f64) -> f64 {
    if t.abs() > 1.0 {
        return 0.0;
    }
    bessel_i0(beta * (1.0 - t * t).sqrt()) / bessel_i0(beta)
}

fn bsinc12_table() -> &'static BSincTable {
    static TABLE: OnceLock<BSincTable> = OnceLock::new();
    TABLE.get_or_init(|| BSincTable::generate(12, 6.0))
}

fn bsinc24_table() -> &'static BSincTable {
    static TABLE: OnceLock<BSincTable> = OnceLock::new();
    TABLE.get_or_init(|| BSincTable::generate(24, 8.0))
}

/// Builds the sinc tables so the mixer never does it on first use.
pub(crate) fn warm_tables() {
    bsinc12_table();
    bsinc24_table();
}

/// A kernel bound to the step it was prepared for.
#[derive(Clone, Copy)]
pub(crate) struct Resampler {
    kind: ResamplerKind,
    bsinc: Option<BSincState>,
}

#[derive(Clone, Copy)]
struct BSincState {
    table: &'static BSincTable,
    scale: usize,
    scale_frac: f32,
    fast: bool,
}

impl std::fmt::Debug for Resampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resampler").field("kind", &self.kind).finish()
    }
}

impl Default for Resampler {
    fn default() -> Self {
        Self::prepare(ResamplerKind::Linear, MIXER_FRAC_ONE)
    }
}

impl Resampler {
    /// Selects the kernel for `kind` at the given fixed-point step.
    pub(crate) fn prepare(kind: ResamplerKind, increment: u32) -> Self {
        let table = match kind {
            ResamplerKind::FastBSinc12 | ResamplerKind::BSinc12 => Some(bsinc12_table()),
            ResamplerKind::FastBSinc24 | ResamplerKind::BSinc24 => Some(bsinc24_table()),
            _ => None,
        };
        let bsinc = table.map(|table| {
            let cutoff = if increment > MIXER_FRAC_ONE {
                (MIXER_FRAC_ONE as f64 / increment as f64).max(BSINC_MIN_CUTOFF)
            } else {
                1.0
            };
            let position =
                (1.0 - cutoff) / (1.0 - BSINC_MIN_CUTOFF) * (BSINC_SCALE_COUNT - 1) as f64;
            let scale = (position.floor() as usize).min(BSINC_SCALE_COUNT - 2);
            BSincState {
                table,
                scale,
                scale_frac: (position - scale as f64) as f32,
                fast: matches!(
                    kind,
                    ResamplerKind::FastBSinc12 | ResamplerKind::FastBSinc24
                ),
            }
        });
        Self { kind, bsinc }
    }

    /// Resamples from `src`, starting at `origin` with sub-sample `frac`.
    pub(crate) fn process(
        &self,
        src: &[f32],
        origin: usize,
        frac: u32,
        increment: u32,
        dst: &mut [f32],
    ) {
        if increment == MIXER_FRAC_ONE && frac == 0 {
            dst.copy_from_slice(&src[origin..origin + dst.len()]);
            return;
        }
        match (self.kind, self.bsinc) {
            (_, Some(state)) => resample_bsinc(&state, src, origin, frac, increment, dst),
            (ResamplerKind::Point, _) => resample_point(src, origin, frac, increment, dst),
            (ResamplerKind::Cubic, _) => resample_cubic(src, origin, frac, increment, dst),
            _ => resample_linear(src, origin, frac, increment, dst),
        }
    }
}

fn step(pos: &mut usize, frac: &mut u32, increment: u32) {
    *frac += increment;
    *pos += (*frac >> MIXER_FRAC_BITS) as usize;
    *frac &= MIXER_FRAC_MASK;
}

fn resample_point(src: &[f32], origin: usize, mut frac: u32, increment: u32, dst: &mut [f32]) {
    let mut pos = origin;
    for out in dst.iter_mut() {
        *out = src[pos];
        step(&mut pos, &mut frac, increment);
    }
}

fn resample_linear(src: &[f32], origin: usize, mut frac: u32, increment: u32, dst: &mut [f32]) {
    let mut pos = origin;
    for out in dst.iter_mut() {
        let mu = frac as f32 * (1.0 / MIXER_FRAC_ONE as f32);
        *out = src[pos] + (src[pos + 1] - src[pos]) * mu;
        step(&mut pos, &mut frac, increment);
    }
}

fn resample_cubic(src: &[f32], origin: usize, mut frac: u32, increment: u32, dst: &mut [f32]) {
    let mut pos = origin;
    for out in dst.iter_mut() {
        let mu = frac as f32 * (1.0 / MIXER_FRAC_ONE as f32);
        let (s0, s1, s2, s3) = (src[pos - 1], src[pos], src[pos + 1], src[pos + 2]);
        let a0 = -0.5 * s0 + 1.5 * s1 - 1.5 * s2 + 0.5 * s3;
        let a1 = s0 - 2.5 * s1 + 2.0 * s2 - 0.5 * s3;
        let a2 = -0.5 * s0 + 0.5 * s2;
        *out = ((a0 * mu + a1) * mu + a2) * mu + s1;
        step(&mut pos, &mut frac, increment);
    }
}

fn resample_bsinc(
    state: &BSincState,
    src: &[f32],
    origin: usize,
    mut frac: u32,
    increment: u32,
    dst: &mut [f32],
) {
    const PHASE_SHIFT: u32 = MIXER_FRAC_BITS - BSINC_PHASE_BITS;
    const PHASE_MASK: u32 = (1 << PHASE_SHIFT) - 1;

    let table = state.table;
    let taps = table.taps;
    let lead = taps / 2 - 1;
    let mut pos = origin;
    for out in dst.iter_mut() {
        let phase = (frac >> PHASE_SHIFT) as usize;
        let phase_frac = (frac & PHASE_MASK) as f32 * (1.0 / (1 << PHASE_SHIFT) as f32);
        let window = &src[pos - lead..pos - lead + taps];

        let mut acc = 0.0f32;
        if state.fast {
            let row = table.row(state.scale, phase);
            for (c, s) in row.iter().zip(window) {
                acc += c * s;
            }
        } else {
            let r00 = table.row(state.scale, phase);
            let r01 = table.row(state.scale, phase + 1);
            let r10 = table.row(state.scale + 1, phase);
            let r11 = table.row(state.scale + 1, phase + 1);
            for k in 0..taps {
                let lo = r00[k] + (r01[k] - r00[k]) * phase_frac;
                let hi = r10[k] + (r11[k] - r10[k]) * phase_frac;
                acc += (lo + (hi - lo) * state.scale_frac) * window[k];
            }
        }
        *out = acc;
        step(&mut pos, &mut frac, increment);
    }
}

/// Highest source index a pass of `count` outputs reads, relative to `origin`.
pub(crate) fn source_span(frac: u32, increment: u32, count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    let last = u64::from(frac) + u64::from(increment) * (count as u64 - 1);
    (last >> MIXER_FRAC_BITS) as usize + MAX_RESAMPLER_EDGE
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| i as f32 - MAX_RESAMPLER_EDGE as f32).collect()
    }

    #[test]
    fn test_copy_path() {
        let src = ramp(64);
        let mut dst = [0.0; 8];
        Resampler::prepare(ResamplerKind::Cubic, MIXER_FRAC_ONE).process(
            &src,
            MAX_RESAMPLER_EDGE,
            0,
            MIXER_FRAC_ONE,
            &mut dst,
        );
        assert_eq!(dst, [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_linear_half_step() {
        let src = ramp(64);
        let mut dst = [0.0; 4];
        let half = MIXER_FRAC_ONE / 2;
        Resampler::prepare(ResamplerKind::Linear, half).process(
            &src,
            MAX_RESAMPLER_EDGE,
            0,
            half,
            &mut dst,
        );
        assert_eq!(dst, [0.0, 0.5, 1.0, 1.5]);
    }

    #[test]
    fn test_point_holds_samples() {
        let src = ramp(64);
        let mut dst = [0.0; 4];
        let half = MIXER_FRAC_ONE / 2;
        Resampler::prepare(ResamplerKind::Point, half).process(
            &src,
            MAX_RESAMPLER_EDGE,
            half,
            half,
            &mut dst,
        );
        assert_eq!(dst, [0.0, 1.0, 1.0, 2.0]);
    }

    #[test]
    fn test_cubic_reproduces_lines() {
        let src = ramp(64);
        let mut dst = [0.0; 6];
        let step = MIXER_FRAC_ONE / 3;
        Resampler::prepare(ResamplerKind::Cubic, step).process(
            &src,
            MAX_RESAMPLER_EDGE,
            0,
            step,
            &mut dst,
        );
        for (i, v) in dst.iter().enumerate() {
            assert_abs_diff_eq!(*v, i as f32 * step as f32 / MIXER_FRAC_ONE as f32, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_bsinc_passes_dc() {
        let src = vec![0.5f32; 128];
        for kind in [
            ResamplerKind::BSinc12,
            ResamplerKind::FastBSinc12,
            ResamplerKind::BSinc24,
            ResamplerKind::FastBSinc24,
        ] {
            for step in [MIXER_FRAC_ONE * 3 / 4, MIXER_FRAC_ONE * 5 / 2] {
                let mut dst = [0.0; 16];
                Resampler::prepare(kind, step).process(&src, MAX_RESAMPLER_EDGE, 1234, step, &mut dst);
                for v in dst {
                    assert_abs_diff_eq!(v, 0.5, epsilon = 1e-4);
                }
            }
        }
    }

    #[test]
    fn test_bsinc_integer_phase_is_exact() {
        let table = bsinc24_table();
        let row = table.row(0, 0);
        for (k, c) in row.iter().enumerate() {
            let expected = if k == 11 { 1.0 } else { 0.0 };
            assert_abs_diff_eq!(*c, expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_names_round_trip() {
        assert_eq!(ResamplerKind::from_name("bsinc12"), Some(ResamplerKind::BSinc12));
        assert_eq!(ResamplerKind::from_name("bogus"), None);
    }

    #[test]
    fn test_source_span() {
        assert_eq!(source_span(0, MIXER_FRAC_ONE, 10), 9 + MAX_RESAMPLER_EDGE);
        assert_eq!(source_span(0, MIXER_FRAC_ONE * 2, 10), 18 + MAX_RESAMPLER_EDGE);
    }
}
