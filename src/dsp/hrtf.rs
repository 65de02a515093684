//! Binaural rendering with head-related impulse responses.
//!
//! The built-in store models a rigid spherical head: a one-pole/one-zero
//! head-shadow filter per ear plus an interaural time difference, sampled on
//! a regular elevation/azimuth grid. Lookups blend the four nearest grid
//! points.

use super::{BUFFER_LINE_SIZE, SPEED_OF_SOUND_METERS_PER_SEC};
use std::f32::consts::{FRAC_1_SQRT_2, FRAC_PI_2, TAU};

pub const HRIR_LENGTH: usize = 32;
pub const MAX_HRIR_DELAY: usize = 127;
/// Input history kept per channel; covers the longest delay plus the IR.
pub const HRTF_HISTORY_LENGTH: usize = 160;

const _: () = assert!(HRTF_HISTORY_LENGTH >= MAX_HRIR_DELAY + HRIR_LENGTH);

/// Per-tap left/right coefficients.
pub type HrirArray = [[f32; 2]; HRIR_LENGTH];

const HEAD_RADIUS: f32 = 0.0875;
const ELEVATION_STEP_DEG: i32 = 30;
const AZIMUTH_STEP_DEG: usize = 10;

struct Elevation {
    azimuths: usize,
    offset: usize,
}

/// A set of measured (or modelled) responses for one sample rate.
pub struct HrtfStore {
    sample_rate: u32,
    elevations: Vec<Elevation>,
    coeffs: Vec<HrirArray>,
    delays: Vec<[f32; 2]>,
}

impl std::fmt::Debug for HrtfStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HrtfStore")
            .field("sample_rate", &self.sample_rate)
            .field("responses", &self.coeffs.len())
            .finish()
    }
}

impl HrtfStore {
    /// Builds the spherical-head model for `sample_rate`.
    pub fn spherical_head(sample_rate: u32) -> Self {
        let fs = sample_rate as f32;
        let mut elevations = Vec::new();
        let mut coeffs = Vec::new();
        let mut delays = Vec::new();

        let mut elev_deg: i32 = -90;
        while elev_deg <= 90 {
            let azimuths = if elev_deg.abs() == 90 {
                1
            } else {
                360 / AZIMUTH_STEP_DEG
            };
            elevations.push(Elevation {
                azimuths,
                offset: coeffs.len(),
            });
            let elev = (elev_deg as f32).to_radians();
            for a in 0..azimuths {
                let azim = ((a * AZIMUTH_STEP_DEG) as f32).to_radians();
                let dir = [azim.sin() * elev.cos(), elev.sin(), -azim.cos() * elev.cos()];
                let mut ir = [[0.0f32; 2]; HRIR_LENGTH];
                let mut delay = [0.0f32; 2];
                for (ear, axis) in [-1.0f32, 1.0].into_iter().enumerate() {
                    let incidence = (dir[0] * axis).clamp(-1.0, 1.0).acos();
                    let taps = shadow_response(incidence, fs);
                    for (k, tap) in taps.iter().enumerate() {
                        ir[k][ear] = *tap;
                    }
                    delay[ear] = interaural_delay(incidence, fs);
                }
                coeffs.push(ir);
                delays.push(delay);
            }
            elev_deg += ELEVATION_STEP_DEG;
        }

        log::debug!(
            "built spherical-head HRTF at {}hz with {} responses",
            sample_rate,
            coeffs.len()
        );
        Self {
            sample_rate,
            elevations,
            coeffs,
            delays,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Blended response for a direction, in radians.
    ///
    /// Azimuth is clockwise from the front and elevation upward. `spread`
    /// (0 to 2π) blends the response toward an omnidirectional pass-through.
    pub fn get_coeffs(&self, elevation: f32, azimuth: f32, spread: f32, gain: f32) -> HrtfFilter {
        let dirfact = 1.0 - spread / TAU;

        let ev_pos = (elevation.clamp(-FRAC_PI_2, FRAC_PI_2) + FRAC_PI_2)
            / (ELEVATION_STEP_DEG as f32).to_radians();
        let ev0 = (ev_pos.floor() as usize).min(self.elevations.len() - 2);
        let ev_frac = (ev_pos - ev0 as f32).clamp(0.0, 1.0);

        let mut idx = [0usize; 4];
        let mut blend = [0.0f32; 4];
        for (row, ev, weight) in [(0, ev0, 1.0 - ev_frac), (1, ev0 + 1, ev_frac)] {
            let elev = &self.elevations[ev];
            let az_pos = azimuth.rem_euclid(TAU) / TAU * elev.azimuths as f32;
            let az0 = (az_pos.floor() as usize) % elev.azimuths;
            let az1 = (az0 + 1) % elev.azimuths;
            let az_frac = az_pos - az_pos.floor();
            idx[row * 2] = elev.offset + az0;
            idx[row * 2 + 1] = elev.offset + az1;
            blend[row * 2] = weight * (1.0 - az_frac) * dirfact;
            blend[row * 2 + 1] = weight * az_frac * dirfact;
        }

        let mut coeffs = [[0.0f32; 2]; HRIR_LENGTH];
        coeffs[0] = [FRAC_1_SQRT_2 * (1.0 - dirfact); 2];
        let mut delay = [0.0f32; 2];
        for (&i, &w) in idx.iter().zip(&blend) {
            for (dst, src) in coeffs.iter_mut().zip(&self.coeffs[i]) {
                dst[0] += src[0] * w;
                dst[1] += src[1] * w;
            }
            delay[0] += self.delays[i][0] * w;
            delay[1] += self.delays[i][1] * w;
        }

        HrtfFilter {
            coeffs,
            delay: [
                (delay[0].round() as usize).min(MAX_HRIR_DELAY),
                (delay[1].round() as usize).min(MAX_HRIR_DELAY),
            ],
            gain,
        }
    }
}

/// Head-shadow impulse response for a given angle from the ear axis.
fn shadow_response(incidence: f32, fs: f32) -> [f32; HRIR_LENGTH] {
    let w0 = SPEED_OF_SOUND_METERS_PER_SEC / HEAD_RADIUS;
    let alpha = 1.05 + 0.95 * (incidence * 180.0 / 150.0).cos();
    let k = 2.0 * fs;
    let norm = 2.0 * w0 + k;
    let b0 = (2.0 * w0 + alpha * k) / norm;
    let b1 = (2.0 * w0 - alpha * k) / norm;
    let a1 = (2.0 * w0 - k) / norm;

    let mut ir = [0.0f32; HRIR_LENGTH];
    ir[0] = b0;
    ir[1] = b1 - a1 * b0;
    for n in 2..HRIR_LENGTH {
        ir[n] = -a1 * ir[n - 1];
    }
    ir
}

/// Arrival delay in samples, zero for a source on the ear axis.
fn interaural_delay(incidence: f32, fs: f32) -> f32 {
    let radius_time = HEAD_RADIUS / SPEED_OF_SOUND_METERS_PER_SEC;
    let tau = if incidence < FRAC_PI_2 {
        -radius_time * incidence.cos()
    } else {
        radius_time * (incidence - FRAC_PI_2)
    };
    ((tau + radius_time) * fs).clamp(0.0, MAX_HRIR_DELAY as f32)
}

/// A response ready for mixing: coefficients, per-ear delay and gain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HrtfFilter {
    pub coeffs: HrirArray,
    pub delay: [usize; 2],
    pub gain: f32,
}

impl Default for HrtfFilter {
    fn default() -> Self {
        Self {
            coeffs: [[0.0; 2]; HRIR_LENGTH],
            delay: [0; 2],
            gain: 0.0,
        }
    }
}

impl HrtfFilter {
    fn convolve(&self, buf: &[f32], base: usize, ear: usize) -> f32 {
        let start = base - self.delay[ear];
        self.coeffs
            .iter()
            .enumerate()
            .map(|(k, c)| c[ear] * buf[start - k])
            .sum::<f32>()
            * self.gain
    }
}

/// Per-channel binaural state kept by a voice.
#[derive(Debug, Clone)]
pub struct HrtfChannelState {
    history: [f32; HRTF_HISTORY_LENGTH],
    pub old: HrtfFilter,
    pub target: HrtfFilter,
}

impl Default for HrtfChannelState {
    fn default() -> Self {
        Self {
            history: [0.0; HRTF_HISTORY_LENGTH],
            old: HrtfFilter::default(),
            target: HrtfFilter::default(),
        }
    }
}

impl HrtfChannelState {
    pub fn clear(&mut self) {
        self.history = [0.0; HRTF_HISTORY_LENGTH];
        self.old = HrtfFilter::default();
    }

    /// Convolves `input` into `left` and `right` starting at `out_pos`.
    ///
    /// When the target differs from the previous response the two are
    /// crossfaded over `fade_len` samples.
    pub fn mix(
        &mut self,
        input: &[f32],
        left: &mut [f32],
        right: &mut [f32],
        out_pos: usize,
        fade_len: usize,
    ) {
        let count = input.len();
        let mut buf = [0.0f32; HRTF_HISTORY_LENGTH + BUFFER_LINE_SIZE];
        buf[..HRTF_HISTORY_LENGTH].copy_from_slice(&self.history);
        buf[HRTF_HISTORY_LENGTH..HRTF_HISTORY_LENGTH + count].copy_from_slice(input);

        let fading = self.old != self.target && fade_len > 0;
        for i in 0..count {
            let base = HRTF_HISTORY_LENGTH + i;
            let mut l = self.target.convolve(&buf, base, 0);
            let mut r = self.target.convolve(&buf, base, 1);
            if fading && i < fade_len {
                let t = i as f32 / fade_len as f32;
                l = l * t + self.old.convolve(&buf, base, 0) * (1.0 - t);
                r = r * t + self.old.convolve(&buf, base, 1) * (1.0 - t);
            }
            left[out_pos + i] += l;
            right[out_pos + i] += r;
        }

        self.history
            .copy_from_slice(&buf[count..count + HRTF_HISTORY_LENGTH]);
        self.old = self.target;
    }
}

/// Azimuth (clockwise from front) and elevation of a listener-space vector.
pub fn direction_angles(x: f32, y: f32, z: f32) -> (f32, f32) {
    let len = (x * x + y * y + z * z).sqrt();
    if len <= f32::EPSILON {
        return (0.0, 0.0);
    }
    let elevation = (y / len).clamp(-1.0, 1.0).asin();
    let mut azimuth = x.atan2(-z);
    if azimuth < 0.0 {
        azimuth += TAU;
    }
    if azimuth >= TAU {
        azimuth -= TAU;
    }
    (azimuth, elevation)
}
