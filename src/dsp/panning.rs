//! Direction to per-channel gain computation for every output layout.
//!
//! Directions are given in listener space: +X right, +Y up, -Z forward.

use super::MAX_OUTPUT_CHANNELS;
use crate::format::{AmbiLayout, AmbiScaling, Channel, DevFmtChannels};
use glam::Vec3;
use std::f32::consts::{FRAC_1_SQRT_2, FRAC_PI_2, PI, TAU};

pub const MAX_AMBI_ORDER: usize = 3;
pub const MAX_AMBI_CHANNELS: usize = (MAX_AMBI_ORDER + 1) * (MAX_AMBI_ORDER + 1);

pub type ChannelGains = [f32; MAX_OUTPUT_CHANNELS];

/// ACN index of each FuMa channel.
const FUMA_TO_ACN: [usize; MAX_AMBI_CHANNELS] = [0, 3, 1, 2, 6, 7, 5, 8, 4, 12, 13, 11, 14, 10, 15, 9];
/// ACN index of each channel of a horizontal-only stream, per layout.
const ACN_2D: [usize; 7] = [0, 1, 3, 4, 8, 9, 15];
const FUMA_2D: [usize; 7] = [0, 3, 1, 8, 4, 15, 9];

/// Scale taking a FuMa-normalised component to N3D, indexed by ACN.
const FUMA_TO_N3D: [f32; MAX_AMBI_CHANNELS] = [
    1.414_213_6,
    1.732_050_8,
    1.732_050_8,
    1.732_050_8,
    1.936_491_7,
    1.936_491_7,
    2.236_068,
    1.936_491_7,
    1.936_491_7,
    2.091_650_1,
    1.972_026_6,
    2.231_093_4,
    2.645_751_3,
    2.231_093_4,
    1.972_026_6,
    2.091_650_1,
];

fn acn_order(acn: usize) -> usize {
    match acn {
        0 => 0,
        1..=3 => 1,
        4..=8 => 2,
        _ => 3,
    }
}

/// Scale taking an N3D component to the given normalisation.
fn n3d_to(scaling: AmbiScaling, acn: usize) -> f32 {
    match scaling {
        AmbiScaling::N3d => 1.0,
        AmbiScaling::Sn3d => 1.0 / ((2 * acn_order(acn) + 1) as f32).sqrt(),
        AmbiScaling::FuMa => 1.0 / FUMA_TO_N3D[acn],
    }
}

/// ACN index and N3D scale for channel `index` of a B-Format buffer.
pub fn bformat_input(index: usize, horizontal: bool, layout: AmbiLayout, scaling: AmbiScaling) -> (usize, f32) {
    let acn = match (horizontal, layout) {
        (true, AmbiLayout::Acn) => ACN_2D[index.min(6)],
        (true, AmbiLayout::FuMa) => FUMA_2D[index.min(6)],
        (false, AmbiLayout::Acn) => index.min(MAX_AMBI_CHANNELS - 1),
        (false, AmbiLayout::FuMa) => FUMA_TO_ACN[index.min(MAX_AMBI_CHANNELS - 1)],
    };
    (acn, 1.0 / n3d_to(scaling, acn))
}

/// Third-order N3D spherical harmonics for `dir`, widened by `spread`.
pub fn calc_ambi_coeffs(dir: Vec3, spread: f32) -> [f32; MAX_AMBI_CHANNELS] {
    // Ambisonic axes: X forward, Y left, Z up.
    let x = -dir.z;
    let y = -dir.x;
    let z = dir.y;
    let (xx, yy, zz) = (x * x, y * y, z * z);
    let (xy, yz, xz) = (x * y, y * z, x * z);

    let mut coeffs = [
        1.0,
        1.732_050_8 * y,
        1.732_050_8 * z,
        1.732_050_8 * x,
        3.872_983_3 * xy,
        3.872_983_3 * yz,
        1.118_034 * (3.0 * zz - 1.0),
        3.872_983_3 * xz,
        1.936_491_7 * (xx - yy),
        2.091_650_1 * (y * (3.0 * xx - yy)),
        10.246_951 * (z * xy),
        1.620_185_2 * (y * (5.0 * zz - 1.0)),
        1.322_875_7 * (z * (5.0 * zz - 3.0)),
        1.620_185_2 * (x * (5.0 * zz - 1.0)),
        5.123_475_4 * (z * (xx - yy)),
        2.091_650_1 * (x * (xx - 3.0 * yy)),
    ];

    if spread > 0.0 {
        let ca = (spread * 0.5).cos();
        let scale = (1.0 + spread / TAU).sqrt();
        let zh = [
            scale,
            scale * 0.5 * (ca + 1.0),
            scale * 0.5 * (ca + 1.0) * ca,
            scale * 0.125 * (ca + 1.0) * (5.0 * ca * ca - 1.0),
        ];
        for (acn, c) in coeffs.iter_mut().enumerate() {
            *c *= zh[acn_order(acn)];
        }
    }
    coeffs
}

/// Nominal speaker azimuth in degrees, clockwise from the front.
fn speaker_azimuth(layout: DevFmtChannels, channel: Channel) -> Option<f32> {
    let quad = layout == DevFmtChannels::Quad;
    let x51 = layout == DevFmtChannels::X51;
    Some(match channel {
        Channel::FrontLeft if quad => -45.0,
        Channel::FrontRight if quad => 45.0,
        Channel::FrontLeft => -30.0,
        Channel::FrontRight => 30.0,
        Channel::FrontCenter => 0.0,
        Channel::BackLeft if quad => -135.0,
        Channel::BackRight if quad => 135.0,
        Channel::BackLeft => -150.0,
        Channel::BackRight => 150.0,
        Channel::BackCenter => 180.0,
        Channel::SideLeft if x51 => -110.0,
        Channel::SideRight if x51 => 110.0,
        Channel::SideLeft => -90.0,
        Channel::SideRight => 90.0,
        Channel::Lfe | Channel::Aux(_) => return None,
    })
}

#[derive(Debug, Clone)]
enum PanMode {
    Mono,
    Stereo,
    /// Output index and azimuth in radians, sorted by azimuth.
    Speakers(Vec<(usize, f32)>),
    Ambisonic {
        acn: Vec<usize>,
        scales: Vec<f32>,
    },
}

/// Computes gains into one bus layout.
#[derive(Debug, Clone)]
pub struct Panner {
    layout: DevFmtChannels,
    map: &'static [Channel],
    mode: PanMode,
}

impl Panner {
    pub fn new(layout: DevFmtChannels, ambi_layout: AmbiLayout, ambi_scaling: AmbiScaling) -> Self {
        let map = layout.channel_map();
        let mode = match layout {
            DevFmtChannels::Mono => PanMode::Mono,
            DevFmtChannels::Stereo => PanMode::Stereo,
            DevFmtChannels::Ambi3D(_) => {
                let acn: Vec<usize> = (0..map.len())
                    .map(|i| match ambi_layout {
                        AmbiLayout::Acn => i,
                        AmbiLayout::FuMa => FUMA_TO_ACN[i],
                    })
                    .collect();
                let scales = acn.iter().map(|&a| n3d_to(ambi_scaling, a)).collect();
                PanMode::Ambisonic { acn, scales }
            }
            _ => {
                let mut speakers: Vec<(usize, f32)> = map
                    .iter()
                    .enumerate()
                    .filter_map(|(i, &ch)| speaker_azimuth(layout, ch).map(|az| (i, az.to_radians())))
                    .collect();
                speakers.sort_by(|a, b| a.1.total_cmp(&b.1));
                PanMode::Speakers(speakers)
            }
        };
        Self { layout, map, mode }
    }

    pub fn layout(&self) -> DevFmtChannels {
        self.layout
    }

    pub fn channel_count(&self) -> usize {
        self.map.len()
    }

    pub fn channel_index(&self, channel: Channel) -> Option<usize> {
        self.map.iter().position(|&c| c == channel)
    }

    pub fn is_ambisonic(&self) -> bool {
        matches!(self.mode, PanMode::Ambisonic { .. })
    }

    /// Gains placing a point source in direction `dir` at the given width.
    pub fn direction_gains(&self, dir: Vec3, spread: f32, gain: f32) -> ChannelGains {
        let mut out = [0.0; MAX_OUTPUT_CHANNELS];
        let dir = dir.normalize_or_zero();
        let focus = (1.0 - spread / TAU).clamp(0.0, 1.0);
        match &self.mode {
            PanMode::Mono => out[0] = gain,
            PanMode::Stereo => {
                // sin(azimuth) * cos(elevation) of a unit vector.
                let t = (dir.x * focus + 1.0) * 0.5;
                out[0] = (t * FRAC_PI_2).cos() * gain;
                out[1] = (t * FRAC_PI_2).sin() * gain;
            }
            PanMode::Speakers(speakers) => {
                let azimuth = dir.x.atan2(-dir.z);
                let elevation = dir.y.clamp(-1.0, 1.0).asin();
                let focus = if dir == Vec3::ZERO {
                    0.0
                } else {
                    (focus * elevation.cos()).max(0.0)
                };
                let pair = pair_gains(speakers, azimuth);
                let omni = 1.0 / speakers.len() as f32;
                for &(index, _) in speakers {
                    let directed = pair
                        .iter()
                        .find(|(i, _)| *i == index)
                        .map_or(0.0, |(_, g)| *g);
                    out[index] = (focus * directed * directed + (1.0 - focus) * omni).sqrt() * gain;
                }
            }
            PanMode::Ambisonic { acn, scales } => {
                let coeffs = calc_ambi_coeffs(dir, spread);
                for (o, (&a, &s)) in out.iter_mut().zip(acn.iter().zip(scales)) {
                    *o = coeffs[a] * s * gain;
                }
            }
        }
        out
    }

    /// Gains for one N3D ambisonic input component.
    pub fn ambisonic_input_gains(&self, acn: usize, gain: f32) -> ChannelGains {
        let mut out = [0.0; MAX_OUTPUT_CHANNELS];
        match &self.mode {
            PanMode::Ambisonic { acn: map, scales } => {
                if let Some(i) = map.iter().position(|&a| a == acn) {
                    out[i] = scales[i] * gain;
                }
            }
            PanMode::Mono => {
                if acn == 0 {
                    out[0] = gain;
                }
            }
            _ => {
                // First-order sampling decode at each speaker direction.
                if acn > 3 {
                    return out;
                }
                for (i, &ch) in self.map.iter().enumerate() {
                    let Some(az) = speaker_azimuth(self.layout, ch) else {
                        continue;
                    };
                    let az = az.to_radians();
                    let dir = Vec3::new(az.sin(), 0.0, -az.cos());
                    out[i] = calc_ambi_coeffs(dir, 0.0)[acn] * 0.25 * gain;
                }
            }
        }
        out
    }
}

/// Constant-power gains for the speaker pair around `azimuth`.
fn pair_gains(speakers: &[(usize, f32)], azimuth: f32) -> [(usize, f32); 2] {
    let count = speakers.len();
    if count == 1 {
        return [(speakers[0].0, 1.0), (speakers[0].0, 0.0)];
    }
    for i in 0..count {
        let (i0, a0) = speakers[i];
        let (i1, mut a1) = speakers[(i + 1) % count];
        if i + 1 == count {
            a1 += TAU;
        }
        let mut az = azimuth;
        if az < a0 {
            az += TAU;
        }
        if az >= a0 && az <= a1 {
            let t = (az - a0) / (a1 - a0);
            return [(i0, (t * FRAC_PI_2).cos()), (i1, (t * FRAC_PI_2).sin())];
        }
    }
    // Unreachable for finite input; fall back to the nearest speaker.
    let nearest = speakers
        .iter()
        .min_by(|a, b| angle_diff(a.1, azimuth).total_cmp(&angle_diff(b.1, azimuth)))
        .map_or(0, |s| s.0);
    [(nearest, 1.0), (nearest, 0.0)]
}

fn angle_diff(a: f32, b: f32) -> f32 {
    let d = (a - b).rem_euclid(TAU);
    d.min(TAU - d)
}

/// Fallback destinations for a source channel the output lacks.
///
/// Candidates are tried in order; the first whose channels all exist wins.
pub fn remix_candidates(channel: Channel) -> &'static [&'static [(Channel, f32)]] {
    use Channel::*;
    const H: f32 = FRAC_1_SQRT_2;
    match channel {
        FrontLeft => &[&[(FrontCenter, H)]],
        FrontRight => &[&[(FrontCenter, H)]],
        FrontCenter => &[&[(FrontLeft, H), (FrontRight, H)]],
        BackLeft => &[&[(SideLeft, 1.0)], &[(FrontLeft, 1.0)], &[(FrontCenter, H)]],
        BackRight => &[&[(SideRight, 1.0)], &[(FrontRight, 1.0)], &[(FrontCenter, H)]],
        SideLeft => &[&[(BackLeft, 1.0)], &[(FrontLeft, 1.0)], &[(FrontCenter, H)]],
        SideRight => &[&[(BackRight, 1.0)], &[(FrontRight, 1.0)], &[(FrontCenter, H)]],
        BackCenter => &[
            &[(BackLeft, H), (BackRight, H)],
            &[(SideLeft, H), (SideRight, H)],
            &[(FrontLeft, H), (FrontRight, H)],
            &[(FrontCenter, H)],
        ],
        Lfe | Aux(_) => &[],
    }
}

/// Virtual speaker angle in radians for a non-spatialised source channel.
pub fn source_channel_azimuth(channel: Channel) -> f32 {
    match channel {
        Channel::FrontLeft => -PI / 6.0,
        Channel::FrontRight => PI / 6.0,
        Channel::BackLeft => -PI * 5.0 / 6.0,
        Channel::BackRight => PI * 5.0 / 6.0,
        Channel::BackCenter => PI,
        Channel::SideLeft => -FRAC_PI_2,
        Channel::SideRight => FRAC_PI_2,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn stereo() -> Panner {
        Panner::new(DevFmtChannels::Stereo, AmbiLayout::Acn, AmbiScaling::N3d)
    }

    #[test]
    fn test_stereo_center_is_equal_power() {
        let g = stereo().direction_gains(Vec3::NEG_Z, 0.0, 1.0);
        assert_abs_diff_eq!(g[0], FRAC_1_SQRT_2, epsilon = 1e-6);
        assert_abs_diff_eq!(g[1], FRAC_1_SQRT_2, epsilon = 1e-6);
    }

    #[test]
    fn test_stereo_hard_right() {
        let g = stereo().direction_gains(Vec3::X, 0.0, 1.0);
        assert_abs_diff_eq!(g[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(g[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_speaker_pair_and_power() {
        let panner = Panner::new(DevFmtChannels::X51, AmbiLayout::Acn, AmbiScaling::N3d);
        // Exactly at the front-right speaker.
        let az = 30.0f32.to_radians();
        let g = panner.direction_gains(Vec3::new(az.sin(), 0.0, -az.cos()), 0.0, 1.0);
        assert_abs_diff_eq!(g[1], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(g[3], 0.0);
        // Between front-right and side-right.
        let az = 70.0f32.to_radians();
        let g = panner.direction_gains(Vec3::new(az.sin(), 0.0, -az.cos()), 0.0, 1.0);
        let power: f32 = g.iter().map(|x| x * x).sum();
        assert_abs_diff_eq!(power, 1.0, epsilon = 1e-5);
        assert!(g[1] > 0.0 && g[5] > 0.0);
    }

    #[test]
    fn test_overhead_spreads_evenly() {
        let panner = Panner::new(DevFmtChannels::Quad, AmbiLayout::Acn, AmbiScaling::N3d);
        let g = panner.direction_gains(Vec3::Y, 0.0, 1.0);
        for v in &g[..4] {
            assert_abs_diff_eq!(*v, 0.5, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_ambi_front_coefficients() {
        let c = calc_ambi_coeffs(Vec3::NEG_Z, 0.0);
        assert_abs_diff_eq!(c[0], 1.0);
        assert_abs_diff_eq!(c[1], 0.0);
        assert_abs_diff_eq!(c[3], 1.732_050_8, epsilon = 1e-6);
    }

    #[test]
    fn test_fuma_output_ordering_and_scale() {
        let panner = Panner::new(DevFmtChannels::Ambi3D(1), AmbiLayout::FuMa, AmbiScaling::FuMa);
        let g = panner.direction_gains(Vec3::NEG_Z, 0.0, 1.0);
        // W, X, Y, Z with FuMa weights.
        assert_abs_diff_eq!(g[0], FRAC_1_SQRT_2, epsilon = 1e-5);
        assert_abs_diff_eq!(g[1], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(g[2], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_bformat_input_mapping() {
        let (acn, scale) = bformat_input(1, false, AmbiLayout::FuMa, AmbiScaling::FuMa);
        assert_eq!(acn, 3);
        assert_abs_diff_eq!(scale, 1.732_050_8, epsilon = 1e-6);
        let (acn, scale) = bformat_input(2, true, AmbiLayout::Acn, AmbiScaling::Sn3d);
        assert_eq!(acn, 3);
        assert_abs_diff_eq!(scale, 1.732_050_8, epsilon = 1e-6);
    }

    #[test]
    fn test_first_order_decode_of_front_wave() {
        let panner = stereo();
        let w = panner.ambisonic_input_gains(0, 1.0);
        let x = panner.ambisonic_input_gains(3, 1.732_050_8);
        let left = w[0] + x[0];
        assert_abs_diff_eq!(left, 0.25 + 0.75 * 30.0f32.to_radians().cos(), epsilon = 1e-5);
    }

    #[test]
    fn test_remix_center_to_stereo() {
        let candidates = remix_candidates(Channel::FrontCenter);
        assert_eq!(candidates[0].len(), 2);
        assert!(remix_candidates(Channel::Lfe).is_empty());
    }
}
