//! Configuration for alsonic devices and contexts

use crate::dsp::resampler::ResamplerKind;
use crate::error::{AlError, Result};
use crate::format::{AmbiLayout, AmbiScaling, DevFmtChannels, DevFmtType};

/// Maximum number of auxiliary sends a source can carry.
pub const MAX_SENDS: usize = 6;

/// Whether binaural rendering is used for stereo output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HrtfMode {
    #[default]
    Off,
    On,
    /// Enabled for stereo output when the stereo encoding asks for it.
    Auto,
}

/// How stereo output is produced from the internal mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StereoEncoding {
    /// Pairwise speaker panning.
    #[default]
    Basic,
    /// First-order B-Format mix encoded to two-channel UHJ.
    Uhj,
    /// Binaural rendering.
    Hrtf,
}

/// Device configuration, applied at open and on every reset.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDesc {
    pub sample_rate: u32,
    pub channels: DevFmtChannels,
    pub sample_type: DevFmtType,
    pub ambi_layout: AmbiLayout,
    pub ambi_scaling: AmbiScaling,
    /// Frames per mixing block.
    pub update_size: usize,
    /// Blocks in the backend ring.
    pub num_updates: usize,
    pub resampler: ResamplerKind,
    pub hrtf: HrtfMode,
    pub stereo_encoding: StereoEncoding,
    /// `None` enables the limiter for integer sample types only.
    pub output_limiter: Option<bool>,
    pub dither: bool,
    /// Dither depth in bits, 0 to use the sample type's width.
    pub dither_depth: u32,
    pub num_aux_sends: usize,
    /// Average speaker distance in meters for near-field compensation, 0 disables it.
    pub speaker_distance: f32,
    /// Master gain adjustment in decibels.
    pub volume_adjust_db: f32,
    pub max_buffers: Option<usize>,
}

impl Default for DeviceDesc {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: DevFmtChannels::Stereo,
            sample_type: DevFmtType::F32,
            ambi_layout: AmbiLayout::Acn,
            ambi_scaling: AmbiScaling::Sn3d,
            update_size: 512,
            num_updates: 3,
            resampler: ResamplerKind::Linear,
            hrtf: HrtfMode::Off,
            stereo_encoding: StereoEncoding::Basic,
            output_limiter: None,
            dither: true,
            dither_depth: 0,
            num_aux_sends: 2,
            speaker_distance: 0.0,
            volume_adjust_db: 0.0,
            max_buffers: None,
        }
    }
}

impl DeviceDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn channels(mut self, channels: DevFmtChannels) -> Self {
        self.channels = channels;
        self
    }

    pub fn sample_type(mut self, sample_type: DevFmtType) -> Self {
        self.sample_type = sample_type;
        self
    }

    pub fn ambisonics(mut self, layout: AmbiLayout, scaling: AmbiScaling) -> Self {
        self.ambi_layout = layout;
        self.ambi_scaling = scaling;
        self
    }

    pub fn update_size(mut self, frames: usize) -> Self {
        self.update_size = frames;
        self
    }

    pub fn num_updates(mut self, count: usize) -> Self {
        self.num_updates = count;
        self
    }

    pub fn resampler(mut self, resampler: ResamplerKind) -> Self {
        self.resampler = resampler;
        self
    }

    pub fn hrtf(mut self, mode: HrtfMode) -> Self {
        self.hrtf = mode;
        self
    }

    pub fn stereo_encoding(mut self, encoding: StereoEncoding) -> Self {
        self.stereo_encoding = encoding;
        self
    }

    pub fn output_limiter(mut self, enable: bool) -> Self {
        self.output_limiter = Some(enable);
        self
    }

    pub fn dither(mut self, enable: bool) -> Self {
        self.dither = enable;
        self
    }

    pub fn num_aux_sends(mut self, sends: usize) -> Self {
        self.num_aux_sends = sends;
        self
    }

    pub fn speaker_distance(mut self, meters: f32) -> Self {
        self.speaker_distance = meters;
        self
    }

    pub fn volume_adjust_db(mut self, db: f32) -> Self {
        self.volume_adjust_db = db;
        self
    }

    /// Checks every field against the ranges the mixer supports.
    pub fn validate(&self) -> Result<()> {
        if !(8000..=192000).contains(&self.sample_rate) {
            return Err(AlError::Configuration(format!(
                "sample rate {} outside 8000..=192000",
                self.sample_rate
            )));
        }
        if !(64..=8192).contains(&self.update_size) {
            return Err(AlError::Configuration(format!(
                "update size {} outside 64..=8192",
                self.update_size
            )));
        }
        if !(2..=16).contains(&self.num_updates) {
            return Err(AlError::Configuration(format!(
                "update count {} outside 2..=16",
                self.num_updates
            )));
        }
        if let DevFmtChannels::Ambi3D(order) = self.channels {
            if !(1..=3).contains(&order) {
                return Err(AlError::Configuration(format!(
                    "ambisonic order {} outside 1..=3",
                    order
                )));
            }
        }
        if self.num_aux_sends > MAX_SENDS {
            return Err(AlError::Configuration(format!(
                "{} sends exceeds the maximum of {}",
                self.num_aux_sends, MAX_SENDS
            )));
        }
        if !(self.speaker_distance >= 0.0 && self.speaker_distance.is_finite()) {
            return Err(AlError::Configuration(format!(
                "invalid speaker distance {}",
                self.speaker_distance
            )));
        }
        if !(-24.0..=24.0).contains(&self.volume_adjust_db) {
            return Err(AlError::Configuration(format!(
                "volume adjust {}dB outside -24..=24",
                self.volume_adjust_db
            )));
        }
        if self.dither_depth > 24 {
            return Err(AlError::Configuration(format!(
                "dither depth {} exceeds 24 bits",
                self.dither_depth
            )));
        }
        Ok(())
    }

    /// Whether the output limiter runs for this configuration.
    pub fn limiter_enabled(&self) -> bool {
        self.output_limiter
            .unwrap_or_else(|| self.sample_type.is_integer())
    }

    /// Gain applied to every context from `volume_adjust_db`.
    pub fn gain_boost(&self) -> f32 {
        10.0f32.powf(self.volume_adjust_db.clamp(-24.0, 24.0) / 20.0)
    }

    /// Dither depth in bits, or `None` when dithering is off for this format.
    pub fn effective_dither_depth(&self) -> Option<u32> {
        if !self.dither || !self.sample_type.is_integer() {
            return None;
        }
        let bits = self.sample_type.bits();
        Some(match self.dither_depth {
            0 => bits,
            depth => depth.min(bits),
        })
    }

    /// Builds a description from `alsoft.conf`-style `[general]` keys.
    ///
    /// Unknown keys are ignored; malformed values are a configuration error.
    pub fn from_key_values<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut desc = Self::default();
        for (key, value) in pairs {
            let value = value.trim();
            match key.trim() {
                "frequency" => desc.sample_rate = parse_num(key, value)?,
                "period_size" => desc.update_size = parse_num(key, value)?,
                "periods" => desc.num_updates = parse_num(key, value)?,
                "sends" => desc.num_aux_sends = parse_num(key, value)?,
                "dither-depth" => desc.dither_depth = parse_num(key, value)?,
                "speaker-distance" => desc.speaker_distance = parse_num(key, value)?,
                "volume-adjust" => desc.volume_adjust_db = parse_num(key, value)?,
                "dither" => desc.dither = parse_bool(key, value)?,
                "output-limiter" => desc.output_limiter = Some(parse_bool(key, value)?),
                "channels" => {
                    desc.channels = match value.to_ascii_lowercase().as_str() {
                        "mono" => DevFmtChannels::Mono,
                        "stereo" => DevFmtChannels::Stereo,
                        "quad" => DevFmtChannels::Quad,
                        "surround51" | "5.1" => DevFmtChannels::X51,
                        "surround61" | "6.1" => DevFmtChannels::X61,
                        "surround71" | "7.1" => DevFmtChannels::X71,
                        "ambi1" => DevFmtChannels::Ambi3D(1),
                        "ambi2" => DevFmtChannels::Ambi3D(2),
                        "ambi3" => DevFmtChannels::Ambi3D(3),
                        _ => return Err(bad_value(key, value)),
                    }
                }
                "sample-type" => {
                    desc.sample_type = match value.to_ascii_lowercase().as_str() {
                        "int8" => DevFmtType::I8,
                        "uint8" => DevFmtType::U8,
                        "int16" => DevFmtType::I16,
                        "uint16" => DevFmtType::U16,
                        "int32" => DevFmtType::I32,
                        "uint32" => DevFmtType::U32,
                        "float32" => DevFmtType::F32,
                        _ => return Err(bad_value(key, value)),
                    }
                }
                "resampler" => {
                    desc.resampler = ResamplerKind::from_name(value)
                        .ok_or_else(|| bad_value(key, value))?
                }
                "hrtf" => {
                    desc.hrtf = match value.to_ascii_lowercase().as_str() {
                        "true" | "on" => HrtfMode::On,
                        "false" | "off" => HrtfMode::Off,
                        "auto" | "" => HrtfMode::Auto,
                        _ => return Err(bad_value(key, value)),
                    }
                }
                "stereo-encoding" => {
                    desc.stereo_encoding = match value.to_ascii_lowercase().as_str() {
                        "panpot" | "basic" => StereoEncoding::Basic,
                        "uhj" => StereoEncoding::Uhj,
                        "hrtf" => StereoEncoding::Hrtf,
                        _ => return Err(bad_value(key, value)),
                    }
                }
                "ambi-format" => {
                    let (layout, scaling) = match value.to_ascii_lowercase().as_str() {
                        "fuma" => (AmbiLayout::FuMa, AmbiScaling::FuMa),
                        "acn+sn3d" | "ambix" => (AmbiLayout::Acn, AmbiScaling::Sn3d),
                        "acn+n3d" => (AmbiLayout::Acn, AmbiScaling::N3d),
                        _ => return Err(bad_value(key, value)),
                    };
                    desc.ambi_layout = layout;
                    desc.ambi_scaling = scaling;
                }
                other => log::debug!("ignoring unknown config key '{}'", other),
            }
        }
        desc.validate()?;
        Ok(desc)
    }
}

fn bad_value(key: &str, value: &str) -> AlError {
    AlError::Configuration(format!("invalid value '{}' for '{}'", value, key))
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| bad_value(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(bad_value(key, value)),
    }
}

/// Per-context configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextDesc {
    /// Force-stop every voice when the device disconnects.
    pub stop_sources_on_disconnect: bool,
    pub initial_voices: usize,
    pub max_sources: Option<usize>,
    pub max_effect_slots: Option<usize>,
    /// Capacity of the async event ring.
    pub event_capacity: usize,
}

impl Default for ContextDesc {
    fn default() -> Self {
        Self {
            stop_sources_on_disconnect: true,
            initial_voices: 64,
            max_sources: None,
            max_effect_slots: Some(64),
            event_capacity: 511,
        }
    }
}

impl ContextDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_sources_on_disconnect(mut self, stop: bool) -> Self {
        self.stop_sources_on_disconnect = stop;
        self
    }

    pub fn initial_voices(mut self, count: usize) -> Self {
        self.initial_voices = count;
        self
    }

    pub fn max_sources(mut self, max: usize) -> Self {
        self.max_sources = Some(max);
        self
    }

    pub fn max_effect_slots(mut self, max: usize) -> Self {
        self.max_effect_slots = Some(max);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(DeviceDesc::default().validate().is_ok());
        assert!(!DeviceDesc::default().limiter_enabled());
        assert!(DeviceDesc::new().sample_type(DevFmtType::I16).limiter_enabled());
    }

    #[test]
    fn test_range_checks() {
        assert!(DeviceDesc::new().sample_rate(4000).validate().is_err());
        assert!(DeviceDesc::new().update_size(32).validate().is_err());
        assert!(DeviceDesc::new().num_updates(1).validate().is_err());
        assert!(DeviceDesc::new().num_aux_sends(7).validate().is_err());
        assert!(
            DeviceDesc::new()
                .channels(DevFmtChannels::Ambi3D(4))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_from_key_values() {
        let desc = DeviceDesc::from_key_values([
            ("frequency", "44100"),
            ("channels", "surround51"),
            ("sample-type", "int16"),
            ("period_size", "256"),
            ("resampler", "bsinc24"),
            ("output-limiter", "false"),
            ("sends", "4"),
            ("unrelated", "x"),
        ])
        .unwrap();
        assert_eq!(desc.sample_rate, 44100);
        assert_eq!(desc.channels, DevFmtChannels::X51);
        assert_eq!(desc.sample_type, DevFmtType::I16);
        assert_eq!(desc.update_size, 256);
        assert_eq!(desc.resampler, ResamplerKind::BSinc24);
        assert!(!desc.limiter_enabled());
        assert_eq!(desc.num_aux_sends, 4);

        assert!(DeviceDesc::from_key_values([("channels", "hexagon")]).is_err());
        assert!(DeviceDesc::from_key_values([("frequency", "fast")]).is_err());
    }

    #[test]
    fn test_dither_depth() {
        let desc = DeviceDesc::new().sample_type(DevFmtType::I16);
        assert_eq!(desc.effective_dither_depth(), Some(16));
        assert_eq!(DeviceDesc::new().effective_dither_depth(), None);
        assert_eq!(desc.dither(false).effective_dither_depth(), None);
    }
}
