//! Sample formats and channel layouts for devices and buffers.

use crate::error::{AlError, Result};

/// Speaker/channel labels used by the device output map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    FrontLeft,
    FrontRight,
    FrontCenter,
    Lfe,
    BackLeft,
    BackRight,
    BackCenter,
    SideLeft,
    SideRight,
    /// Ambisonic component in ACN order.
    Aux(u8),
}

/// Output channel layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevFmtChannels {
    Mono,
    Stereo,
    Quad,
    X51,
    X61,
    X71,
    Ambi3D(u8),
}

const MONO_MAP: &[Channel] = &[Channel::FrontCenter];
const STEREO_MAP: &[Channel] = &[Channel::FrontLeft, Channel::FrontRight];
const QUAD_MAP: &[Channel] = &[
    Channel::FrontLeft,
    Channel::FrontRight,
    Channel::BackLeft,
    Channel::BackRight,
];
const X51_MAP: &[Channel] = &[
    Channel::FrontLeft,
    Channel::FrontRight,
    Channel::FrontCenter,
    Channel::Lfe,
    Channel::SideLeft,
    Channel::SideRight,
];
const X61_MAP: &[Channel] = &[
    Channel::FrontLeft,
    Channel::FrontRight,
    Channel::FrontCenter,
    Channel::Lfe,
    Channel::BackCenter,
    Channel::SideLeft,
    Channel::SideRight,
];
const X71_MAP: &[Channel] = &[
    Channel::FrontLeft,
    Channel::FrontRight,
    Channel::FrontCenter,
    Channel::Lfe,
    Channel::BackLeft,
    Channel::BackRight,
    Channel::SideLeft,
    Channel::SideRight,
];
const AMBI_MAP: &[Channel] = &[
    Channel::Aux(0),
    Channel::Aux(1),
    Channel::Aux(2),
    Channel::Aux(3),
    Channel::Aux(4),
    Channel::Aux(5),
    Channel::Aux(6),
    Channel::Aux(7),
    Channel::Aux(8),
    Channel::Aux(9),
    Channel::Aux(10),
    Channel::Aux(11),
    Channel::Aux(12),
    Channel::Aux(13),
    Channel::Aux(14),
    Channel::Aux(15),
];

impl DevFmtChannels {
    pub fn count(self) -> usize {
        self.channel_map().len()
    }

    /// Output channel labels in interleaving order.
    pub fn channel_map(self) -> &'static [Channel] {
        match self {
            Self::Mono => MONO_MAP,
            Self::Stereo => STEREO_MAP,
            Self::Quad => QUAD_MAP,
            Self::X51 => X51_MAP,
            Self::X61 => X61_MAP,
            Self::X71 => X71_MAP,
            Self::Ambi3D(order) => {
                let order = usize::from(order.clamp(1, 3));
                &AMBI_MAP[..(order + 1) * (order + 1)]
            }
        }
    }

    pub fn ambi_order(self) -> u8 {
        match self {
            Self::Ambi3D(order) => order,
            _ => 0,
        }
    }
}

/// Output sample types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevFmtType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
}

impl DevFmtType {
    pub fn bytes(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, Self::F32)
    }

    /// Significant bits of an integer output type.
    pub fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }
}

/// Channel ordering of ambisonic data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AmbiLayout {
    FuMa,
    #[default]
    Acn,
}

/// Normalisation of ambisonic data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AmbiScaling {
    FuMa,
    #[default]
    Sn3d,
    N3d,
}

/// Buffer channel configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FmtChannels {
    Mono,
    Stereo,
    Rear,
    Quad,
    X51,
    X61,
    X71,
    BFormat2D,
    BFormat3D,
}

impl FmtChannels {
    /// Number of interleaved channels for the given ambisonic order.
    pub fn count(self, ambi_order: u8) -> usize {
        let order = usize::from(ambi_order);
        match self {
            Self::Mono => 1,
            Self::Stereo | Self::Rear => 2,
            Self::Quad => 4,
            Self::X51 => 6,
            Self::X61 => 7,
            Self::X71 => 8,
            Self::BFormat2D => order * 2 + 1,
            Self::BFormat3D => (order + 1) * (order + 1),
        }
    }

    pub fn is_bformat(self) -> bool {
        matches!(self, Self::BFormat2D | Self::BFormat3D)
    }

    /// Speaker labels of a non-ambisonic layout, empty for B-Format.
    pub fn channel_map(self) -> &'static [Channel] {
        match self {
            Self::Mono => MONO_MAP,
            Self::Stereo => STEREO_MAP,
            Self::Rear => &[Channel::BackLeft, Channel::BackRight],
            Self::Quad => QUAD_MAP,
            Self::X51 => X51_MAP,
            Self::X61 => X61_MAP,
            Self::X71 => X71_MAP,
            Self::BFormat2D | Self::BFormat3D => &[],
        }
    }
}

/// Storage sample types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FmtType {
    UByte,
    Short,
    Float,
    Double,
    Mulaw,
    Alaw,
}

impl FmtType {
    pub fn bytes(self) -> usize {
        match self {
            Self::UByte | Self::Mulaw | Self::Alaw => 1,
            Self::Short => 2,
            Self::Float => 4,
            Self::Double => 8,
        }
    }
}

/// Sample types accepted when storing buffer data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserFmtType {
    UByte,
    Short,
    Float,
    Double,
    Mulaw,
    Alaw,
    Ima4,
    MsAdpcm,
}

impl UserFmtType {
    /// The type stored once the data has been loaded.
    pub fn storage(self) -> FmtType {
        match self {
            Self::UByte => FmtType::UByte,
            Self::Short | Self::Ima4 | Self::MsAdpcm => FmtType::Short,
            Self::Float => FmtType::Float,
            Self::Double => FmtType::Double,
            Self::Mulaw => FmtType::Mulaw,
            Self::Alaw => FmtType::Alaw,
        }
    }

    pub fn is_adpcm(self) -> bool {
        matches!(self, Self::Ima4 | Self::MsAdpcm)
    }

    /// Bytes taken by one block of `align` frames for `channels` channels.
    pub fn block_bytes(self, align: usize, channels: usize) -> usize {
        match self {
            Self::Ima4 => ((align - 1) / 2 + 4) * channels,
            Self::MsAdpcm => ((align - 2) / 2 + 7) * channels,
            other => other.storage().bytes() * channels,
        }
    }

    /// Validates and resolves a block alignment, 0 selecting the default.
    pub fn sanitize_alignment(self, align: u32) -> Result<usize> {
        let align = align as usize;
        match self {
            Self::Ima4 => {
                let align = if align == 0 { 65 } else { align };
                if align & 7 != 1 {
                    return Err(AlError::InvalidValue(format!(
                        "invalid IMA4 block alignment {}",
                        align
                    )));
                }
                Ok(align)
            }
            Self::MsAdpcm => {
                let align = if align == 0 { 64 } else { align };
                if align & 1 != 0 || align < 2 {
                    return Err(AlError::InvalidValue(format!(
                        "invalid MSADPCM block alignment {}",
                        align
                    )));
                }
                Ok(align)
            }
            _ => Ok(1),
        }
    }
}

/// A channel configuration paired with an input sample type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferFormat {
    pub channels: FmtChannels,
    pub sample_type: UserFmtType,
}

impl BufferFormat {
    pub const MONO8: Self = Self::new(FmtChannels::Mono, UserFmtType::UByte);
    pub const MONO16: Self = Self::new(FmtChannels::Mono, UserFmtType::Short);
    pub const MONO_FLOAT32: Self = Self::new(FmtChannels::Mono, UserFmtType::Float);
    pub const STEREO8: Self = Self::new(FmtChannels::Stereo, UserFmtType::UByte);
    pub const STEREO16: Self = Self::new(FmtChannels::Stereo, UserFmtType::Short);
    pub const STEREO_FLOAT32: Self = Self::new(FmtChannels::Stereo, UserFmtType::Float);

    pub const fn new(channels: FmtChannels, sample_type: UserFmtType) -> Self {
        Self {
            channels,
            sample_type,
        }
    }
}

/// Decodes one µ-law byte to a 16-bit sample.
pub fn mulaw_to_i16(value: u8) -> i16 {
    let value = !value;
    let sign = value & 0x80;
    let exponent = i32::from((value >> 4) & 0x07);
    let mantissa = i32::from(value & 0x0f);
    let sample = (((mantissa << 3) + 0x84) << exponent) - 0x84;
    (if sign != 0 { -sample } else { sample }) as i16
}

/// Decodes one A-law byte to a 16-bit sample.
pub fn alaw_to_i16(value: u8) -> i16 {
    let value = value ^ 0x55;
    let sign = value & 0x80;
    let exponent = i32::from((value >> 4) & 0x07);
    let mantissa = i32::from(value & 0x0f);
    let sample = if exponent == 0 {
        (mantissa << 4) + 8
    } else {
        ((mantissa << 4) + 0x108) << (exponent - 1)
    };
    (if sign != 0 { sample } else { -sample }) as i16
}

/// Converts `dst.len()` samples of one channel from interleaved storage.
///
/// `src` starts at the first sample to read; `stride` is the number of
/// interleaved channels.
pub(crate) fn load_samples(dst: &mut [f32], src: &[u8], stride: usize, ty: FmtType) {
    let bytes = ty.bytes();
    let step = stride * bytes;
    for (i, out) in dst.iter_mut().enumerate() {
        let at = i * step;
        let raw = &src[at..at + bytes];
        *out = match ty {
            FmtType::UByte => (f32::from(raw[0]) - 128.0) * (1.0 / 128.0),
            FmtType::Short => f32::from(i16::from_le_bytes([raw[0], raw[1]])) * (1.0 / 32768.0),
            FmtType::Float => f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            FmtType::Double => f64::from_le_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ]) as f32,
            FmtType::Mulaw => f32::from(mulaw_to_i16(raw[0])) * (1.0 / 32768.0),
            FmtType::Alaw => f32::from(alaw_to_i16(raw[0])) * (1.0 / 32768.0),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_counts() {
        assert_eq!(DevFmtChannels::X71.count(), 8);
        assert_eq!(DevFmtChannels::Ambi3D(2).count(), 9);
        assert_eq!(FmtChannels::BFormat2D.count(1), 3);
        assert_eq!(FmtChannels::BFormat3D.count(3), 16);
    }

    #[test]
    fn test_alignment_rules() {
        assert_eq!(UserFmtType::Ima4.sanitize_alignment(0), Ok(65));
        assert!(UserFmtType::Ima4.sanitize_alignment(64).is_err());
        assert_eq!(UserFmtType::MsAdpcm.sanitize_alignment(0), Ok(64));
        assert!(UserFmtType::MsAdpcm.sanitize_alignment(63).is_err());
        assert_eq!(UserFmtType::Float.sanitize_alignment(0), Ok(1));
        assert_eq!(UserFmtType::Ima4.block_bytes(65, 2), 72);
        assert_eq!(UserFmtType::MsAdpcm.block_bytes(64, 1), 38);
    }

    #[test]
    fn test_companded_decoding() {
        assert_eq!(mulaw_to_i16(0xff), 0);
        assert_eq!(mulaw_to_i16(0x80), 32124);
        assert_eq!(mulaw_to_i16(0x00), -32124);
        assert_eq!(alaw_to_i16(0xd5), 8);
        assert_eq!(alaw_to_i16(0x55), -8);
    }

    #[test]
    fn test_load_interleaved_shorts() {
        let data: Vec<u8> = [0i16, 100, 16384, -200, -32768, 300]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let mut left = [0.0f32; 3];
        load_samples(&mut left, &data, 2, FmtType::Short);
        assert_eq!(left, [0.0, 0.5, -1.0]);
        let mut right = [0.0f32; 3];
        load_samples(&mut right, &data[2..], 2, FmtType::Short);
        assert_eq!(right[0], 100.0 / 32768.0);
    }
}
