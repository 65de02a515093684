//! Float to device sample conversion.

use crate::format::DevFmtType;
use cpal::{FromSample, SizedSample};

/// A sample type the device can write.
pub trait OutputSample: SizedSample + FromSample<f32> + Send + 'static {
    const TYPE: DevFmtType;
}

impl OutputSample for i8 {
    const TYPE: DevFmtType = DevFmtType::I8;
}

impl OutputSample for u8 {
    const TYPE: DevFmtType = DevFmtType::U8;
}

impl OutputSample for i16 {
    const TYPE: DevFmtType = DevFmtType::I16;
}

impl OutputSample for u16 {
    const TYPE: DevFmtType = DevFmtType::U16;
}

impl OutputSample for i32 {
    const TYPE: DevFmtType = DevFmtType::I32;
}

impl OutputSample for u32 {
    const TYPE: DevFmtType = DevFmtType::U32;
}

impl OutputSample for f32 {
    const TYPE: DevFmtType = DevFmtType::F32;
}

/// Interleaves `count` frames of `lines` into `out`.
///
/// Integer types are clipped to full scale first.
pub(crate) fn write_interleaved<T: OutputSample>(lines: &[&[f32]], out: &mut [T], count: usize) {
    let channels = lines.len();
    let clip = T::TYPE != DevFmtType::F32;
    for (frame, chunk) in out.chunks_exact_mut(channels).take(count).enumerate() {
        for (sample, line) in chunk.iter_mut().zip(lines) {
            let value = line[frame];
            *sample = T::from_sample(if clip { value.clamp(-1.0, 1.0) } else { value });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleaves_and_clips() {
        let left = [0.5, 2.0];
        let right = [-0.5, -2.0];
        let mut out = [0i16; 4];
        write_interleaved(&[&left, &right], &mut out, 2);
        assert_eq!(out[0], 16384);
        assert_eq!(out[1], -16384);
        assert_eq!(out[2], i16::MAX);
        assert_eq!(out[3], i16::MIN);
    }

    #[test]
    fn test_float_passes_through() {
        let line = [1.5, -0.25];
        let mut out = [0.0f32; 2];
        write_interleaved(&[&line], &mut out, 2);
        assert_eq!(out, [1.5, -0.25]);
    }

    #[test]
    fn test_unsigned_is_offset() {
        let line = [0.0];
        let mut out = [0u8; 1];
        write_interleaved(&[&line], &mut out, 1);
        assert_eq!(out[0], 128);
    }
}
