//! Buffer objects: typed sample storage shared by source queues.

use crate::adpcm::{self, MAX_ADPCM_CHANNELS};
use crate::error::{AlError, Result};
use crate::format::{AmbiLayout, AmbiScaling, BufferFormat, FmtChannels, FmtType, UserFmtType};
use std::sync::Arc;

/// Pull-mode sample source.
///
/// The callback receives a byte slice to fill with samples in the buffer's
/// format and returns how many bytes it wrote. Writing fewer bytes than
/// requested ends the stream.
pub type BufferCallbackFn = dyn Fn(&mut [u8]) -> usize + Send + Sync;

/// Lightweight, type-safe handle for buffers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub(crate) u32);

impl BufferId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferId({})", self.0)
    }
}

/// Storage and mapping permissions requested when data is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MapFlags(u32);

impl MapFlags {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const PERSISTENT: Self = Self(4);
    pub const PRESERVE_DATA: Self = Self(8);

    const MAP_MASK: u32 = 1 | 2 | 4;

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    fn map_bits(self) -> Self {
        Self(self.0 & Self::MAP_MASK)
    }
}

impl std::ops::BitOr for MapFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The immutable sample payload a queue item points at.
#[derive(Clone)]
pub(crate) struct BufferData {
    pub(crate) frequency: u32,
    pub(crate) channels: FmtChannels,
    pub(crate) sample_type: FmtType,
    pub(crate) ambi_order: u8,
    pub(crate) ambi_layout: AmbiLayout,
    pub(crate) ambi_scaling: AmbiScaling,
    /// Length in sample frames. Zero for callback buffers.
    pub(crate) sample_len: usize,
    pub(crate) loop_start: usize,
    pub(crate) loop_end: usize,
    pub(crate) samples: Vec<u8>,
    pub(crate) callback: Option<Arc<BufferCallbackFn>>,
    /// Input type and block alignment, used to report byte offsets.
    pub(crate) original_type: UserFmtType,
    pub(crate) original_align: usize,
}

impl std::fmt::Debug for BufferData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferData")
            .field("frequency", &self.frequency)
            .field("channels", &self.channels)
            .field("sample_type", &self.sample_type)
            .field("sample_len", &self.sample_len)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl BufferData {
    fn empty() -> Self {
        Self {
            frequency: 0,
            channels: FmtChannels::Mono,
            sample_type: FmtType::Short,
            ambi_order: 0,
            ambi_layout: AmbiLayout::default(),
            ambi_scaling: AmbiScaling::default(),
            sample_len: 0,
            loop_start: 0,
            loop_end: 0,
            samples: Vec::new(),
            callback: None,
            original_type: UserFmtType::Short,
            original_align: 1,
        }
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.channels.count(self.ambi_order)
    }

    pub(crate) fn frame_size(&self) -> usize {
        self.channel_count() * self.sample_type.bytes()
    }

    /// Whether two buffers can share a queue.
    pub(crate) fn same_format(&self, other: &Self) -> bool {
        self.frequency == other.frequency
            && self.channels == other.channels
            && self.ambi_order == other.ambi_order
            && self.sample_type == other.sample_type
            && self.original_type == other.original_type
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Mapping {
    access: MapFlags,
    offset: usize,
    len: usize,
}

/// A snapshot of a buffer's queryable state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferInfo {
    pub frequency: u32,
    pub bits: u32,
    pub channels: usize,
    /// Size of the stored data in bytes.
    pub size: usize,
    pub sample_length: usize,
    pub loop_points: (usize, usize),
    pub unpack_block_alignment: u32,
    pub pack_block_alignment: u32,
    pub unpack_ambisonic_order: u8,
    pub ambi_layout: AmbiLayout,
    pub ambi_scaling: AmbiScaling,
    pub is_callback: bool,
}

/// API-side buffer object.
pub(crate) struct Buffer {
    pub(crate) data: Arc<BufferData>,
    /// Number of queue items referencing this buffer.
    pub(crate) ref_count: u32,
    access: MapFlags,
    mapping: Option<Mapping>,
    unpack_align: u32,
    pack_align: u32,
    unpack_ambi_order: u8,
}

impl Buffer {
    pub(crate) fn new() -> Self {
        Self {
            data: Arc::new(BufferData::empty()),
            ref_count: 0,
            access: MapFlags::NONE,
            mapping: None,
            unpack_align: 0,
            pack_align: 0,
            unpack_ambi_order: 1,
        }
    }

    pub(crate) fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Whether the buffer may be queued right now.
    pub(crate) fn queueable(&self) -> bool {
        self.mapping
            .is_none_or(|m| m.access.contains(MapFlags::PERSISTENT))
    }

    fn ensure_mutable(&self, what: &str) -> Result<()> {
        if self.ref_count != 0 || self.is_mapped() {
            return Err(AlError::InvalidOperation(format!(
                "{} of in-use or mapped buffer",
                what
            )));
        }
        Ok(())
    }

    /// Stores new sample data, decoding ADPCM to 16-bit samples.
    pub(crate) fn store(
        &mut self,
        format: BufferFormat,
        frequency: u32,
        data: Option<&[u8]>,
        size: usize,
        flags: MapFlags,
    ) -> Result<()> {
        self.ensure_mutable("modifying storage")?;
        if frequency < 1 {
            return Err(AlError::InvalidValue(format!(
                "invalid sample rate {}",
                frequency
            )));
        }
        if let Some(bytes) = data {
            if bytes.len() < size {
                return Err(AlError::InvalidValue(format!(
                    "{} bytes supplied for a {} byte store",
                    bytes.len(),
                    size
                )));
            }
        }

        let src_type = format.sample_type;
        let ambi_order = if format.channels.is_bformat() {
            self.unpack_ambi_order
        } else {
            0
        };
        let align = src_type.sanitize_alignment(self.unpack_align)?;
        let channels = format.channels.count(ambi_order);
        if src_type.is_adpcm() && channels > MAX_ADPCM_CHANNELS {
            return Err(AlError::InvalidEnum(format!(
                "{} channel ADPCM is not supported",
                channels
            )));
        }

        if flags.intersects(MapFlags::READ | MapFlags::WRITE | MapFlags::PERSISTENT)
            && src_type.is_adpcm()
        {
            return Err(AlError::InvalidValue(format!(
                "{:?} samples cannot be mapped",
                src_type
            )));
        }

        let preserve = flags.contains(MapFlags::PRESERVE_DATA);
        if preserve {
            let old = &self.data;
            if old.callback.is_some() {
                return Err(AlError::InvalidValue(
                    "preserving data of a callback buffer".into(),
                ));
            }
            if old.channels != format.channels || old.original_type != src_type {
                return Err(AlError::InvalidValue(
                    "preserving data of mismatched format".into(),
                ));
            }
            if old.original_align != align {
                return Err(AlError::InvalidValue(
                    "preserving data of mismatched alignment".into(),
                ));
            }
            if old.ambi_order != ambi_order {
                return Err(AlError::InvalidValue(
                    "preserving data of mismatched order".into(),
                ));
            }
        }

        let block_bytes = src_type.block_bytes(align, channels);
        if size % block_bytes != 0 {
            return Err(AlError::InvalidValue(format!(
                "data size {} is not a multiple of {} byte blocks",
                size, block_bytes
            )));
        }
        let frames = size / block_bytes * align;

        let storage = src_type.storage();
        let new_bytes = frames
            .checked_mul(channels * storage.bytes())
            .ok_or_else(|| AlError::OutOfMemory(format!("{} frame buffer", frames)))?;

        let mut samples = Vec::new();
        samples.try_reserve_exact(new_bytes).map_err(|_| {
            AlError::OutOfMemory(format!("failed to allocate {} bytes", new_bytes))
        })?;
        match data {
            Some(bytes) => convert_data(&mut samples, &bytes[..size], src_type, channels, align),
            None if preserve => {
                let keep = self.data.samples.len().min(new_bytes);
                samples.extend_from_slice(&self.data.samples[..keep]);
                samples.resize(new_bytes, silence_byte(storage));
            }
            None => samples.resize(new_bytes, silence_byte(storage)),
        }

        self.access = flags.map_bits();
        self.data = Arc::new(BufferData {
            frequency,
            channels: format.channels,
            sample_type: storage,
            ambi_order,
            ambi_layout: self.data.ambi_layout,
            ambi_scaling: self.data.ambi_scaling,
            sample_len: frames,
            loop_start: 0,
            loop_end: frames,
            samples,
            callback: None,
            original_type: src_type,
            original_align: align,
        });
        log::debug!(
            "stored {} frames of {:?} {:?} at {}hz",
            frames,
            format.channels,
            src_type,
            frequency
        );
        Ok(())
    }

    /// Turns the buffer into a pull-mode stream.
    pub(crate) fn set_callback(
        &mut self,
        format: BufferFormat,
        frequency: u32,
        callback: Arc<BufferCallbackFn>,
    ) -> Result<()> {
        self.ensure_mutable("setting callback")?;
        if frequency < 1 {
            return Err(AlError::InvalidValue(format!(
                "invalid sample rate {}",
                frequency
            )));
        }
        if format.sample_type.is_adpcm() {
            return Err(AlError::InvalidValue(format!(
                "{:?} callback buffers are not supported",
                format.sample_type
            )));
        }
        let ambi_order = if format.channels.is_bformat() {
            self.unpack_ambi_order
        } else {
            0
        };
        self.access = MapFlags::NONE;
        self.data = Arc::new(BufferData {
            frequency,
            channels: format.channels,
            sample_type: format.sample_type.storage(),
            ambi_order,
            ambi_layout: self.data.ambi_layout,
            ambi_scaling: self.data.ambi_scaling,
            sample_len: 0,
            loop_start: 0,
            loop_end: 0,
            samples: Vec::new(),
            callback: Some(callback),
            original_type: format.sample_type,
            original_align: 1,
        });
        Ok(())
    }

    pub(crate) fn set_loop_points(&mut self, start: usize, end: usize) -> Result<()> {
        self.ensure_mutable("setting loop points")?;
        if start >= end || end > self.data.sample_len {
            return Err(AlError::InvalidValue(format!(
                "invalid loop point range {}..{} of {}",
                start, end, self.data.sample_len
            )));
        }
        let data = Arc::make_mut(&mut self.data);
        data.loop_start = start;
        data.loop_end = end;
        Ok(())
    }

    pub(crate) fn set_unpack_block_alignment(&mut self, align: u32) {
        self.unpack_align = align;
    }

    pub(crate) fn set_pack_block_alignment(&mut self, align: u32) {
        self.pack_align = align;
    }

    pub(crate) fn set_unpack_ambisonic_order(&mut self, order: u8) -> Result<()> {
        if !(1..=3).contains(&order) {
            return Err(AlError::InvalidValue(format!(
                "invalid unpack ambisonic order {}",
                order
            )));
        }
        self.unpack_ambi_order = order;
        Ok(())
    }

    pub(crate) fn set_ambisonics(&mut self, layout: AmbiLayout, scaling: AmbiScaling) -> Result<()> {
        self.ensure_mutable("changing ambisonic format")?;
        if layout == AmbiLayout::FuMa && self.data.ambi_order > 3 {
            return Err(AlError::InvalidOperation(
                "FuMa layout beyond third order".into(),
            ));
        }
        let data = Arc::make_mut(&mut self.data);
        data.ambi_layout = layout;
        data.ambi_scaling = scaling;
        Ok(())
    }

    pub(crate) fn map(&mut self, offset: usize, len: usize, access: MapFlags) -> Result<()> {
        let access_bits = access.map_bits();
        if access_bits != access {
            return Err(AlError::InvalidValue(format!("invalid map flags {:?}", access)));
        }
        if !access.intersects(MapFlags::READ | MapFlags::WRITE) {
            return Err(AlError::InvalidValue(
                "mapping without read or write access".into(),
            ));
        }
        if self.ref_count != 0 && !access.contains(MapFlags::PERSISTENT) {
            return Err(AlError::InvalidOperation(
                "mapping in-use buffer without persistent mapping".into(),
            ));
        }
        if self.is_mapped() {
            return Err(AlError::InvalidOperation("buffer is already mapped".into()));
        }
        if !self.access.contains(access) {
            return Err(AlError::InvalidValue(format!(
                "mapping with {:?} beyond stored access {:?}",
                access, self.access
            )));
        }
        let size = self.data.samples.len();
        if len == 0 || offset >= size || len > size - offset {
            return Err(AlError::InvalidValue(format!(
                "invalid map range {}+{} of {} bytes",
                offset, len, size
            )));
        }
        self.mapping = Some(Mapping {
            access,
            offset,
            len,
        });
        Ok(())
    }

    pub(crate) fn unmap(&mut self) -> Result<()> {
        if self.mapping.take().is_none() {
            return Err(AlError::InvalidOperation("buffer is not mapped".into()));
        }
        Ok(())
    }

    pub(crate) fn flush_mapped(&self, offset: usize, len: usize) -> Result<()> {
        let mapping = self
            .mapping
            .filter(|m| m.access.contains(MapFlags::WRITE))
            .ok_or_else(|| {
                AlError::InvalidOperation("flushing a buffer not mapped for writing".into())
            })?;
        if len == 0
            || offset < mapping.offset
            || offset >= mapping.offset + mapping.len
            || len > mapping.offset + mapping.len - offset
        {
            return Err(AlError::InvalidValue(format!(
                "flush range {}+{} outside the mapped range",
                offset, len
            )));
        }
        // Stored samples are read straight from memory; nothing else to do.
        Ok(())
    }

    /// Reads through the current mapping.
    pub(crate) fn read_mapped<R>(&self, read: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let mapping = self
            .mapping
            .filter(|m| m.access.contains(MapFlags::READ))
            .ok_or_else(|| AlError::InvalidOperation("buffer is not mapped for reading".into()))?;
        Ok(read(
            &self.data.samples[mapping.offset..mapping.offset + mapping.len],
        ))
    }

    /// Writes through the current mapping.
    ///
    /// Writes are refused while a source still shares the storage.
    pub(crate) fn write_mapped<R>(&mut self, write: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mapping = self
            .mapping
            .filter(|m| m.access.contains(MapFlags::WRITE))
            .ok_or_else(|| AlError::InvalidOperation("buffer is not mapped for writing".into()))?;
        let data = Arc::get_mut(&mut self.data).ok_or_else(|| {
            AlError::InvalidOperation("mapped buffer storage is shared by a source".into())
        })?;
        Ok(write(
            &mut data.samples[mapping.offset..mapping.offset + mapping.len],
        ))
    }

    pub(crate) fn info(&self) -> BufferInfo {
        let data = &self.data;
        BufferInfo {
            frequency: data.frequency,
            bits: data.sample_type.bytes() as u32 * 8,
            channels: data.channel_count(),
            size: data.samples.len(),
            sample_length: data.sample_len,
            loop_points: (data.loop_start, data.loop_end),
            unpack_block_alignment: self.unpack_align,
            pack_block_alignment: self.pack_align,
            unpack_ambisonic_order: self.unpack_ambi_order,
            ambi_layout: data.ambi_layout,
            ambi_scaling: data.ambi_scaling,
            is_callback: data.callback.is_some(),
        }
    }
}

fn silence_byte(ty: FmtType) -> u8 {
    match ty {
        FmtType::UByte => 0x80,
        FmtType::Mulaw => 0xff,
        FmtType::Alaw => 0xd5,
        _ => 0,
    }
}

/// Appends `src` to `dst` in storage form.
fn convert_data(dst: &mut Vec<u8>, src: &[u8], ty: UserFmtType, channels: usize, align: usize) {
    let decode: fn(&mut [i16], &[u8], usize, usize) = match ty {
        UserFmtType::Ima4 => adpcm::decode_ima4_block,
        UserFmtType::MsAdpcm => adpcm::decode_msadpcm_block,
        _ => {
            dst.extend_from_slice(src);
            return;
        }
    };
    let block_bytes = ty.block_bytes(align, channels);
    let mut frames = vec![0i16; align * channels];
    for block in src.chunks_exact(block_bytes) {
        decode(&mut frames, block, channels, align);
        for sample in &frames {
            dst.extend_from_slice(&sample.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floats(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_store_pcm() {
        let mut buffer = Buffer::new();
        let bytes = floats(&[0.0, 0.5, -0.5, 1.0]);
        buffer
            .store(BufferFormat::MONO_FLOAT32, 48000, Some(&bytes), bytes.len(), MapFlags::NONE)
            .unwrap();
        let info = buffer.info();
        assert_eq!(info.sample_length, 4);
        assert_eq!(info.bits, 32);
        assert_eq!(info.loop_points, (0, 4));
        assert_eq!(buffer.data.samples, bytes);
    }

    #[test]
    fn test_store_rejects_partial_frames() {
        let mut buffer = Buffer::new();
        let bytes = [0u8; 6];
        let err = buffer
            .store(BufferFormat::STEREO16, 44100, Some(&bytes), 6, MapFlags::NONE)
            .unwrap_err();
        assert!(matches!(err, AlError::InvalidValue(_)));
    }

    #[test]
    fn test_store_refused_while_queued() {
        let mut buffer = Buffer::new();
        buffer.ref_count = 1;
        let err = buffer
            .store(BufferFormat::MONO16, 44100, None, 4, MapFlags::NONE)
            .unwrap_err();
        assert!(matches!(err, AlError::InvalidOperation(_)));
        assert!(matches!(
            buffer.set_loop_points(0, 1),
            Err(AlError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_store_ima4_decodes_blocks() {
        let mut buffer = Buffer::new();
        let block = vec![0u8; 36 * 2];
        buffer
            .store(
                BufferFormat::new(FmtChannels::Mono, UserFmtType::Ima4),
                22050,
                Some(&block),
                block.len(),
                MapFlags::NONE,
            )
            .unwrap();
        assert_eq!(buffer.data.sample_len, 130);
        assert_eq!(buffer.data.sample_type, FmtType::Short);
        assert_eq!(buffer.data.samples.len(), 260);

        buffer.set_unpack_block_alignment(64);
        assert!(
            buffer
                .store(
                    BufferFormat::new(FmtChannels::Mono, UserFmtType::Ima4),
                    22050,
                    Some(&block),
                    block.len(),
                    MapFlags::NONE,
                )
                .is_err()
        );
    }

    #[test]
    fn test_preserve_data_keeps_samples() {
        let mut buffer = Buffer::new();
        let bytes = floats(&[0.25, 0.75]);
        buffer
            .store(BufferFormat::MONO_FLOAT32, 48000, Some(&bytes), 8, MapFlags::NONE)
            .unwrap();
        buffer
            .store(BufferFormat::MONO_FLOAT32, 44100, None, 8, MapFlags::PRESERVE_DATA)
            .unwrap();
        assert_eq!(buffer.data.samples, bytes);
        assert_eq!(buffer.data.frequency, 44100);
        assert!(
            buffer
                .store(BufferFormat::MONO16, 44100, None, 4, MapFlags::PRESERVE_DATA)
                .is_err()
        );
    }

    #[test]
    fn test_map_rules() {
        let mut buffer = Buffer::new();
        buffer
            .store(BufferFormat::MONO16, 44100, None, 8, MapFlags::READ | MapFlags::WRITE)
            .unwrap();
        assert!(buffer.map(0, 8, MapFlags::PERSISTENT).is_err());
        assert!(buffer.map(4, 8, MapFlags::READ).is_err());
        buffer.map(0, 8, MapFlags::READ | MapFlags::WRITE).unwrap();
        assert!(!buffer.queueable());
        assert!(matches!(
            buffer.map(0, 8, MapFlags::READ),
            Err(AlError::InvalidOperation(_))
        ));
        buffer.write_mapped(|bytes| bytes[0] = 7).unwrap();
        assert_eq!(buffer.read_mapped(|bytes| bytes[0]).unwrap(), 7);
        buffer.flush_mapped(0, 8).unwrap();
        assert!(buffer.flush_mapped(0, 0).is_err());
        buffer.unmap().unwrap();
        assert!(buffer.unmap().is_err());
    }

    #[test]
    fn test_persistent_mapping_allows_queueing() {
        let mut buffer = Buffer::new();
        buffer
            .store(
                BufferFormat::MONO16,
                44100,
                None,
                8,
                MapFlags::READ | MapFlags::WRITE | MapFlags::PERSISTENT,
            )
            .unwrap();
        buffer
            .map(0, 8, MapFlags::WRITE | MapFlags::PERSISTENT)
            .unwrap();
        assert!(buffer.queueable());
        buffer.flush_mapped(2, 4).unwrap();
    }
}
