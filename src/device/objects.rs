//! Buffer, filter and effect objects owned by a device.

use super::Device;
use crate::buffer::{Buffer, BufferCallbackFn, BufferId, BufferInfo, MapFlags};
use crate::effect::{EffectId, EffectKind};
use crate::error::{AlError, Result};
use crate::filter::{FilterDesc, FilterId, FilterProperty};
use crate::format::{AmbiLayout, AmbiScaling, BufferFormat};
use crate::table::IdTable;
use std::sync::Arc;

/// Removes every ID or none: all are checked with `removable` first.
fn remove_all<T>(
    table: &mut IdTable<T>,
    ids: &[u32],
    removable: impl Fn(u32, &T) -> Result<()>,
) -> Result<()> {
    for &id in ids {
        removable(id, table.lookup(id)?)?;
    }
    for &id in ids {
        table.remove(id);
    }
    Ok(())
}

fn count_arg(n: usize, kind: &str) -> Result<usize> {
    if n > i32::MAX as usize {
        return Err(AlError::InvalidValue(format!(
            "generating {} {} objects",
            n, kind
        )));
    }
    Ok(n)
}

impl Device {
    fn with_buffer<R>(&self, id: BufferId, op: impl FnOnce(&mut Buffer) -> Result<R>) -> Result<R> {
        let result = self
            .shared
            .buffers
            .lock()
            .lookup_mut(id.0)
            .and_then(op);
        self.shared.errors.record(result)
    }

    pub fn gen_buffers(&self, n: usize) -> Result<Vec<BufferId>> {
        let result = count_arg(n, "buffer").and_then(|n| {
            self.shared
                .buffers
                .lock()
                .insert_n(n, |_| Buffer::new())
                .map(|ids| ids.into_iter().map(BufferId).collect())
        });
        self.shared.errors.record(result)
    }

    /// Deletes all of `ids`, or none if any is unknown or still queued.
    pub fn delete_buffers(&self, ids: &[BufferId]) -> Result<()> {
        let raw: Vec<u32> = ids.iter().map(|id| id.0).collect();
        let result = remove_all(&mut self.shared.buffers.lock(), &raw, |id, buffer| {
            if buffer.ref_count != 0 {
                return Err(AlError::InvalidOperation(format!(
                    "deleting in-use buffer {}",
                    id
                )));
            }
            Ok(())
        });
        if result.is_ok() {
            log::debug!("Deleted {} buffers", ids.len());
        }
        self.shared.errors.record(result)
    }

    pub fn is_buffer(&self, id: BufferId) -> bool {
        self.shared.buffers.lock().contains(id.0)
    }

    /// Replaces a buffer's storage with `data`.
    pub fn buffer_data(&self, id: BufferId, format: BufferFormat, data: &[u8], frequency: u32) -> Result<()> {
        self.with_buffer(id, |buffer| {
            buffer.store(format, frequency, Some(data), data.len(), MapFlags::NONE)
        })
    }

    /// Stores `size` bytes, optionally uninitialised, with mapping rights.
    pub fn buffer_storage(
        &self,
        id: BufferId,
        format: BufferFormat,
        data: Option<&[u8]>,
        size: usize,
        frequency: u32,
        flags: MapFlags,
    ) -> Result<()> {
        self.with_buffer(id, |buffer| buffer.store(format, frequency, data, size, flags))
    }

    /// Makes the buffer a pull-mode stream fed by `callback`.
    ///
    /// The callback fills its byte slice and returns the number of bytes
    /// written; a short count ends the stream.
    pub fn buffer_callback<F>(&self, id: BufferId, format: BufferFormat, frequency: u32, callback: F) -> Result<()>
    where
        F: Fn(&mut [u8]) -> usize + Send + Sync + 'static,
    {
        let callback: Arc<BufferCallbackFn> = Arc::new(callback);
        self.with_buffer(id, |buffer| buffer.set_callback(format, frequency, callback))
    }

    pub fn buffer_info(&self, id: BufferId) -> Result<BufferInfo> {
        self.with_buffer(id, |buffer| Ok(buffer.info()))
    }

    pub fn set_buffer_loop_points(&self, id: BufferId, start: usize, end: usize) -> Result<()> {
        self.with_buffer(id, |buffer| buffer.set_loop_points(start, end))
    }

    pub fn set_buffer_unpack_block_alignment(&self, id: BufferId, align: u32) -> Result<()> {
        self.with_buffer(id, |buffer| {
            buffer.set_unpack_block_alignment(align);
            Ok(())
        })
    }

    pub fn set_buffer_pack_block_alignment(&self, id: BufferId, align: u32) -> Result<()> {
        self.with_buffer(id, |buffer| {
            buffer.set_pack_block_alignment(align);
            Ok(())
        })
    }

    pub fn set_buffer_unpack_ambisonic_order(&self, id: BufferId, order: u8) -> Result<()> {
        self.with_buffer(id, |buffer| buffer.set_unpack_ambisonic_order(order))
    }

    pub fn set_buffer_ambisonics(&self, id: BufferId, layout: AmbiLayout, scaling: AmbiScaling) -> Result<()> {
        self.with_buffer(id, |buffer| buffer.set_ambisonics(layout, scaling))
    }

    pub fn map_buffer(&self, id: BufferId, offset: usize, len: usize, access: MapFlags) -> Result<()> {
        self.with_buffer(id, |buffer| buffer.map(offset, len, access))
    }

    pub fn unmap_buffer(&self, id: BufferId) -> Result<()> {
        self.with_buffer(id, |buffer| buffer.unmap())
    }

    pub fn flush_mapped_buffer(&self, id: BufferId, offset: usize, len: usize) -> Result<()> {
        self.with_buffer(id, |buffer| buffer.flush_mapped(offset, len))
    }

    /// Runs `read` over the mapped range.
    pub fn read_mapped_buffer<R>(&self, id: BufferId, read: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.with_buffer(id, |buffer| buffer.read_mapped(read))
    }

    /// Runs `write` over the mapped range.
    pub fn write_mapped_buffer<R>(&self, id: BufferId, write: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.with_buffer(id, |buffer| buffer.write_mapped(write))
    }

    pub fn gen_filters(&self, n: usize) -> Result<Vec<FilterId>> {
        let result = count_arg(n, "filter").and_then(|n| {
            self.shared
                .filters
                .lock()
                .insert_n(n, |_| FilterDesc::default())
                .map(|ids| ids.into_iter().map(FilterId).collect())
        });
        self.shared.errors.record(result)
    }

    pub fn delete_filters(&self, ids: &[FilterId]) -> Result<()> {
        let raw: Vec<u32> = ids.iter().map(|id| id.0).collect();
        let result = remove_all(&mut self.shared.filters.lock(), &raw, |_, _| Ok(()));
        self.shared.errors.record(result)
    }

    pub fn is_filter(&self, id: FilterId) -> bool {
        self.shared.filters.lock().contains(id.0)
    }

    pub fn set_filter(&self, id: FilterId, property: FilterProperty) -> Result<()> {
        let result = self
            .shared
            .filters
            .lock()
            .lookup_mut(id.0)
            .and_then(|filter| filter.set(property));
        self.shared.errors.record(result)
    }

    pub fn get_filter(&self, id: FilterId) -> Result<FilterDesc> {
        let result = self.shared.filters.lock().lookup(id.0).copied();
        self.shared.errors.record(result)
    }

    pub fn gen_effects(&self, n: usize) -> Result<Vec<EffectId>> {
        let result = count_arg(n, "effect").and_then(|n| {
            self.shared
                .effects
                .lock()
                .insert_n(n, |_| EffectKind::default())
                .map(|ids| ids.into_iter().map(EffectId).collect())
        });
        self.shared.errors.record(result)
    }

    pub fn delete_effects(&self, ids: &[EffectId]) -> Result<()> {
        let raw: Vec<u32> = ids.iter().map(|id| id.0).collect();
        let result = remove_all(&mut self.shared.effects.lock(), &raw, |_, _| Ok(()));
        self.shared.errors.record(result)
    }

    pub fn is_effect(&self, id: EffectId) -> bool {
        self.shared.effects.lock().contains(id.0)
    }

    /// Sets the effect type and properties. Slots already using the effect
    /// keep their copy until it is assigned again.
    pub fn set_effect(&self, id: EffectId, kind: EffectKind) -> Result<()> {
        let result = kind.validate().and_then(|()| {
            *self.shared.effects.lock().lookup_mut(id.0)? = kind;
            Ok(())
        });
        self.shared.errors.record(result)
    }

    pub fn get_effect(&self, id: EffectId) -> Result<EffectKind> {
        let result = self.shared.effects.lock().lookup(id.0).cloned();
        self.shared.errors.record(result)
    }
}

#[cfg(test)]
mod tests {
    use crate::buffer::MapFlags;
    use crate::config::DeviceDesc;
    use crate::device::Device;
    use crate::error::ErrorCode;
    use crate::filter::{FilterKind, FilterProperty};
    use crate::format::BufferFormat;

    fn device() -> Device {
        Device::open_loopback(DeviceDesc::default()).unwrap()
    }

    #[test]
    fn test_generated_ids_are_unique_and_die_on_delete() {
        let device = device();
        let first = device.gen_buffers(70).unwrap();
        let mut raw: Vec<u32> = first.iter().map(|id| id.raw()).collect();
        raw.sort_unstable();
        raw.dedup();
        assert_eq!(raw.len(), 70);
        assert!(raw.iter().all(|&id| id != 0));

        device.delete_buffers(&first[..10]).unwrap();
        for id in &first[..10] {
            assert!(!device.is_buffer(*id));
        }
        assert!(device.is_buffer(first[10]));
    }

    #[test]
    fn test_delete_is_all_or_nothing() {
        let device = device();
        let ids = device.gen_filters(2).unwrap();
        let bogus = crate::filter::FilterId(9999);
        assert!(device.delete_filters(&[ids[0], bogus, ids[1]]).is_err());
        assert_eq!(device.get_error(), ErrorCode::InvalidName);
        assert!(device.is_filter(ids[0]));
        assert!(device.is_filter(ids[1]));
    }

    #[test]
    fn test_buffer_data_and_info() {
        let device = device();
        let id = device.gen_buffers(1).unwrap()[0];
        let samples: Vec<u8> = (0..8i16).flat_map(|s| s.to_le_bytes()).collect();
        device
            .buffer_data(id, BufferFormat::STEREO16, &samples, 22050)
            .unwrap();
        let info = device.buffer_info(id).unwrap();
        assert_eq!(info.frequency, 22050);
        assert_eq!(info.channels, 2);
        assert_eq!(info.bits, 16);
        assert_eq!(info.sample_length, 4);
    }

    #[test]
    fn test_mapped_write_round_trips() {
        let device = device();
        let id = device.gen_buffers(1).unwrap()[0];
        device
            .buffer_storage(id, BufferFormat::MONO8, None, 16, 8000, MapFlags::READ | MapFlags::WRITE)
            .unwrap();
        device
            .map_buffer(id, 0, 16, MapFlags::READ | MapFlags::WRITE)
            .unwrap();
        device
            .write_mapped_buffer(id, |bytes| bytes.fill(7))
            .unwrap();
        device.flush_mapped_buffer(id, 0, 16).unwrap();
        let sum: u32 = device
            .read_mapped_buffer(id, |bytes| bytes.iter().map(|&b| u32::from(b)).sum())
            .unwrap();
        assert_eq!(sum, 7 * 16);
        device.unmap_buffer(id).unwrap();
        assert!(device.unmap_buffer(id).is_err());
    }

    #[test]
    fn test_filter_properties() {
        let device = device();
        let id = device.gen_filters(1).unwrap()[0];
        device
            .set_filter(id, FilterProperty::Kind(FilterKind::LowPass))
            .unwrap();
        device.set_filter(id, FilterProperty::GainHf(0.25)).unwrap();
        let filter = device.get_filter(id).unwrap();
        assert_eq!(filter.kind, FilterKind::LowPass);
        assert_eq!(filter.gain_hf, 0.25);
        assert!(device.set_filter(id, FilterProperty::GainHf(2.0)).is_err());
    }

    #[test]
    fn test_effect_validation() {
        let device = device();
        let id = device.gen_effects(1).unwrap()[0];
        assert!(
            device
                .set_effect(id, crate::effect::EffectKind::Passthrough { gain: -1.0 })
                .is_err()
        );
        assert_eq!(device.get_error(), ErrorCode::InvalidValue);
        device
            .set_effect(id, crate::effect::EffectKind::Passthrough { gain: 0.5 })
            .unwrap();
        assert!(device.is_effect(id));
    }
}
