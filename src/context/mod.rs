//! Contexts: the listener, sources and effect slots rendered by a device.
//!
//! A [`Context`] is the API-facing handle. Its [`ContextShared`] half is what
//! the device's mixer sees; the two meet only through the published voice
//! and slot arrays, the voice-change queue and the per-object update slots.

pub mod listener;
mod mix;
mod slots;
mod sources;

use crate::config::ContextDesc;
use crate::device::DeviceShared;
use crate::effect_slot::{EffectSlot, EffectSlotProps, SlotObject};
use crate::error::{ErrorCode, ErrorLatch, Result};
use crate::events::{AlEvent, EventCallback, EventQueue, EventType};
use crate::math::{Orientation, Vec3};
use crate::props::{PropsFreeList, UpdateSlot};
use crate::publish::Published;
use crate::source::{DistanceModel, Source};
use crate::table::IdTable;
use crate::voice::{Voice, VoiceProps};
use crate::voice_change::VoiceChangeQueue;
use listener::ListenerParams;
pub use listener::{ContextProps, Listener};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Low half of the active-voice word; the high half is the claim epoch.
const ACTIVE_COUNT_MASK: u64 = 0xffff_ffff;

/// API-side state. One lock covers every object table of the context.
pub(crate) struct ContextState {
    pub(crate) sources: IdTable<Source>,
    pub(crate) slots: IdTable<SlotObject>,
    pub(crate) listener: Listener,
    pub(crate) props: ContextProps,
    /// Publication is held back until `process_updates`.
    pub(crate) deferred: bool,
    /// Listener or context values changed while deferred.
    pub(crate) props_dirty: bool,
    pub(crate) next_serial: u64,
}

impl ContextState {
    pub(crate) fn listener_params(&self) -> ListenerParams {
        ListenerParams::new(&self.listener, &self.props)
    }
}

/// The half of a context the mixer renders.
pub(crate) struct ContextShared {
    pub(crate) voices: Published<Vec<Arc<Voice>>>,
    /// Claim epoch in the high 32 bits, span of possibly busy voices below.
    active_voices: AtomicU64,
    pub(crate) voice_changes: VoiceChangeQueue,
    pub(crate) voice_free: PropsFreeList<VoiceProps>,
    pub(crate) slot_free: PropsFreeList<EffectSlotProps>,
    /// Playing slots, each ordered before the slots it feeds.
    pub(crate) active_slots: Published<Vec<Arc<EffectSlot>>>,
    listener_update: UpdateSlot<ListenerParams>,
    listener_free: PropsFreeList<ListenerParams>,
    /// Listener values as last applied by the mixer.
    pub(crate) mix_listener: Mutex<ListenerParams>,
    hold_updates: AtomicBool,
    pub(crate) events: EventQueue,
    stop_on_disconnect: bool,
    pub(crate) state: Mutex<ContextState>,
}

impl ContextShared {
    fn new(desc: &ContextDesc) -> Result<Self> {
        let voices = (0..desc.initial_voices)
            .map(|_| Arc::new(Voice::new()))
            .collect();
        Ok(Self {
            voices: Published::new(voices),
            active_voices: AtomicU64::new(0),
            voice_changes: VoiceChangeQueue::new(),
            voice_free: PropsFreeList::new(None),
            slot_free: PropsFreeList::new(None),
            active_slots: Published::new(Vec::new()),
            listener_update: UpdateSlot::new(),
            listener_free: PropsFreeList::new(None),
            mix_listener: Mutex::new(ListenerParams::default()),
            hold_updates: AtomicBool::new(false),
            events: EventQueue::new(desc.event_capacity)?,
            stop_on_disconnect: desc.stop_sources_on_disconnect,
            state: Mutex::new(ContextState {
                sources: IdTable::with_limit("source", desc.max_sources),
                slots: IdTable::with_limit("effect slot", desc.max_effect_slots),
                listener: Listener::default(),
                props: ContextProps::default(),
                deferred: false,
                props_dirty: false,
                next_serial: 0,
            }),
        })
    }

    pub(crate) fn active_voice_count(&self) -> usize {
        (self.active_voices.load(Ordering::Acquire) & ACTIVE_COUNT_MASK) as usize
    }

    /// Grows the active span to cover `index` and bumps the claim epoch so
    /// a concurrent mixer-side trim is discarded.
    pub(crate) fn extend_active(&self, index: usize) {
        let mut current = self.active_voices.load(Ordering::Acquire);
        loop {
            let epoch = (current >> 32).wrapping_add(1) & ACTIVE_COUNT_MASK;
            let count = ((current & ACTIVE_COUNT_MASK) as usize).max(index + 1);
            let next = (epoch << 32) | count as u64;
            match self.active_voices.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Shrinks the active span past trailing idle voices, unless a claim
    /// happened since `observed` was read.
    pub(crate) fn trim_active(&self, voices: &[Arc<Voice>], observed: u64) {
        let count = ((observed & ACTIVE_COUNT_MASK) as usize).min(voices.len());
        let keep = voices[..count]
            .iter()
            .rposition(|voice| !voice.is_idle())
            .map_or(0, |last| last + 1);
        if keep < (observed & ACTIVE_COUNT_MASK) as usize {
            let next = (observed & !ACTIVE_COUNT_MASK) | keep as u64;
            let _ = self.active_voices.compare_exchange(
                observed,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    fn publish_listener(&self, params: ListenerParams) -> Result<()> {
        self.listener_free.publish(&self.listener_update, |p| *p = params)
    }
}

/// A rendering context created from a [`crate::Device`].
///
/// Every call records its failure in the context's error latch, readable
/// with [`Context::get_error`].
pub struct Context {
    device: Arc<DeviceShared>,
    shared: Arc<ContextShared>,
    errors: ErrorLatch,
}

impl Context {
    pub(crate) fn new(device: Arc<DeviceShared>, desc: ContextDesc) -> Result<Self> {
        let shared = Arc::new(ContextShared::new(&desc)?);
        device.add_context(shared.clone());
        log::info!(
            "Created context with {} voices and {} event slots",
            desc.initial_voices,
            desc.event_capacity
        );
        Ok(Self {
            device,
            shared,
            errors: ErrorLatch::default(),
        })
    }

    /// Returns and clears the first error raised since the last call.
    pub fn get_error(&self) -> ErrorCode {
        self.errors.take()
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        self.errors.record(result)
    }

    /// Applies a listener or context-wide change, publishing it unless
    /// updates are deferred.
    fn update_listener(&self, change: impl FnOnce(&mut ContextState) -> Result<()>) -> Result<()> {
        let result = (|| {
            let mut state = self.shared.state.lock();
            change(&mut state)?;
            if state.deferred {
                state.props_dirty = true;
                return Ok(());
            }
            if let Err(err) = self.shared.publish_listener(state.listener_params()) {
                log::warn!("Listener update deferred: {}", err);
                state.props_dirty = true;
            }
            Ok(())
        })();
        self.record(result)
    }

    pub fn listener(&self) -> Listener {
        self.shared.state.lock().listener
    }

    pub fn context_props(&self) -> ContextProps {
        self.shared.state.lock().props
    }

    pub fn set_listener_position(&self, position: Vec3) -> Result<()> {
        self.update_listener(|state| state.listener.set_position(position))
    }

    pub fn set_listener_velocity(&self, velocity: Vec3) -> Result<()> {
        self.update_listener(|state| state.listener.set_velocity(velocity))
    }

    pub fn set_listener_orientation(&self, orientation: Orientation) -> Result<()> {
        self.update_listener(|state| state.listener.set_orientation(orientation))
    }

    pub fn set_listener_gain(&self, gain: f32) -> Result<()> {
        self.update_listener(|state| state.listener.set_gain(gain))
    }

    pub fn set_meters_per_unit(&self, meters: f32) -> Result<()> {
        self.update_listener(|state| state.listener.set_meters_per_unit(meters))
    }

    pub fn set_doppler_factor(&self, factor: f32) -> Result<()> {
        self.update_listener(|state| state.props.set_doppler_factor(factor))
    }

    pub fn set_doppler_velocity(&self, velocity: f32) -> Result<()> {
        self.update_listener(|state| state.props.set_doppler_velocity(velocity))
    }

    pub fn set_speed_of_sound(&self, speed: f32) -> Result<()> {
        self.update_listener(|state| state.props.set_speed_of_sound(speed))
    }

    pub fn set_distance_model(&self, model: DistanceModel) -> Result<()> {
        self.update_listener(|state| {
            state.props.distance_model = model;
            Ok(())
        })
    }

    /// Lets each source's own distance model override the context's.
    pub fn set_source_distance_model(&self, enable: bool) -> Result<()> {
        self.update_listener(|state| {
            state.props.source_distance_model = enable;
            Ok(())
        })
    }

    /// Holds back publication of property changes until
    /// [`Context::process_updates`].
    pub fn defer_updates(&self) {
        self.shared.state.lock().deferred = true;
    }

    /// Publishes everything changed since [`Context::defer_updates`] so the
    /// mixer applies it in a single block.
    pub fn process_updates(&self) -> Result<()> {
        let result = (|| {
            let mut state = self.shared.state.lock();
            state.deferred = false;

            self.shared.hold_updates.store(true, Ordering::Release);
            self.device.mix_count.wait_for_mix();

            let mut result = Ok(());
            if state.props_dirty {
                match self.shared.publish_listener(state.listener_params()) {
                    Ok(()) => state.props_dirty = false,
                    Err(err) => result = Err(err),
                }
            }
            if let Err(err) = self.shared.publish_dirty_slots(&mut state) {
                result = result.and(Err(err));
            }
            self.shared.publish_dirty_sources(&mut state);

            self.shared.hold_updates.store(false, Ordering::Release);
            result
        })();
        self.record(result)
    }

    /// Sets the callback receiving enabled events on the event thread.
    pub fn set_event_callback<F>(&self, callback: Option<F>)
    where
        F: Fn(&AlEvent) + Send + Sync + 'static,
    {
        self.shared
            .events
            .set_callback(callback.map(|f| Arc::new(f) as Arc<EventCallback>));
    }

    pub fn enable_events(&self, types: EventType, enable: bool) {
        self.shared.events.set_enabled(types, enable);
    }

    pub fn enabled_events(&self) -> EventType {
        self.shared.events.enabled()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.device.remove_context(&self.shared);
        {
            let mut state = self.shared.state.lock();
            let mut buffers = self.device.buffers.lock();
            for (_, source) in state.sources.iter_mut() {
                for item in source.queue.drain(..) {
                    if let Some(buffer) = buffers.get_mut(item.buffer_id) {
                        buffer.ref_count = buffer.ref_count.saturating_sub(1);
                    }
                }
            }
        }
        self.shared.events.shutdown();
        log::info!("Context destroyed");
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("voices", &self.shared.voices.current().len())
            .field("active_voices", &self.shared.active_voice_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceDesc;
    use crate::device::Device;

    fn context() -> (Device, Context) {
        let device = Device::open_loopback(DeviceDesc::default()).unwrap();
        let context = device.create_context(ContextDesc::default()).unwrap();
        (device, context)
    }

    #[test]
    fn test_listener_setters_validate_and_latch() {
        let (_device, context) = context();
        context.set_listener_gain(0.5).unwrap();
        assert_eq!(context.listener().gain, 0.5);

        assert!(context.set_listener_gain(-1.0).is_err());
        assert!(context.set_doppler_factor(-1.0).is_err());
        assert_eq!(context.get_error(), ErrorCode::InvalidValue);
        assert_eq!(context.get_error(), ErrorCode::NoError);
        assert_eq!(context.listener().gain, 0.5);
    }

    #[test]
    fn test_deferred_listener_reaches_mixer_on_process() {
        let (device, context) = context();
        context.defer_updates();
        context.set_listener_gain(0.25).unwrap();
        assert!(!context.shared.listener_update.is_pending());

        context.process_updates().unwrap();
        assert!(context.shared.listener_update.is_pending());

        let mut out = vec![0.0f32; 2 * 64];
        device.render_samples(&mut out).unwrap();
        assert!(!context.shared.listener_update.is_pending());
        assert_eq!(context.shared.mix_listener.lock().gain, 0.25);
    }

    #[test]
    fn test_active_span_trim_respects_epoch() {
        let (_device, context) = context();
        let shared = &context.shared;
        shared.extend_active(3);
        assert_eq!(shared.active_voice_count(), 4);

        let observed = shared.active_voices.load(Ordering::Acquire);
        shared.extend_active(1);
        // A claim happened in between, so the stale trim is dropped.
        shared.trim_active(shared.voices.current(), observed);
        assert_eq!(shared.active_voice_count(), 4);

        let observed = shared.active_voices.load(Ordering::Acquire);
        shared.trim_active(shared.voices.current(), observed);
        assert_eq!(shared.active_voice_count(), 0);
    }

    #[test]
    fn test_context_drop_detaches_from_device() {
        let (device, context) = context();
        assert_eq!(device.shared.contexts.current().len(), 1);
        drop(context);
        assert!(device.shared.contexts.current().is_empty());
    }
}
