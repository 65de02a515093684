//! Source objects: generation, properties, playback and buffer queues.

use super::{Context, ContextShared, ContextState};
use crate::buffer::{BufferData, BufferId};
use crate::context::listener::ListenerParams;
use crate::device::DeviceParams;
use crate::effect_slot::SlotObject;
use crate::error::{AlError, Result};
use crate::events::AlEvent;
use crate::filter::FilterParams;
use crate::publish::MixCounter;
use crate::source::{
    OffsetKind, QueueItem, QueuePos, Source, SourceId, SourceParam, SourceSend, SourceState,
    SourceType, SourceValue,
};
use crate::table::IdTable;
use crate::voice::{Voice, VoiceProps, VoiceStart};
use crate::voice_change::{VoiceChange, VoiceChangeState};
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Snapshot of a source as its voice consumes it.
fn voice_props(source: &Source, slots: &IdTable<SlotObject>) -> VoiceProps {
    let mut props = VoiceProps {
        source: source.props,
        direct: source.direct,
        ..VoiceProps::default()
    };
    for (send, out) in source.sends.iter().zip(props.sends.iter_mut()) {
        out.slot = send
            .slot
            .and_then(|id| slots.get(id))
            .map(|slot| slot.shared.clone());
        out.filter = send.filter;
    }
    props
}

/// Where a play should start: a pending offset, else the first item with
/// something to play.
fn start_position(source: &Source) -> Option<QueuePos> {
    if let Some(pos) = source
        .pending_offset
        .and_then(|(kind, offset)| source.find_offset(kind, offset))
    {
        return Some(pos);
    }
    let item = source.queue.iter().position(|item| item.is_playable())?;
    Some(QueuePos {
        pos: 0,
        frac: 0,
        item,
    })
}

/// Queue items a voice starts from, resolved before any voice is claimed.
struct VoicePlan {
    pos: QueuePos,
    format: Arc<BufferData>,
    head: Arc<QueueItem>,
    item: Arc<QueueItem>,
}

impl VoicePlan {
    fn new(id: u32, source: &Source, pos: QueuePos) -> Result<Self> {
        let no_data = || AlError::InvalidOperation(format!("source {} has nothing queued", id));
        Ok(Self {
            format: source.queue_format().cloned().ok_or_else(no_data)?,
            head: source.queue.front().cloned().ok_or_else(no_data)?,
            item: source.queue.get(pos.item).cloned().ok_or_else(no_data)?,
            pos,
        })
    }
}

enum PlayAction {
    Resume(usize),
    Stop,
    Start {
        plan: VoicePlan,
        restart: Option<usize>,
    },
}

fn offset_kind(param: SourceParam) -> Option<OffsetKind> {
    match param {
        SourceParam::SecOffset | SourceParam::SecOffsetLatency | SourceParam::SecOffsetClock => {
            Some(OffsetKind::Seconds)
        }
        SourceParam::SampleOffset
        | SourceParam::SampleOffsetLatency
        | SourceParam::SampleOffsetClock => Some(OffsetKind::Samples),
        SourceParam::ByteOffset => Some(OffsetKind::Bytes),
        _ => None,
    }
}

fn type_mismatch(param: SourceParam, value: &SourceValue) -> AlError {
    AlError::InvalidEnum(format!("{:?} cannot take {:?}", param, value))
}

impl ContextShared {
    /// The voice still bound to `id` through the source's hint.
    pub(crate) fn bound_voice(&self, id: u32, source: &Source) -> Option<usize> {
        let index = source.voice?;
        let voice = self.voices.current().get(index)?;
        (voice.source_id.load(Ordering::Acquire) == id).then_some(index)
    }

    /// Brings the API-side state in line with the mixer: a playing or
    /// paused source whose voice let go of it has stopped.
    pub(crate) fn refresh_state(&self, id: u32, source: &mut Source) -> Option<usize> {
        let voice = self.bound_voice(id, source);
        if voice.is_none() {
            source.voice = None;
            if matches!(source.state, SourceState::Playing | SourceState::Paused) {
                source.state = SourceState::Stopped;
                source.pending_offset = None;
            }
        }
        voice
    }

    fn voice(&self, index: usize) -> &Arc<Voice> {
        &self.voices.current()[index]
    }

    /// Hands the source's properties to its voice. Without a voice there is
    /// nothing to update; the next play snapshots them.
    fn publish_source(&self, id: u32, source: &mut Source, slots: &IdTable<SlotObject>) {
        let Some(index) = self.bound_voice(id, source) else {
            source.dirty = false;
            return;
        };
        let props = voice_props(source, slots);
        match self
            .voice_free
            .publish(&self.voice(index).update, |record| *record = props)
        {
            Ok(()) => source.dirty = false,
            Err(err) => {
                log::warn!("Source {} update deferred: {}", id, err);
                source.dirty = true;
            }
        }
    }

    /// Publishes or defers after a property change.
    fn commit_source(&self, id: u32, deferred: bool, source: &mut Source, slots: &IdTable<SlotObject>) {
        if deferred {
            source.dirty = true;
        } else {
            self.publish_source(id, source, slots);
        }
    }

    pub(crate) fn publish_dirty_sources(&self, state: &mut ContextState) {
        let ContextState { sources, slots, .. } = state;
        for (id, source) in sources.iter_mut() {
            if source.dirty {
                self.publish_source(id, source, slots);
            }
        }
    }

    pub(crate) fn republish_sources(&self, state: &mut ContextState) {
        let ContextState { sources, slots, .. } = state;
        for (id, source) in sources.iter_mut() {
            self.publish_source(id, source, slots);
        }
    }

    /// Makes sure `count` voices are idle, doubling the pool as needed.
    fn reserve_voices(&self, count: usize, counter: &MixCounter) -> Result<()> {
        let voices = self.voices.current();
        let idle = voices.iter().filter(|voice| voice.is_idle()).count();
        if idle >= count {
            return Ok(());
        }
        let grow = (count - idle).max(voices.len());
        let mut next = Vec::new();
        next.try_reserve_exact(voices.len() + grow)
            .map_err(|_| AlError::OutOfMemory("failed to grow the voice pool".into()))?;
        next.extend(voices.iter().cloned());
        next.extend((0..grow).map(|_| Arc::new(Voice::new())));
        let total = next.len();
        drop(self.voices.replace(next, counter));
        log::debug!("Voice pool grown to {}", total);
        Ok(())
    }

    /// Grows the pool as needed and picks `count` distinct idle voices.
    /// Nothing is claimed until the voices are started.
    fn claim_voices(&self, count: usize, counter: &MixCounter) -> Result<Vec<usize>> {
        self.reserve_voices(count, counter)?;
        let picked: Vec<usize> = self
            .voices
            .current()
            .iter()
            .enumerate()
            .filter(|(_, voice)| voice.is_idle())
            .map(|(index, _)| index)
            .take(count)
            .collect();
        if picked.len() < count {
            return Err(AlError::OutOfMemory("no idle voice".into()));
        }
        Ok(picked)
    }

    /// Prepares the idle voice at `index` to play `source` from `plan`.
    #[allow(clippy::too_many_arguments)]
    fn start_voice(
        &self,
        index: usize,
        id: u32,
        source: &Source,
        plan: VoicePlan,
        fade_in: bool,
        listener: &ListenerParams,
        device: &DeviceParams,
        slots: &IdTable<SlotObject>,
    ) {
        self.voice(index).start(
            VoiceStart {
                source_id: id,
                props: voice_props(source, slots),
                format: plan.format,
                head: plan.head,
                item: plan.item,
                pos: plan.pos.pos,
                frac: plan.pos.frac,
                is_static: source.source_type == SourceType::Static,
                fade_in,
            },
            listener,
            device,
            &self.voice_free,
        );
        self.extend_active(index);
    }

    fn mark_pending(&self, index: usize) {
        self.voice(index)
            .pending_change
            .store(true, Ordering::Release);
    }
}

impl Context {
    fn check_ids(state: &ContextState, ids: &[SourceId]) -> Result<()> {
        for id in ids {
            state.sources.lookup(id.0)?;
        }
        Ok(())
    }

    /// Allocates `count` sources. Fails without allocating any if the
    /// table cannot hold them all.
    pub fn gen_sources(&self, count: usize) -> Result<Vec<SourceId>> {
        let resampler = self.device.params().resampler;
        let result = self.shared.state.lock().sources.insert_n(count, |_| {
            let mut source = Source::new();
            source.props.resampler = resampler;
            source
        });
        self.record(result.map(|ids| ids.into_iter().map(SourceId).collect()))
    }

    /// Deletes sources, stopping any still playing. Validates every ID
    /// before deleting any.
    pub fn delete_sources(&self, ids: &[SourceId]) -> Result<()> {
        let result = (|| {
            let mut state = self.shared.state.lock();
            Self::check_ids(&state, ids)?;
            let ContextState { sources, slots, .. } = &mut *state;
            let mut buffers = self.device.buffers.lock();
            let mut changes = Vec::new();
            for id in ids {
                let Some(mut source) = sources.remove(id.0) else {
                    continue;
                };
                if let Some(index) = self.shared.bound_voice(id.0, &source) {
                    self.shared.voice(index).release_source(id.0);
                    self.shared.mark_pending(index);
                    changes.push(VoiceChange {
                        old_voice: None,
                        voice: Some(index),
                        source_id: id.0,
                        state: VoiceChangeState::Stop,
                    });
                }
                for item in source.queue.drain(..) {
                    if let Some(buffer) = buffers.get_mut(item.buffer_id) {
                        buffer.ref_count = buffer.ref_count.saturating_sub(1);
                    }
                }
                for send in &source.sends {
                    if let Some(slot) = send.slot.and_then(|slot| slots.get_mut(slot)) {
                        slot.ref_count = slot.ref_count.saturating_sub(1);
                    }
                }
            }
            self.shared.voice_changes.submit(&changes);
            Ok(())
        })();
        self.record(result)
    }

    pub fn is_source(&self, id: SourceId) -> bool {
        self.shared.state.lock().sources.contains(id.0)
    }

    pub fn set_source(&self, id: SourceId, param: SourceParam, value: impl Into<SourceValue>) -> Result<()> {
        let value = value.into();
        let result = (|| {
            if param.is_read_only() {
                return Err(AlError::InvalidOperation(format!(
                    "{:?} is read-only",
                    param
                )));
            }
            let mut state = self.shared.state.lock();
            state.sources.lookup(id.0)?;
            match param {
                SourceParam::Buffer => self.set_static_buffer(&mut state, id.0, &value),
                SourceParam::DirectFilter => self.set_direct_filter(&mut state, id.0, &value),
                SourceParam::AuxSendFilter => self.set_aux_send(&mut state, id.0, &value),
                SourceParam::SecOffset | SourceParam::SampleOffset | SourceParam::ByteOffset => {
                    self.set_offset(&mut state, id.0, param, &value)
                }
                _ => {
                    let deferred = state.deferred;
                    let ContextState { sources, slots, .. } = &mut *state;
                    let source = sources.lookup_mut(id.0)?;
                    source.set_property(param, &value)?;
                    self.shared.commit_source(id.0, deferred, source, slots);
                    Ok(())
                }
            }
        })();
        self.record(result)
    }

    fn set_static_buffer(&self, state: &mut ContextState, id: u32, value: &SourceValue) -> Result<()> {
        let SourceValue::Buffer(buffer) = *value else {
            return Err(type_mismatch(SourceParam::Buffer, value));
        };
        let ContextState {
            sources,
            next_serial,
            ..
        } = state;
        let source = sources.lookup_mut(id)?;
        self.shared.refresh_state(id, source);
        if matches!(source.state, SourceState::Playing | SourceState::Paused) {
            return Err(AlError::InvalidOperation(format!(
                "setting buffer on playing or paused source {}",
                id
            )));
        }

        let mut buffers = self.device.buffers.lock();
        let new_data = match buffer {
            Some(buffer_id) => {
                let buffer = buffers.lookup(buffer_id.0)?;
                if !buffer.queueable() {
                    return Err(AlError::InvalidOperation(format!(
                        "buffer {} is mapped without persistent access",
                        buffer_id
                    )));
                }
                Some((buffer_id.0, buffer.data.clone()))
            }
            None => None,
        };

        for item in source.queue.drain(..) {
            if let Some(old) = buffers.get_mut(item.buffer_id) {
                old.ref_count = old.ref_count.saturating_sub(1);
            }
        }
        source.pending_offset = None;
        match new_data {
            Some((buffer_id, data)) => {
                if let Some(buffer) = buffers.get_mut(buffer_id) {
                    buffer.ref_count += 1;
                }
                *next_serial += 1;
                source
                    .queue
                    .push_back(Arc::new(QueueItem::new(*next_serial, buffer_id, Some(data))));
                source.source_type = SourceType::Static;
            }
            None => source.source_type = SourceType::Undetermined,
        }
        Ok(())
    }

    fn set_direct_filter(&self, state: &mut ContextState, id: u32, value: &SourceValue) -> Result<()> {
        let SourceValue::Filter(filter) = *value else {
            return Err(type_mismatch(SourceParam::DirectFilter, value));
        };
        let params = match filter {
            Some(filter) => self.device.filters.lock().lookup(filter.0)?.params(),
            None => FilterParams::default(),
        };
        let deferred = state.deferred;
        let ContextState { sources, slots, .. } = state;
        let source = sources.lookup_mut(id)?;
        source.direct = params;
        self.shared.commit_source(id, deferred, source, slots);
        Ok(())
    }

    fn set_aux_send(&self, state: &mut ContextState, id: u32, value: &SourceValue) -> Result<()> {
        let SourceValue::AuxSend { slot, send, filter } = *value else {
            return Err(type_mismatch(SourceParam::AuxSendFilter, value));
        };
        let num_sends = self.device.params().num_sends;
        if send >= num_sends {
            return Err(AlError::InvalidValue(format!(
                "send {} out of range, device has {}",
                send, num_sends
            )));
        }
        let deferred = state.deferred;
        let ContextState { sources, slots, .. } = state;
        if let Some(slot) = slot {
            slots.lookup(slot.0)?;
        }
        let params = match filter {
            Some(filter) => self.device.filters.lock().lookup(filter.0)?.params(),
            None => FilterParams::default(),
        };

        let source = sources.lookup_mut(id)?;
        let old = source.sends[send].slot;
        let new = slot.map(|slot| slot.0);
        if old != new {
            if let Some(slot) = new.and_then(|slot| slots.get_mut(slot)) {
                slot.ref_count += 1;
            }
            if let Some(slot) = old.and_then(|slot| slots.get_mut(slot)) {
                slot.ref_count = slot.ref_count.saturating_sub(1);
            }
        }
        source.sends[send] = SourceSend {
            slot: new,
            filter: params,
        };
        self.shared.commit_source(id, deferred, source, slots);
        Ok(())
    }

    /// Seeks a source. A playing or paused source restarts on a fresh voice
    /// at the new position; otherwise the offset applies at the next play.
    fn set_offset(
        &self,
        state: &mut ContextState,
        id: u32,
        param: SourceParam,
        value: &SourceValue,
    ) -> Result<()> {
        let kind = offset_kind(param).ok_or_else(|| type_mismatch(param, value))?;
        let offset = value.as_f64().ok_or_else(|| type_mismatch(param, value))?;
        if !offset.is_finite() || offset < 0.0 {
            return Err(AlError::InvalidValue(format!("offset out of range: {}", offset)));
        }

        let listener = state.listener_params();
        let ContextState { sources, slots, .. } = state;
        let source = sources.lookup_mut(id)?;
        let Some(old) = self.shared.refresh_state(id, source) else {
            source.pending_offset = Some((kind, offset));
            return Ok(());
        };

        let pos = source.find_offset(kind, offset).ok_or_else(|| {
            AlError::InvalidValue(format!("offset {} past the end of the queue", offset))
        })?;
        let plan = VoicePlan::new(id, source, pos)?;
        let index = self.shared.claim_voices(1, &self.device.mix_count)?[0];
        let device = self.device.params();
        self.shared
            .start_voice(index, id, source, plan, true, &listener, &device, slots);
        self.shared.mark_pending(old);
        self.shared.voice_changes.submit(&[VoiceChange {
            old_voice: Some(old),
            voice: Some(index),
            source_id: id,
            state: VoiceChangeState::Restart,
        }]);
        source.voice = Some(index);
        source.pending_offset = None;
        Ok(())
    }

    pub fn get_source(&self, id: SourceId, param: SourceParam) -> Result<SourceValue> {
        let result = (|| {
            let mut state = self.shared.state.lock();
            let source = state.sources.lookup_mut(id.0)?;
            self.shared.refresh_state(id.0, source);
            let value = match param {
                SourceParam::State => SourceValue::State(source.state),
                SourceParam::BuffersProcessed => {
                    let serial = self.current_position(id.0, source).0.and_then(|p| p.0);
                    SourceValue::Int(source.processed_count(serial) as i64)
                }
                SourceParam::Buffer => SourceValue::Buffer(
                    source
                        .queue
                        .front()
                        .filter(|_| source.source_type == SourceType::Static)
                        .map(|item| BufferId(item.buffer_id)),
                ),
                SourceParam::SecOffset | SourceParam::SampleOffset | SourceParam::ByteOffset => {
                    let kind = offset_kind(param).unwrap_or(OffsetKind::Seconds);
                    SourceValue::Double(self.current_offset(id.0, source, kind).0)
                }
                SourceParam::SampleOffsetLatency | SourceParam::SecOffsetLatency => {
                    let kind = offset_kind(param).unwrap_or(OffsetKind::Seconds);
                    let (offset, _) = self.current_offset(id.0, source, kind);
                    SourceValue::OffsetTime {
                        offset,
                        nanos: self.device.latency().as_nanos() as u64,
                    }
                }
                SourceParam::SampleOffsetClock | SourceParam::SecOffsetClock => {
                    let kind = offset_kind(param).unwrap_or(OffsetKind::Seconds);
                    let (offset, clock) = self.current_offset(id.0, source, kind);
                    SourceValue::OffsetTime {
                        offset,
                        nanos: clock,
                    }
                }
                SourceParam::DirectFilter | SourceParam::AuxSendFilter => {
                    return Err(AlError::InvalidEnum(format!("{:?} cannot be queried", param)));
                }
                other => source
                    .get_property(other)
                    .ok_or_else(|| AlError::InvalidEnum(format!("{:?} cannot be queried", other)))?,
            };
            Ok(value)
        })();
        self.record(result)
    }

    pub fn source_state(&self, id: SourceId) -> Result<SourceState> {
        match self.get_source(id, SourceParam::State)? {
            SourceValue::State(state) => Ok(state),
            other => Err(AlError::InvalidEnum(format!("unexpected state value {:?}", other))),
        }
    }

    /// The voice's (serial, pos, frac) read consistently with the device
    /// clock in nanoseconds.
    #[allow(clippy::type_complexity)]
    fn current_position(&self, id: u32, source: &Source) -> (Option<(Option<u64>, usize, u32)>, u64) {
        match self.shared.bound_voice(id, source) {
            Some(index) => {
                let voice = self.shared.voice(index);
                let (position, clock) = self
                    .device
                    .mix_count
                    .read_consistent(|| (voice.position(), self.device.clock_time()));
                (
                    Some((position.serial, position.pos, position.frac)),
                    clock.as_nanos() as u64,
                )
            }
            None => (None, self.device.clock_time().as_nanos() as u64),
        }
    }

    /// Playback offset in `kind` units and the clock it was sampled at.
    fn current_offset(&self, id: u32, source: &Source, kind: OffsetKind) -> (f64, u64) {
        let (position, clock) = self.current_position(id, source);
        let offset = match position {
            Some((Some(serial), pos, frac)) => source.offset_of(kind, serial, pos, frac),
            Some((None, _, _)) => 0.0,
            None => source
                .pending_offset
                .and_then(|(pending, value)| source.find_offset(pending, value))
                .and_then(|pos| {
                    let serial = source.queue.get(pos.item)?.serial;
                    Some(source.offset_of(kind, serial, pos.pos, pos.frac))
                })
                .unwrap_or(0.0),
        };
        (offset, clock)
    }

    pub fn play_source(&self, id: SourceId) -> Result<()> {
        self.play_sources(&[id])
    }

    /// Starts, resumes or restarts sources. All changes reach the mixer in
    /// the same block.
    pub fn play_sources(&self, ids: &[SourceId]) -> Result<()> {
        let result = self.play_inner(ids);
        self.record(result)
    }

    fn play_inner(&self, ids: &[SourceId]) -> Result<()> {
        let mut state = self.shared.state.lock();
        Self::check_ids(&state, ids)?;

        let mut immediate = Vec::new();
        if !self.device.is_connected() {
            for id in ids {
                if let Some(source) = state.sources.get_mut(id.0) {
                    source.state = SourceState::Stopped;
                    source.voice = None;
                    source.pending_offset = None;
                    immediate.push(id.0);
                }
            }
            drop(state);
            self.dispatch_stopped(&immediate);
            return Ok(());
        }

        let listener = state.listener_params();
        let ContextState { sources, slots, .. } = &mut *state;

        // Resolve every source before touching any voice so a failure
        // leaves the whole batch unplayed.
        let mut planned: Vec<(u32, PlayAction)> = Vec::with_capacity(ids.len());
        for id in ids {
            if planned.iter().any(|(seen, _)| *seen == id.0) {
                continue;
            }
            let Some(source) = sources.get_mut(id.0) else {
                continue;
            };
            let current = self.shared.refresh_state(id.0, source);
            let action = match (source.state, current) {
                (SourceState::Paused, Some(index)) => PlayAction::Resume(index),
                _ => match start_position(source) {
                    Some(pos) => PlayAction::Start {
                        plan: VoicePlan::new(id.0, source, pos)?,
                        restart: current.filter(|_| source.state == SourceState::Playing),
                    },
                    None => PlayAction::Stop,
                },
            };
            planned.push((id.0, action));
        }
        let starts = planned
            .iter()
            .filter(|(_, action)| matches!(action, PlayAction::Start { .. }))
            .count();
        let mut claimed = self
            .shared
            .claim_voices(starts, &self.device.mix_count)?
            .into_iter();

        let device = self.device.params();
        let mut changes = Vec::with_capacity(planned.len());
        for (id, action) in planned {
            let Some(source) = sources.get_mut(id) else {
                continue;
            };
            match action {
                PlayAction::Resume(index) => {
                    self.shared.mark_pending(index);
                    changes.push(VoiceChange {
                        old_voice: None,
                        voice: Some(index),
                        source_id: id,
                        state: VoiceChangeState::Play,
                    });
                    source.state = SourceState::Playing;
                }
                PlayAction::Stop => {
                    source.state = SourceState::Stopped;
                    source.voice = None;
                    source.pending_offset = None;
                    immediate.push(id);
                }
                PlayAction::Start { plan, restart } => {
                    let Some(index) = claimed.next() else {
                        continue;
                    };
                    self.shared.start_voice(
                        index,
                        id,
                        source,
                        plan,
                        restart.is_some(),
                        &listener,
                        &device,
                        slots,
                    );
                    if let Some(old) = restart {
                        self.shared.mark_pending(old);
                    }
                    changes.push(VoiceChange {
                        old_voice: restart,
                        voice: Some(index),
                        source_id: id,
                        state: if restart.is_some() {
                            VoiceChangeState::Restart
                        } else {
                            VoiceChangeState::Play
                        },
                    });
                    source.voice = Some(index);
                    source.state = SourceState::Playing;
                    source.pending_offset = None;
                    source.dirty = false;
                }
            }
        }

        self.shared.voice_changes.submit(&changes);
        drop(state);
        self.dispatch_stopped(&immediate);
        Ok(())
    }

    /// Reports sources that stopped without reaching the mixer.
    fn dispatch_stopped(&self, ids: &[u32]) {
        for &source_id in ids {
            self.shared.events.dispatch_now(&AlEvent::SourceStateChanged {
                source_id,
                state: SourceState::Stopped,
            });
        }
    }

    pub fn pause_source(&self, id: SourceId) -> Result<()> {
        self.pause_sources(&[id])
    }

    pub fn pause_sources(&self, ids: &[SourceId]) -> Result<()> {
        let result = (|| {
            let mut state = self.shared.state.lock();
            Self::check_ids(&state, ids)?;
            let mut changes = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(source) = state.sources.get_mut(id.0) else {
                    continue;
                };
                let current = self.shared.refresh_state(id.0, source);
                if let (SourceState::Playing, Some(index)) = (source.state, current) {
                    self.shared.mark_pending(index);
                    changes.push(VoiceChange {
                        old_voice: None,
                        voice: Some(index),
                        source_id: id.0,
                        state: VoiceChangeState::Pause,
                    });
                    source.state = SourceState::Paused;
                }
            }
            self.shared.voice_changes.submit(&changes);
            Ok(())
        })();
        self.record(result)
    }

    pub fn stop_source(&self, id: SourceId) -> Result<()> {
        self.stop_sources(&[id])
    }

    pub fn stop_sources(&self, ids: &[SourceId]) -> Result<()> {
        let result = self.halt(ids, VoiceChangeState::Stop);
        self.record(result)
    }

    pub fn rewind_source(&self, id: SourceId) -> Result<()> {
        self.rewind_sources(&[id])
    }

    /// Stops sources and returns them to the initial state.
    pub fn rewind_sources(&self, ids: &[SourceId]) -> Result<()> {
        let result = self.halt(ids, VoiceChangeState::Reset);
        self.record(result)
    }

    fn halt(&self, ids: &[SourceId], change: VoiceChangeState) -> Result<()> {
        let mut state = self.shared.state.lock();
        Self::check_ids(&state, ids)?;
        let mut changes = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(source) = state.sources.get_mut(id.0) else {
                continue;
            };
            let current = self.shared.refresh_state(id.0, source);
            if let Some(index) = current {
                self.shared.mark_pending(index);
            }
            changes.push(VoiceChange {
                old_voice: None,
                voice: current,
                source_id: id.0,
                state: change,
            });
            source.voice = None;
            source.pending_offset = None;
            source.state = match change {
                VoiceChangeState::Reset => SourceState::Initial,
                _ if source.state == SourceState::Initial => SourceState::Initial,
                _ => SourceState::Stopped,
            };
        }
        self.shared.voice_changes.submit(&changes);
        Ok(())
    }

    /// Appends buffers to a streaming source. All buffers must share the
    /// queue's format; on any failure the queue is unchanged.
    pub fn queue_buffers(&self, id: SourceId, buffer_ids: &[BufferId]) -> Result<()> {
        let result = (|| {
            let mut state = self.shared.state.lock();
            let ContextState {
                sources,
                next_serial,
                ..
            } = &mut *state;
            let source = sources.lookup_mut(id.0)?;
            if source.source_type == SourceType::Static {
                return Err(AlError::InvalidOperation(format!(
                    "queueing onto static source {}",
                    id
                )));
            }

            let mut buffers = self.device.buffers.lock();
            let mut format = source.queue_format().cloned();
            let mut staged = Vec::with_capacity(buffer_ids.len());
            for buffer_id in buffer_ids {
                let buffer = buffers.lookup(buffer_id.0)?;
                if !buffer.queueable() {
                    return Err(AlError::InvalidOperation(format!(
                        "queueing non-persistently mapped buffer {}",
                        buffer_id
                    )));
                }
                match &format {
                    Some(format) if !format.same_format(&buffer.data) => {
                        return Err(AlError::InvalidOperation(format!(
                            "buffer {} does not match the queue format",
                            buffer_id
                        )));
                    }
                    Some(_) => {}
                    None => format = Some(buffer.data.clone()),
                }
                staged.push((buffer_id.0, buffer.data.clone()));
            }

            let items: Vec<Arc<QueueItem>> = staged
                .into_iter()
                .map(|(buffer_id, data)| {
                    if let Some(buffer) = buffers.get_mut(buffer_id) {
                        buffer.ref_count += 1;
                    }
                    *next_serial += 1;
                    Arc::new(QueueItem::new(*next_serial, buffer_id, Some(data)))
                })
                .collect();
            for pair in items.windows(2) {
                let _ = pair[0].next.set(pair[1].clone());
            }
            if let (Some(last), Some(first)) = (source.queue.back(), items.first()) {
                if last.next.set(first.clone()).is_err() {
                    log::warn!("Queue tail of source {} already linked", id);
                }
            }
            source.queue.extend(items);
            source.source_type = SourceType::Streaming;
            Ok(())
        })();
        self.record(result)
    }

    /// Removes up to `count` processed buffers from the front of the queue.
    pub fn unqueue_buffers(&self, id: SourceId, count: usize) -> Result<Vec<BufferId>> {
        let result = (|| {
            let mut state = self.shared.state.lock();
            let source = state.sources.lookup_mut(id.0)?;
            if count == 0 {
                return Ok(Vec::new());
            }
            if source.props.looping {
                return Err(AlError::InvalidValue(format!(
                    "unqueueing from looping source {}",
                    id
                )));
            }
            if source.source_type != SourceType::Streaming {
                return Err(AlError::InvalidValue(format!(
                    "unqueueing from non-streaming source {}",
                    id
                )));
            }
            self.shared.refresh_state(id.0, source);
            let serial = self.current_position(id.0, source).0.and_then(|p| p.0);
            let processed = source.processed_count(serial);
            if count > processed {
                return Err(AlError::InvalidValue(format!(
                    "unqueueing {} buffers, only {} processed",
                    count, processed
                )));
            }

            let mut buffers = self.device.buffers.lock();
            let removed = source
                .queue
                .drain(..count)
                .map(|item| {
                    if let Some(buffer) = buffers.get_mut(item.buffer_id) {
                        buffer.ref_count = buffer.ref_count.saturating_sub(1);
                    }
                    BufferId(item.buffer_id)
                })
                .collect();
            Ok(removed)
        })();
        self.record(result)
    }
}
