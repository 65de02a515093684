//! Voices: the mixer-side executors of playing sources.
//!
//! A voice is claimed and prepared on an API thread while it is idle, then
//! driven by the mixer once a play change binds it. Everything the mixer
//! mutates lives in [`VoiceMix`] behind a lock the API only takes while the
//! voice is idle; the API observes progress through the atomics on
//! [`Voice`].

use crate::buffer::{BufferCallbackFn, BufferData};
use crate::config::MAX_SENDS;
use crate::context::listener::ListenerParams;
use crate::device::DeviceParams;
use crate::dsp::biquad::{BiquadFilter, BiquadType, FilterType, apply_filters};
use crate::dsp::hrtf::{HrtfChannelState, direction_angles};
use crate::dsp::mix::mix_samples;
use crate::dsp::nfc::NfcFilter;
use crate::dsp::panning::{
    ChannelGains, Panner, bformat_input, remix_candidates, source_channel_azimuth,
};
use crate::dsp::resampler::{Resampler, source_span};
use crate::dsp::{
    AIR_ABSORB_GAIN_HF, BUFFER_LINE_SIZE, BufferLine, GAIN_MIX_MAX, MAX_OUTPUT_CHANNELS,
    MAX_PITCH, MAX_RESAMPLER_EDGE, MAX_RESAMPLER_PADDING, MIXER_FRAC_BITS, MIXER_FRAC_MASK,
    MIXER_FRAC_ONE, SPEED_OF_SOUND_METERS_PER_SEC,
};
use crate::effect_slot::EffectSlot;
use crate::filter::{FilterParams, MIN_FILTER_GAIN};
use crate::format::{Channel, FmtChannels, load_samples};
use crate::math::{Mat3, Vec3};
use crate::props::{PropsFreeList, UpdateSlot};
use crate::source::{DirectMode, DistanceModel, QueueItem, SourceProps, SpatializeMode};
use parking_lot::Mutex;
use std::f32::consts::{PI, TAU};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

const EDGE: usize = MAX_RESAMPLER_EDGE;

/// Frames of source data one resampling pass may need after the history.
const MAX_SOURCE_FRAMES: usize = BUFFER_LINE_SIZE + MAX_RESAMPLER_PADDING + 1;

/// Ambisonic first-order axes in listener space, by ACN index 1 to 3.
const FIRST_ORDER_AXES: [Vec3; 3] = [Vec3::NEG_X, Vec3::Y, Vec3::NEG_Z];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VoiceState {
    Stopped,
    Playing,
    /// Fading out over the next block.
    Stopping,
    /// Claimed and prepared, waiting for its play change.
    Pending,
}

impl VoiceState {
    fn to_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Playing => 1,
            Self::Stopping => 2,
            Self::Pending => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Playing,
            2 => Self::Stopping,
            3 => Self::Pending,
            _ => Self::Stopped,
        }
    }
}

/// One auxiliary send as the mixer sees it.
#[derive(Debug, Clone, Default)]
pub(crate) struct VoiceSend {
    pub(crate) slot: Option<Arc<EffectSlot>>,
    pub(crate) filter: FilterParams,
}

/// Property record published to a voice.
#[derive(Debug, Clone, Default)]
pub(crate) struct VoiceProps {
    pub(crate) source: SourceProps,
    pub(crate) direct: FilterParams,
    pub(crate) sends: [VoiceSend; MAX_SENDS],
}

/// Where a voice is, as last stored by the mixer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VoicePosition {
    /// Serial of the queue item being played, `None` past the end.
    pub(crate) serial: Option<u64>,
    pub(crate) pos: usize,
    pub(crate) frac: u32,
}

pub(crate) struct Voice {
    pub(crate) source_id: AtomicU32,
    state: AtomicU8,
    /// Set by the API when it queues a change for this voice, cleared by
    /// the mixer once applied.
    pub(crate) pending_change: AtomicBool,
    position: AtomicUsize,
    position_frac: AtomicU32,
    current_serial: AtomicU64,
    pub(crate) update: UpdateSlot<VoiceProps>,
    pub(crate) mix: Mutex<VoiceMix>,
}

impl std::fmt::Debug for Voice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Voice")
            .field("source_id", &self.source_id.load(Ordering::Relaxed))
            .field("state", &self.state())
            .finish()
    }
}

/// Everything a voice start needs, gathered by the context.
pub(crate) struct VoiceStart {
    pub(crate) source_id: u32,
    pub(crate) props: VoiceProps,
    pub(crate) format: Arc<BufferData>,
    /// First item of the queue, where looping restarts.
    pub(crate) head: Arc<QueueItem>,
    pub(crate) item: Arc<QueueItem>,
    pub(crate) pos: usize,
    pub(crate) frac: u32,
    pub(crate) is_static: bool,
    /// Ramp in from silence instead of starting at full gain.
    pub(crate) fade_in: bool,
}

/// Per-block inputs shared by every voice of a context.
pub(crate) struct MixEnv<'a> {
    pub(crate) listener: &'a ListenerParams,
    pub(crate) device: &'a DeviceParams,
    pub(crate) free: &'a PropsFreeList<VoiceProps>,
    /// False while the API is publishing a deferred batch.
    pub(crate) apply_updates: bool,
    /// Listener or context values changed this block.
    pub(crate) force_recalc: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MixOutcome {
    pub(crate) buffers_completed: u32,
    /// The voice ran out of data and stopped itself.
    pub(crate) ended: bool,
}

/// Scratch lines reused by every voice in a pass.
pub(crate) struct MixScratch {
    src: Vec<f32>,
    resampled: Box<BufferLine>,
    filtered: Box<BufferLine>,
}

impl MixScratch {
    pub(crate) fn new() -> Self {
        Self {
            src: vec![0.0; EDGE + MAX_SOURCE_FRAMES],
            resampled: Box::new([0.0; BUFFER_LINE_SIZE]),
            filtered: Box::new([0.0; BUFFER_LINE_SIZE]),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct DirectParams {
    low_pass: BiquadFilter,
    high_pass: BiquadFilter,
    nfc: NfcFilter,
    hrtf: HrtfChannelState,
    current: ChannelGains,
    target: ChannelGains,
}

#[derive(Debug, Clone, Copy, Default)]
struct SendParams {
    low_pass: BiquadFilter,
    high_pass: BiquadFilter,
    current: ChannelGains,
    target: ChannelGains,
}

#[derive(Debug, Clone)]
struct ChannelData {
    /// Source samples preceding the current position.
    prev: [f32; EDGE],
    dry: DirectParams,
    wet: [SendParams; MAX_SENDS],
}

impl ChannelData {
    fn new(device: &DeviceParams) -> Self {
        let mut dry = DirectParams::default();
        if let Some(w1) = device.nfc_w1 {
            dry.nfc = NfcFilter::new(w1, w1);
        }
        Self {
            prev: [0.0; EDGE],
            dry,
            wet: [SendParams::default(); MAX_SENDS],
        }
    }
}

/// Samples produced by a buffer callback and not yet consumed.
#[derive(Debug, Default)]
struct CallbackState {
    bytes: Vec<u8>,
    frames: usize,
    stopped: bool,
}

/// Read position inside a source's queue.
#[derive(Debug, Default)]
pub(crate) struct Cursor {
    current: Option<Arc<QueueItem>>,
    head: Option<Arc<QueueItem>>,
    loop_start: Option<Arc<QueueItem>>,
    pos: usize,
    frac: u32,
    format: Option<Arc<BufferData>>,
    is_static: bool,
    callback: CallbackState,
}

impl Cursor {
    fn is_callback(&self) -> bool {
        self.current.as_ref().is_some_and(|item| item.is_callback())
    }

    fn serial(&self) -> Option<u64> {
        self.current.as_ref().map(|item| item.serial)
    }

    fn format_matches(&self) -> bool {
        match (self.format.as_ref(), self.current.as_ref().and_then(|i| i.data.as_ref())) {
            (Some(format), Some(data)) => format.same_format(data),
            _ => true,
        }
    }

    /// Pulls from the buffer callback until `needed` frames from the
    /// current position are available or the stream ends.
    fn refill_callback(&mut self, needed: usize) {
        let Self {
            current,
            pos,
            format,
            callback: cb,
            ..
        } = self;
        let Some(callback) = current
            .as_ref()
            .and_then(|item| item.data.as_ref())
            .and_then(|data| data.callback.as_deref())
        else {
            return;
        };
        let Some(frame_size) = format.as_ref().map(|f| f.frame_size()) else {
            return;
        };
        if cb.stopped || cb.frames.saturating_sub(*pos) >= needed {
            return;
        }

        let consumed = (*pos).min(cb.frames);
        cb.bytes
            .copy_within(consumed * frame_size..cb.frames * frame_size, 0);
        cb.frames -= consumed;
        *pos -= consumed;

        let start = cb.frames * frame_size;
        let end = cb.bytes.len() - cb.bytes.len() % frame_size;
        if start < end {
            let got = call_buffer_callback(callback, &mut cb.bytes[start..end]);
            cb.frames += got / frame_size;
            if got < end - start {
                cb.stopped = true;
            }
        }
    }

    /// Fills `dst` with channel `chan` from the current position on,
    /// following loops and the queue, and zero past the end.
    fn load(&self, looping: bool, chan: usize, dst: &mut [f32]) {
        let filled = match (self.current.as_deref(), self.format.as_deref()) {
            (Some(item), Some(format)) if item.is_callback() => {
                let have = self.callback.frames.saturating_sub(self.pos).min(dst.len());
                if have > 0 {
                    let at = self.pos * format.frame_size() + chan * format.sample_type.bytes();
                    load_samples(
                        &mut dst[..have],
                        &self.callback.bytes[at..],
                        format.channel_count(),
                        format.sample_type,
                    );
                }
                have
            }
            (Some(item), Some(_)) if self.is_static => load_static(item, self.pos, looping, chan, dst),
            (Some(item), Some(_)) => self.load_queue(item, chan, dst),
            _ => 0,
        };
        dst[filled..].fill(0.0);
    }

    fn load_queue(&self, first: &QueueItem, chan: usize, dst: &mut [f32]) -> usize {
        let mut item = first;
        let mut pos = self.pos;
        let mut filled = 0;
        let mut since_wrap = 0;
        while filled < dst.len() {
            let len = item.sample_len();
            if let Some(data) = item.data.as_deref() {
                if pos < len {
                    let count = (len - pos).min(dst.len() - filled);
                    copy_frames(data, pos, chan, &mut dst[filled..filled + count]);
                    filled += count;
                    pos += count;
                }
            }
            since_wrap += len;
            pos = pos.saturating_sub(len);
            item = match item.next.get() {
                Some(next) => next,
                None => match self.loop_start.as_deref() {
                    Some(start) if since_wrap > 0 => {
                        since_wrap = 0;
                        start
                    }
                    _ => break,
                },
            };
        }
        filled
    }

    /// Moves past `frames` consumed frames. Returns true once the data is
    /// exhausted.
    fn advance(&mut self, frames: usize, frac: u32, looping: bool, completed: &mut u32) -> bool {
        self.frac = frac;
        self.pos += frames;

        if self.is_callback() {
            return self.callback.stopped && self.pos >= self.callback.frames;
        }
        let Some(item) = self.current.as_ref() else {
            return true;
        };

        if self.is_static {
            let len = item.sample_len();
            let (start, end) = loop_range(item);
            if looping && end > start {
                if self.pos >= end {
                    self.pos = start + (self.pos - start) % (end - start);
                }
                return false;
            }
            return self.pos >= len;
        }

        let mut since_wrap = 0;
        loop {
            let Some(item) = self.current.as_ref() else {
                return true;
            };
            let len = item.sample_len();
            if self.pos < len {
                return false;
            }
            self.pos -= len;
            *completed += 1;
            since_wrap += len;
            let next = match item.next.get() {
                Some(next) => Some(next.clone()),
                None if since_wrap > 0 => {
                    since_wrap = 0;
                    self.loop_start.clone()
                }
                None => None,
            };
            self.current = next;
        }
    }
}

fn call_buffer_callback(callback: &BufferCallbackFn, bytes: &mut [u8]) -> usize {
    callback(bytes).min(bytes.len())
}

fn loop_range(item: &QueueItem) -> (usize, usize) {
    match item.data.as_deref() {
        Some(data) if data.loop_end > data.loop_start => (data.loop_start, data.loop_end),
        Some(data) => (0, data.sample_len),
        None => (0, 0),
    }
}

fn copy_frames(data: &BufferData, pos: usize, chan: usize, dst: &mut [f32]) {
    let at = pos * data.frame_size() + chan * data.sample_type.bytes();
    load_samples(dst, &data.samples[at..], data.channel_count(), data.sample_type);
}

fn load_static(item: &QueueItem, pos: usize, looping: bool, chan: usize, dst: &mut [f32]) -> usize {
    let Some(data) = item.data.as_deref() else {
        return 0;
    };
    let (start, end) = loop_range(item);
    if !(looping && end > start) {
        let count = data.sample_len.saturating_sub(pos).min(dst.len());
        if count > 0 {
            copy_frames(data, pos, chan, &mut dst[..count]);
        }
        return count;
    }

    let mut pos = pos;
    let mut filled = 0;
    while filled < dst.len() {
        if pos >= end {
            pos = start + (pos - start) % (end - start);
        }
        let count = (end - pos).min(dst.len() - filled);
        copy_frames(data, pos, chan, &mut dst[filled..filled + count]);
        filled += count;
        pos += count;
    }
    filled
}

/// Mixer-owned voice state.
pub(crate) struct VoiceMix {
    props: VoiceProps,
    cursor: Cursor,
    step: u32,
    resampler: Resampler,
    chans: Vec<ChannelData>,
    dry_filter: FilterType,
    send_filters: [FilterType; MAX_SENDS],
    num_sends: usize,
    is_ambisonic: bool,
    has_hrtf: bool,
    has_nfc: bool,
    needs_recalc: bool,
}

impl Default for VoiceMix {
    fn default() -> Self {
        Self {
            props: VoiceProps::default(),
            cursor: Cursor::default(),
            step: MIXER_FRAC_ONE,
            resampler: Resampler::default(),
            chans: Vec::new(),
            dry_filter: FilterType::None,
            send_filters: [FilterType::None; MAX_SENDS],
            num_sends: 0,
            is_ambisonic: false,
            has_hrtf: false,
            has_nfc: false,
            needs_recalc: false,
        }
    }
}

impl Voice {
    pub(crate) fn new() -> Self {
        Self {
            source_id: AtomicU32::new(0),
            state: AtomicU8::new(VoiceState::Stopped.to_u8()),
            pending_change: AtomicBool::new(false),
            position: AtomicUsize::new(0),
            position_frac: AtomicU32::new(0),
            current_serial: AtomicU64::new(0),
            update: UpdateSlot::new(),
            mix: Mutex::new(VoiceMix::default()),
        }
    }

    pub(crate) fn state(&self) -> VoiceState {
        VoiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: VoiceState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    /// Moves from `current` to `new` if the voice is still in `current`.
    pub(crate) fn transition(&self, current: VoiceState, new: VoiceState) -> bool {
        self.state
            .compare_exchange(current.to_u8(), new.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unbinds the voice if it still belongs to `source_id`.
    pub(crate) fn release_source(&self, source_id: u32) -> bool {
        self.source_id
            .compare_exchange(source_id, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Free to be claimed by a new play.
    pub(crate) fn is_idle(&self) -> bool {
        self.source_id.load(Ordering::Acquire) == 0
            && self.state() == VoiceState::Stopped
            && !self.pending_change.load(Ordering::Acquire)
    }

    /// Raw read; wrap in the device's consistent-read loop.
    pub(crate) fn position(&self) -> VoicePosition {
        let serial = self.current_serial.load(Ordering::Acquire);
        VoicePosition {
            serial: (serial != 0).then_some(serial),
            pos: self.position.load(Ordering::Acquire),
            frac: self.position_frac.load(Ordering::Acquire),
        }
    }

    fn store_position(&self, serial: Option<u64>, pos: usize, frac: u32) {
        self.position.store(pos, Ordering::Release);
        self.position_frac.store(frac, Ordering::Release);
        self.current_serial
            .store(serial.unwrap_or(0), Ordering::Release);
    }

    /// Prepares an idle voice for `start` on the calling API thread and
    /// leaves it pending its play change.
    pub(crate) fn start(
        &self,
        start: VoiceStart,
        listener: &ListenerParams,
        device: &DeviceParams,
        free: &PropsFreeList<VoiceProps>,
    ) {
        self.update.clear(free);
        let source_id = start.source_id;
        let fade_in = start.fade_in;
        {
            let mut m = self.mix.lock();
            m.prepare(start, device);
            m.calc_params(listener, device);
            m.settle_gains(fade_in);
            self.store_position(m.cursor.serial(), m.cursor.pos, m.cursor.frac);
        }
        self.source_id.store(source_id, Ordering::Release);
        self.pending_change.store(true, Ordering::Release);
        self.set_state(VoiceState::Pending);
    }

    /// Re-prepares the voice for a new device configuration. The device
    /// must not be mixing.
    pub(crate) fn reset_device(
        &self,
        listener: &ListenerParams,
        device: &DeviceParams,
        free: &PropsFreeList<VoiceProps>,
    ) {
        self.update.clear(free);
        let mut m = self.mix.lock();
        if m.chans.is_empty() {
            return;
        }
        let count = m.chans.len();
        m.chans.clear();
        m.chans.resize_with(count, || ChannelData::new(device));
        m.calc_params(listener, device);
        m.settle_gains(false);
    }

    /// Mixes one block of `samples_to_do` frames into `dry` and the wet
    /// buses of the voice's sends. Only called for playing or stopping
    /// voices.
    pub(crate) fn mix(
        &self,
        m: &mut VoiceMix,
        env: &MixEnv<'_>,
        dry: &mut [BufferLine],
        scratch: &mut MixScratch,
        samples_to_do: usize,
    ) -> MixOutcome {
        let state = self.state();
        let mut outcome = MixOutcome::default();

        if env.apply_updates && self.update.consume(env.free, |props| m.apply_props(props)) {
            m.needs_recalc = true;
        }
        if m.needs_recalc || env.force_recalc {
            m.calc_params(env.listener, env.device);
            m.needs_recalc = false;
        }

        if !m.cursor.format_matches() {
            log::warn!(
                "Voice for source {} lost its buffer format, stopping",
                self.source_id.load(Ordering::Relaxed)
            );
            outcome.ended = true;
        }

        let stopping = state == VoiceState::Stopping;
        if stopping {
            m.silence_targets();
        }
        let looping = m.props.source.looping;

        let mut out_pos = 0;
        while out_pos < samples_to_do && !outcome.ended {
            let step = m.step;
            let frac = m.cursor.frac;
            let max_count = ((((BUFFER_LINE_SIZE as u64) << MIXER_FRAC_BITS) - 1 - u64::from(frac))
                / u64::from(step)
                + 1) as usize;
            let count = (samples_to_do - out_pos).min(max_count);
            let frames = source_span(frac, step, count) + 1;
            if m.cursor.is_callback() {
                m.cursor.refill_callback(frames);
            }
            let end = u64::from(frac) + u64::from(step) * count as u64;
            let advance = (end >> MIXER_FRAC_BITS) as usize;
            let fade_left = samples_to_do - out_pos;

            for (c, chan) in m.chans.iter_mut().enumerate() {
                let src = &mut scratch.src[..EDGE + frames];
                src[..EDGE].copy_from_slice(&chan.prev);
                m.cursor.load(looping, c, &mut src[EDGE..]);
                let resampled = &mut scratch.resampled[..count];
                m.resampler.process(src, EDGE, frac, step, resampled);
                chan.prev.copy_from_slice(&src[advance..advance + EDGE]);

                let filtered = &mut scratch.filtered[..count];
                let dp = &mut chan.dry;
                apply_filters(m.dry_filter, &mut dp.low_pass, &mut dp.high_pass, resampled, filtered);
                if m.has_nfc {
                    dp.nfc.process_in_place(filtered);
                }
                if m.has_hrtf {
                    let (left, right) = dry.split_at_mut(1);
                    dp.hrtf.mix(filtered, &mut left[0], &mut right[0], out_pos, fade_left.min(count));
                } else {
                    mix_samples(filtered, dry, &mut dp.current, &dp.target, fade_left, out_pos);
                }

                for (s, (send, wp)) in m
                    .props
                    .sends
                    .iter()
                    .zip(chan.wet.iter_mut())
                    .take(m.num_sends)
                    .enumerate()
                {
                    let Some(slot) = send.slot.as_deref() else {
                        continue;
                    };
                    if !slot.is_active() {
                        continue;
                    }
                    let Some(mut slot_mix) = slot.mix.try_lock() else {
                        log::warn!("Failed to acquire effect slot lock in mixer");
                        continue;
                    };
                    apply_filters(m.send_filters[s], &mut wp.low_pass, &mut wp.high_pass, resampled, filtered);
                    mix_samples(filtered, &mut slot_mix.wet, &mut wp.current, &wp.target, fade_left, out_pos);
                }
            }

            out_pos += count;
            let new_frac = (end & u64::from(MIXER_FRAC_MASK)) as u32;
            if m.cursor.advance(advance, new_frac, looping, &mut outcome.buffers_completed) {
                outcome.ended = true;
            }
        }

        if stopping {
            self.set_state(VoiceState::Stopped);
            m.needs_recalc = true;
        }
        if outcome.ended {
            self.source_id.store(0, Ordering::Release);
            self.set_state(VoiceState::Stopped);
            self.store_position(None, 0, 0);
        } else {
            self.store_position(m.cursor.serial(), m.cursor.pos, m.cursor.frac);
        }
        outcome
    }
}

impl VoiceMix {
    fn prepare(&mut self, start: VoiceStart, device: &DeviceParams) {
        let VoiceStart {
            props,
            format,
            head,
            item,
            pos,
            frac,
            is_static,
            ..
        } = start;

        let count = format.channel_count();
        self.is_ambisonic = format.channels.is_bformat();
        self.cursor.callback.stopped = false;
        self.cursor.callback.frames = 0;
        if item.is_callback() {
            self.cursor.callback.bytes = vec![0; MAX_SOURCE_FRAMES * format.frame_size()];
        } else {
            self.cursor.callback.bytes = Vec::new();
        }
        self.cursor.pos = if item.is_callback() { 0 } else { pos };
        self.cursor.frac = frac;
        self.cursor.is_static = is_static;
        self.cursor.format = Some(format);
        self.cursor.current = Some(item);
        self.cursor.head = Some(head);
        self.props = props;
        self.update_loop_start();

        self.chans.clear();
        self.chans.resize_with(count, || ChannelData::new(device));
        self.needs_recalc = false;
    }

    /// Takes a published record. The old values go back with the record so
    /// they are released on an API thread.
    fn apply_props(&mut self, props: &mut VoiceProps) {
        std::mem::swap(&mut self.props, props);
        self.update_loop_start();
    }

    fn update_loop_start(&mut self) {
        self.cursor.loop_start = if self.props.source.looping && !self.cursor.is_static {
            self.cursor.head.clone()
        } else {
            None
        };
    }

    /// Jumps current gains to their targets, or to silence for a fade in.
    fn settle_gains(&mut self, fade_in: bool) {
        for chan in &mut self.chans {
            if fade_in {
                chan.dry.current = [0.0; MAX_OUTPUT_CHANNELS];
                chan.dry.hrtf.old = chan.dry.hrtf.target;
                chan.dry.hrtf.old.gain = 0.0;
            } else {
                chan.dry.current = chan.dry.target;
                chan.dry.hrtf.old = chan.dry.hrtf.target;
            }
            for wet in &mut chan.wet {
                wet.current = if fade_in {
                    [0.0; MAX_OUTPUT_CHANNELS]
                } else {
                    wet.target
                };
            }
        }
    }

    fn silence_targets(&mut self) {
        for chan in &mut self.chans {
            chan.dry.target = [0.0; MAX_OUTPUT_CHANNELS];
            chan.dry.hrtf.target.gain = 0.0;
            for wet in &mut chan.wet {
                wet.target = [0.0; MAX_OUTPUT_CHANNELS];
            }
        }
    }

    fn calc_params(&mut self, listener: &ListenerParams, device: &DeviceParams) {
        let Some(format) = self.cursor.format.clone() else {
            return;
        };
        let props = self.props.source;
        self.num_sends = device.num_sends.min(MAX_SENDS);

        let (position, velocity, direction, listener_velocity) = if props.head_relative {
            (props.position, props.velocity, props.direction, Vec3::ZERO)
        } else {
            (
                listener.matrix * (props.position - listener.position),
                listener.matrix * props.velocity,
                listener.matrix * props.direction,
                listener.velocity,
            )
        };
        let direction = direction.normalize_or_zero();
        let distance = position.length();
        let to_source = if distance > f32::EPSILON {
            position / distance
        } else {
            Vec3::ZERO
        };

        let model = if listener.source_distance_model {
            props.distance_model
        } else {
            listener.distance_model
        };
        let attenuation = distance_attenuation(model, &props, distance);
        let cone = cone_gains(&props, direction, to_source);

        let clamp_gain = |gain: f32| gain.max(props.min_gain).min(props.max_gain);
        let dry_gain = (clamp_gain(props.gain * attenuation.dry * cone.gain)
            * self.props.direct.gain
            * listener.gain)
            .min(GAIN_MIX_MAX);
        let mut dry_gain_hf = self.props.direct.gain_hf;
        if props.dry_gain_hf_auto {
            dry_gain_hf *= cone.gain_hf;
        }
        let dry_gain_lf = self.props.direct.gain_lf;

        let mut wet_base = props.gain * attenuation.wet;
        if props.wet_gain_auto {
            wet_base *= cone.gain;
        }
        let wet_cone_hf = if props.wet_gain_hf_auto { cone.gain_hf } else { 1.0 };
        let mut wet_gains = [(0.0f32, 1.0f32, 1.0f32); MAX_SENDS];
        for (wet, send) in wet_gains
            .iter_mut()
            .zip(&self.props.sends)
            .take(self.num_sends)
        {
            let Some(slot) = send.slot.as_deref() else {
                continue;
            };
            let base = if slot.aux_send_auto.load(Ordering::Relaxed) {
                wet_base
            } else {
                props.gain
            };
            *wet = (
                (clamp_gain(base) * send.filter.gain * listener.gain).min(GAIN_MIX_MAX),
                send.filter.gain_hf * wet_cone_hf,
                send.filter.gain_lf,
            );
        }

        if attenuation.clamped_distance > props.ref_distance && props.air_absorption_factor > 0.0 {
            let meters = (attenuation.clamped_distance - props.ref_distance)
                * props.rolloff_factor
                * listener.meters_per_unit;
            let hf_attn = AIR_ABSORB_GAIN_HF.powf(meters * props.air_absorption_factor);
            dry_gain_hf *= hf_attn;
            if props.wet_gain_hf_auto {
                for wet in &mut wet_gains {
                    wet.1 *= hf_attn;
                }
            }
        }

        let mut pitch = props.pitch;
        let doppler = props.doppler_factor * listener.doppler_factor;
        if doppler > 0.0 {
            pitch *= doppler_shift(
                velocity.dot(to_source) * -doppler,
                listener_velocity.dot(to_source) * -doppler,
                listener.speed_of_sound,
            );
        }
        pitch *= format.frequency as f32 / device.sample_rate as f32;
        self.step = if pitch > MAX_PITCH as f32 {
            MAX_PITCH << MIXER_FRAC_BITS
        } else {
            ((pitch * MIXER_FRAC_ONE as f32) as u32).max(1)
        };
        self.resampler = Resampler::prepare(props.resampler, self.step);

        self.calc_panning(&props, &format, listener, device, to_source, distance, dry_gain, &wet_gains);

        let rate = device.sample_rate as f32;
        self.dry_filter = FilterType::from_gains(dry_gain_hf, dry_gain_lf);
        let direct = self.props.direct;
        if let Some((first, rest)) = self.chans.split_first_mut() {
            first.dry.low_pass.set_params_from_slope(
                BiquadType::HighShelf,
                direct.hf_reference / rate,
                dry_gain_hf.max(MIN_FILTER_GAIN),
                1.0,
            );
            first.dry.high_pass.set_params_from_slope(
                BiquadType::LowShelf,
                direct.lf_reference / rate,
                dry_gain_lf.max(MIN_FILTER_GAIN),
                1.0,
            );
            for (s, &(_, gain_hf, gain_lf)) in wet_gains.iter().enumerate().take(self.num_sends) {
                let filter = self.props.sends[s].filter;
                self.send_filters[s] = FilterType::from_gains(gain_hf, gain_lf);
                first.wet[s].low_pass.set_params_from_slope(
                    BiquadType::HighShelf,
                    filter.hf_reference / rate,
                    gain_hf.max(MIN_FILTER_GAIN),
                    1.0,
                );
                first.wet[s].high_pass.set_params_from_slope(
                    BiquadType::LowShelf,
                    filter.lf_reference / rate,
                    gain_lf.max(MIN_FILTER_GAIN),
                    1.0,
                );
            }
            for chan in rest {
                chan.dry.low_pass.copy_params_from(&first.dry.low_pass);
                chan.dry.high_pass.copy_params_from(&first.dry.high_pass);
                for (wet, src) in chan.wet.iter_mut().zip(&first.wet) {
                    wet.low_pass.copy_params_from(&src.low_pass);
                    wet.high_pass.copy_params_from(&src.high_pass);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn calc_panning(
        &mut self,
        props: &SourceProps,
        format: &BufferData,
        listener: &ListenerParams,
        device: &DeviceParams,
        to_source: Vec3,
        distance: f32,
        dry_gain: f32,
        wet_gains: &[(f32, f32, f32); MAX_SENDS],
    ) {
        let panner = &device.dry_panner;
        let count = self.chans.len();
        let labels = format.channels.channel_map();
        let spatial = match props.spatialize {
            SpatializeMode::On => true,
            SpatializeMode::Off => false,
            SpatializeMode::Auto => count == 1,
        } && !self.is_ambisonic;
        let direct_mode = if panner.is_ambisonic() {
            DirectMode::Off
        } else {
            props.direct_channels
        };
        let stereo_pair = device.hrtf.is_some() && panner.channel_count() == 2;
        self.has_hrtf = stereo_pair
            && !self.is_ambisonic
            && (spatial || (count > 1 && direct_mode == DirectMode::Off));
        self.has_nfc = device.nfc_w1.is_some() && spatial && !self.has_hrtf;

        let spread = if props.radius > distance {
            TAU - distance / props.radius * PI
        } else if distance > 0.0 {
            (props.radius / distance).asin() * 2.0
        } else {
            0.0
        };
        let source_dir = if distance > f32::EPSILON {
            to_source
        } else {
            Vec3::NEG_Z
        };
        let rotation = if self.is_ambisonic {
            let basis = props.orientation.basis().unwrap_or(Mat3::IDENTITY);
            let world = basis.transpose();
            if props.head_relative {
                world
            } else {
                listener.matrix * world
            }
        } else {
            Mat3::IDENTITY
        };
        let downmix = 1.0
            / labels
                .iter()
                .filter(|&&ch| ch != Channel::Lfe)
                .count()
                .max(1) as f32;

        if self.has_nfc {
            let min_distance = device.speaker_distance / 4.0;
            let meters = (distance * listener.meters_per_unit).max(min_distance);
            let w0 = SPEED_OF_SOUND_METERS_PER_SEC / (meters * device.sample_rate as f32);
            for chan in &mut self.chans {
                chan.dry.nfc.adjust(w0);
            }
        }

        for (c, chan) in self.chans.iter_mut().enumerate() {
            let label = labels.get(c).copied();
            // (elevation, azimuth, spread, gain) for binaural channels.
            let mut binaural: Option<(f32, f32, f32, f32)> = None;

            let gains = if self.is_ambisonic {
                let horizontal = format.channels == FmtChannels::BFormat2D;
                let (acn, scale) = bformat_input(c, horizontal, format.ambi_layout, format.ambi_scaling);
                ambisonic_gains(panner, acn, scale, &rotation)
            } else if label == Some(Channel::Lfe) {
                lfe_gains(panner)
            } else if spatial {
                if self.has_hrtf {
                    let (azimuth, elevation) = direction_angles(source_dir.x, source_dir.y, source_dir.z);
                    binaural = Some((elevation, azimuth, spread, downmix));
                }
                panner.direction_gains(source_dir, spread, downmix)
            } else if count == 1 {
                front_gains(panner)
            } else if direct_mode != DirectMode::Off {
                label.map_or([0.0; MAX_OUTPUT_CHANNELS], |ch| direct_gains(panner, ch, direct_mode))
            } else {
                let azimuth = match (format.channels, label) {
                    (FmtChannels::Stereo, Some(Channel::FrontLeft)) => -props.stereo_angles[0],
                    (FmtChannels::Stereo, Some(Channel::FrontRight)) => -props.stereo_angles[1],
                    (_, Some(ch)) => source_channel_azimuth(ch),
                    (_, None) => 0.0,
                };
                if self.has_hrtf {
                    binaural = Some((0.0, azimuth.rem_euclid(TAU), 0.0, 1.0));
                }
                panner.direction_gains(Vec3::new(azimuth.sin(), 0.0, -azimuth.cos()), 0.0, 1.0)
            };

            if self.has_hrtf {
                chan.dry.target = [0.0; MAX_OUTPUT_CHANNELS];
                if let (Some(hrtf), Some((elevation, azimuth, spread, scale))) = (device.hrtf.as_ref(), binaural) {
                    chan.dry.hrtf.target = hrtf.get_coeffs(elevation, azimuth, spread, dry_gain * scale);
                } else {
                    chan.dry.hrtf.target.gain = 0.0;
                }
            } else {
                chan.dry.target = scale_gains(&gains, dry_gain);
            }
            for (wet, &(gain, _, _)) in chan.wet.iter_mut().zip(wet_gains) {
                wet.target = scale_gains(&gains, gain);
            }
        }
    }
}

fn scale_gains(gains: &ChannelGains, scale: f32) -> ChannelGains {
    gains.map(|g| g * scale)
}

fn front_gains(panner: &Panner) -> ChannelGains {
    let mut gains = [0.0; MAX_OUTPUT_CHANNELS];
    if let Some(center) = panner.channel_index(Channel::FrontCenter) {
        gains[center] = 1.0;
    } else if let (Some(left), Some(right)) = (
        panner.channel_index(Channel::FrontLeft),
        panner.channel_index(Channel::FrontRight),
    ) {
        gains[left] = 1.0;
        gains[right] = 1.0;
    } else {
        gains = panner.direction_gains(Vec3::NEG_Z, 0.0, 1.0);
    }
    gains
}

fn lfe_gains(panner: &Panner) -> ChannelGains {
    let mut gains = [0.0; MAX_OUTPUT_CHANNELS];
    if let Some(lfe) = panner.channel_index(Channel::Lfe) {
        gains[lfe] = 1.0;
    }
    gains
}

fn direct_gains(panner: &Panner, channel: Channel, mode: DirectMode) -> ChannelGains {
    let mut gains = [0.0; MAX_OUTPUT_CHANNELS];
    if let Some(index) = panner.channel_index(channel) {
        gains[index] = 1.0;
        return gains;
    }
    if mode != DirectMode::RemixMismatch {
        return gains;
    }
    let candidate = remix_candidates(channel)
        .iter()
        .find(|set| set.iter().all(|(ch, _)| panner.channel_index(*ch).is_some()));
    for &(ch, weight) in candidate.into_iter().flat_map(|set| set.iter()) {
        if let Some(index) = panner.channel_index(ch) {
            gains[index] += weight;
        }
    }
    gains
}

/// Gains for one B-Format input component, rotating first order by
/// `rotation`.
fn ambisonic_gains(panner: &Panner, acn: usize, scale: f32, rotation: &Mat3) -> ChannelGains {
    if !(1..=3).contains(&acn) {
        return panner.ambisonic_input_gains(acn, scale);
    }
    let rotated = *rotation * FIRST_ORDER_AXES[acn - 1];
    let mut gains = [0.0; MAX_OUTPUT_CHANNELS];
    for (j, axis) in FIRST_ORDER_AXES.iter().enumerate() {
        let weight = axis.dot(rotated);
        if weight.abs() <= f32::EPSILON {
            continue;
        }
        let part = panner.ambisonic_input_gains(j + 1, scale * weight);
        for (g, p) in gains.iter_mut().zip(part) {
            *g += p;
        }
    }
    gains
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Attenuation {
    dry: f32,
    wet: f32,
    clamped_distance: f32,
}

fn distance_attenuation(model: DistanceModel, props: &SourceProps, distance: f32) -> Attenuation {
    let ref_distance = props.ref_distance;
    let max_distance = props.max_distance;
    let mut result = Attenuation {
        dry: 1.0,
        wet: 1.0,
        clamped_distance: distance,
    };

    let clamped = matches!(
        model,
        DistanceModel::InverseClamped | DistanceModel::LinearClamped | DistanceModel::ExponentClamped
    );
    if clamped {
        if max_distance < ref_distance {
            return result;
        }
        result.clamped_distance = distance.clamp(ref_distance, max_distance);
    }
    let d = result.clamped_distance;
    let rolloffs = [props.rolloff_factor, props.room_rolloff_factor];

    let gains = rolloffs.map(|rolloff| match model {
        DistanceModel::None => 1.0,
        DistanceModel::Inverse | DistanceModel::InverseClamped => {
            let dist = ref_distance + (d - ref_distance) * rolloff;
            if ref_distance > 0.0 && dist > 0.0 {
                ref_distance / dist
            } else {
                1.0
            }
        }
        DistanceModel::Linear | DistanceModel::LinearClamped => {
            if max_distance != ref_distance {
                (1.0 - (d - ref_distance) / (max_distance - ref_distance) * rolloff).max(0.0)
            } else {
                1.0
            }
        }
        DistanceModel::Exponent | DistanceModel::ExponentClamped => {
            if d > 0.0 && ref_distance > 0.0 {
                (d / ref_distance).powf(-rolloff)
            } else {
                1.0
            }
        }
    });
    result.dry = gains[0];
    result.wet = gains[1];
    result
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ConeGains {
    gain: f32,
    gain_hf: f32,
}

fn cone_gains(props: &SourceProps, direction: Vec3, to_source: Vec3) -> ConeGains {
    let mut cone = ConeGains {
        gain: 1.0,
        gain_hf: 1.0,
    };
    if direction == Vec3::ZERO || to_source == Vec3::ZERO {
        return cone;
    }
    let angle = (-direction.dot(to_source)).clamp(-1.0, 1.0).acos().to_degrees() * 2.0;
    if angle >= props.outer_angle {
        cone.gain = props.outer_gain;
        cone.gain_hf = props.outer_gain_hf;
    } else if angle >= props.inner_angle {
        let scale = (angle - props.inner_angle) / (props.outer_angle - props.inner_angle);
        cone.gain = 1.0 + (props.outer_gain - 1.0) * scale;
        cone.gain_hf = 1.0 + (props.outer_gain_hf - 1.0) * scale;
    }
    cone
}

/// Pitch multiplier from source and listener speeds toward each other.
fn doppler_shift(source_speed: f32, listener_speed: f32, speed_of_sound: f32) -> f32 {
    if !(listener_speed < speed_of_sound) {
        0.0
    } else if !(source_speed < speed_of_sound) {
        f32::INFINITY
    } else {
        (speed_of_sound - listener_speed) / (speed_of_sound - source_speed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceDesc;
    use crate::dsp::new_bus;
    use crate::format::{AmbiLayout, AmbiScaling, FmtType, UserFmtType};
    use approx::assert_abs_diff_eq;

    fn mono(samples: &[f32], frequency: u32) -> Arc<BufferData> {
        Arc::new(BufferData {
            frequency,
            channels: FmtChannels::Mono,
            sample_type: FmtType::Float,
            ambi_order: 0,
            ambi_layout: AmbiLayout::Acn,
            ambi_scaling: AmbiScaling::Sn3d,
            sample_len: samples.len(),
            loop_start: 0,
            loop_end: samples.len(),
            samples: samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
            callback: None,
            original_type: UserFmtType::Float,
            original_align: 1,
        })
    }

    fn device() -> DeviceParams {
        DeviceParams::from_desc(&DeviceDesc::default())
    }

    fn start(voice: &Voice, items: &[Arc<QueueItem>], props: SourceProps, is_static: bool) {
        let free = PropsFreeList::new(None);
        let format = items[0].data.clone().unwrap();
        voice.start(
            VoiceStart {
                source_id: 7,
                props: VoiceProps {
                    source: props,
                    ..VoiceProps::default()
                },
                format,
                head: items[0].clone(),
                item: items[0].clone(),
                pos: 0,
                frac: 0,
                is_static,
                fade_in: false,
            },
            &ListenerParams::default(),
            &device(),
            &free,
        );
        voice.set_state(VoiceState::Playing);
    }

    fn run(voice: &Voice, frames: usize) -> (Vec<BufferLine>, MixOutcome) {
        let device = device();
        let listener = ListenerParams::default();
        let free = PropsFreeList::new(None);
        let env = MixEnv {
            listener: &listener,
            device: &device,
            free: &free,
            apply_updates: true,
            force_recalc: false,
        };
        let mut dry = new_bus(2);
        let mut scratch = MixScratch::new();
        let mut m = voice.mix.lock();
        let outcome = voice.mix(&mut m, &env, &mut dry, &mut scratch, frames);
        (dry, outcome)
    }

    fn non_spatial() -> SourceProps {
        SourceProps {
            spatialize: SpatializeMode::Off,
            ..SourceProps::default()
        }
    }

    #[test]
    fn test_mono_copies_to_both_sides() {
        let samples: Vec<f32> = (0..48).map(|i| (i as f32 * 0.3).sin()).collect();
        let item = Arc::new(QueueItem::new(1, 1, Some(mono(&samples, 48000))));
        let voice = Voice::new();
        start(&voice, &[item], non_spatial(), true);

        let (dry, outcome) = run(&voice, 96);
        assert!(outcome.ended);
        assert_eq!(&dry[0][..48], &samples[..]);
        assert_eq!(&dry[1][..48], &samples[..]);
        assert!(dry[0][48..96].iter().all(|&s| s == 0.0));
        assert_eq!(voice.state(), VoiceState::Stopped);
        assert_eq!(voice.source_id.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_static_loop_tiles_buffer() {
        let samples = [0.25, 0.5, -0.5, -0.25];
        let item = Arc::new(QueueItem::new(1, 1, Some(mono(&samples, 48000))));
        let voice = Voice::new();
        let props = SourceProps {
            looping: true,
            ..non_spatial()
        };
        start(&voice, &[item], props, true);

        let (dry, outcome) = run(&voice, 10);
        assert!(!outcome.ended);
        for i in 0..10 {
            assert_eq!(dry[0][i], samples[i % 4]);
        }
        let position = voice.position();
        assert_eq!(position.pos, 2);
        assert_eq!(position.serial, Some(1));
    }

    #[test]
    fn test_streaming_counts_completed_items() {
        let first = Arc::new(QueueItem::new(1, 1, Some(mono(&[0.1; 6], 48000))));
        let second = Arc::new(QueueItem::new(2, 2, Some(mono(&[0.2; 6], 48000))));
        first.next.set(second.clone()).unwrap();
        let voice = Voice::new();
        start(&voice, &[first, second], non_spatial(), false);

        let (dry, outcome) = run(&voice, 8);
        assert_eq!(outcome.buffers_completed, 1);
        assert!(!outcome.ended);
        assert_abs_diff_eq!(dry[0][5], 0.1, epsilon = 1e-6);
        assert_abs_diff_eq!(dry[0][6], 0.2, epsilon = 1e-6);
        assert_eq!(voice.position().serial, Some(2));
        assert_eq!(voice.position().pos, 2);
    }

    #[test]
    fn test_stopping_fades_out() {
        let item = Arc::new(QueueItem::new(1, 1, Some(mono(&[1.0; 64], 48000))));
        let voice = Voice::new();
        start(&voice, &[item], non_spatial(), true);
        voice.set_state(VoiceState::Stopping);

        let (dry, _) = run(&voice, 32);
        assert_abs_diff_eq!(dry[0][0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(dry[0][16], 0.5, epsilon = 1e-5);
        assert!(dry[0][31] < 0.05);
        assert_eq!(voice.state(), VoiceState::Stopped);
        assert_eq!(voice.source_id.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn test_half_rate_buffer_steps_by_half() {
        let samples: Vec<f32> = (0..32).map(|i| i as f32).collect();
        let item = Arc::new(QueueItem::new(1, 1, Some(mono(&samples, 24000))));
        let voice = Voice::new();
        start(&voice, &[item], non_spatial(), true);
        assert_eq!(voice.mix.lock().step, MIXER_FRAC_ONE / 2);

        let (dry, _) = run(&voice, 8);
        assert_abs_diff_eq!(dry[0][1], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(dry[0][4], 2.0, epsilon = 1e-6);
        assert_eq!(voice.position().pos, 4);
    }

    #[test]
    fn test_distance_models() {
        let props = SourceProps {
            ref_distance: 1.0,
            max_distance: 10.0,
            rolloff_factor: 1.0,
            ..SourceProps::default()
        };
        let inverse = distance_attenuation(DistanceModel::Inverse, &props, 4.0);
        assert_abs_diff_eq!(inverse.dry, 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(inverse.wet, 1.0, epsilon = 1e-6);

        let clamped = distance_attenuation(DistanceModel::InverseClamped, &props, 20.0);
        assert_abs_diff_eq!(clamped.dry, 0.1, epsilon = 1e-6);
        assert_abs_diff_eq!(clamped.clamped_distance, 10.0);

        let linear = distance_attenuation(DistanceModel::Linear, &props, 5.5);
        assert_abs_diff_eq!(linear.dry, 0.5, epsilon = 1e-6);

        let exponent = distance_attenuation(DistanceModel::Exponent, &props, 2.0);
        assert_abs_diff_eq!(exponent.dry, 0.5, epsilon = 1e-6);

        let swapped = SourceProps {
            max_distance: 0.5,
            ..props
        };
        let unclamped = distance_attenuation(DistanceModel::LinearClamped, &swapped, 4.0);
        assert_eq!(unclamped.dry, 1.0);
    }

    #[test]
    fn test_cone_attenuates_behind() {
        let props = SourceProps {
            inner_angle: 90.0,
            outer_angle: 180.0,
            outer_gain: 0.2,
            outer_gain_hf: 0.5,
            ..SourceProps::default()
        };
        // Facing away from a listener in front of it.
        let behind = cone_gains(&props, Vec3::NEG_Z, Vec3::NEG_Z);
        assert_abs_diff_eq!(behind.gain, 0.2, epsilon = 1e-6);
        assert_abs_diff_eq!(behind.gain_hf, 0.5, epsilon = 1e-6);
        let facing = cone_gains(&props, Vec3::Z, Vec3::NEG_Z);
        assert_eq!(facing.gain, 1.0);
    }

    #[test]
    fn test_doppler_limits() {
        assert_abs_diff_eq!(doppler_shift(0.0, 0.0, 343.3), 1.0);
        assert!(doppler_shift(34.33, 0.0, 343.3) > 1.0);
        assert_eq!(doppler_shift(0.0, 400.0, 343.3), 0.0);
        assert!(doppler_shift(400.0, 0.0, 343.3).is_infinite());
    }

    #[test]
    fn test_remix_center_to_stereo() {
        let panner = device().dry_panner;
        let gains = direct_gains(&panner, Channel::FrontCenter, DirectMode::RemixMismatch);
        assert_abs_diff_eq!(gains[0], std::f32::consts::FRAC_1_SQRT_2, epsilon = 1e-6);
        let dropped = direct_gains(&panner, Channel::FrontCenter, DirectMode::DropMismatch);
        assert!(dropped.iter().all(|&g| g == 0.0));
    }
}
