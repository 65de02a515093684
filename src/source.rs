//! Source objects: API-thread playback state and properties.

use crate::buffer::{BufferData, BufferId};
use crate::config::MAX_SENDS;
use crate::dsp::MIXER_FRAC_ONE;
use crate::dsp::resampler::ResamplerKind;
use crate::effect_slot::EffectSlotId;
use crate::error::{AlError, Result};
use crate::filter::{FilterId, FilterParams};
use crate::format::UserFmtType;
use crate::math::{Orientation, Vec3};
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::{Arc, OnceLock};

/// Lightweight, type-safe handle for sources.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceId(pub(crate) u32);

impl SourceId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SourceId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceState {
    #[default]
    Initial,
    Playing,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceType {
    #[default]
    Undetermined,
    Static,
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceModel {
    None,
    Inverse,
    #[default]
    InverseClamped,
    Linear,
    LinearClamped,
    Exponent,
    ExponentClamped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpatializeMode {
    Off,
    On,
    #[default]
    Auto,
}

/// How non-spatialised channels reach the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectMode {
    /// Channels are panned to their virtual speaker angles.
    #[default]
    Off,
    DropMismatch,
    RemixMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetKind {
    Seconds,
    Samples,
    Bytes,
}

/// Property selector for [`crate::Context::set_source`] and
/// [`crate::Context::get_source`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceParam {
    Pitch,
    Gain,
    MinGain,
    MaxGain,
    MaxDistance,
    RolloffFactor,
    RoomRolloffFactor,
    ReferenceDistance,
    ConeInnerAngle,
    ConeOuterAngle,
    ConeOuterGain,
    ConeOuterGainHf,
    AirAbsorptionFactor,
    DopplerFactor,
    Radius,
    Position,
    Velocity,
    Direction,
    Orientation,
    HeadRelative,
    Looping,
    Buffer,
    SecOffset,
    SampleOffset,
    ByteOffset,
    DirectFilter,
    AuxSendFilter,
    DirectFilterGainHfAuto,
    AuxSendFilterGainAuto,
    AuxSendFilterGainHfAuto,
    Resampler,
    DirectChannels,
    Spatialize,
    StereoAngles,
    DistanceModel,
    State,
    Type,
    BuffersQueued,
    BuffersProcessed,
    SampleOffsetLatency,
    SecOffsetLatency,
    SampleOffsetClock,
    SecOffsetClock,
}

impl SourceParam {
    /// Queries that have no setter.
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            Self::State
                | Self::Type
                | Self::BuffersQueued
                | Self::BuffersProcessed
                | Self::SampleOffsetLatency
                | Self::SecOffsetLatency
                | Self::SampleOffsetClock
                | Self::SecOffsetClock
        )
    }
}

/// A typed property value.
///
/// Numeric setters accept any numeric variant, mirroring the float, double
/// and integer entry points of the classic API.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceValue {
    Float(f32),
    Double(f64),
    Int(i64),
    Bool(bool),
    Vec3(Vec3),
    Orientation(Orientation),
    Angles([f32; 2]),
    Buffer(Option<BufferId>),
    Filter(Option<FilterId>),
    AuxSend {
        slot: Option<EffectSlotId>,
        send: usize,
        filter: Option<FilterId>,
    },
    State(SourceState),
    Type(SourceType),
    DistanceModel(DistanceModel),
    Resampler(ResamplerKind),
    DirectChannels(DirectMode),
    Spatialize(SpatializeMode),
    /// An offset paired with a latency or clock time in nanoseconds.
    OffsetTime { offset: f64, nanos: u64 },
}

impl SourceValue {
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Float(v) => Some(f64::from(v)),
            Self::Double(v) => Some(v),
            Self::Int(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        self.as_f64().map(|v| v as f32)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(v) => Some(v),
            Self::Int(0) => Some(false),
            Self::Int(1) => Some(true),
            _ => None,
        }
    }
}

impl From<f32> for SourceValue {
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

impl From<f64> for SourceValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<i64> for SourceValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for SourceValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec3> for SourceValue {
    fn from(value: Vec3) -> Self {
        Self::Vec3(value)
    }
}

impl From<Orientation> for SourceValue {
    fn from(value: Orientation) -> Self {
        Self::Orientation(value)
    }
}

impl From<BufferId> for SourceValue {
    fn from(value: BufferId) -> Self {
        Self::Buffer(Some(value))
    }
}

/// Every source property the mixer needs, copied into voice updates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SourceProps {
    pub(crate) pitch: f32,
    pub(crate) gain: f32,
    pub(crate) min_gain: f32,
    pub(crate) max_gain: f32,
    pub(crate) inner_angle: f32,
    pub(crate) outer_angle: f32,
    pub(crate) ref_distance: f32,
    pub(crate) max_distance: f32,
    pub(crate) rolloff_factor: f32,
    pub(crate) room_rolloff_factor: f32,
    pub(crate) outer_gain: f32,
    pub(crate) outer_gain_hf: f32,
    pub(crate) air_absorption_factor: f32,
    pub(crate) doppler_factor: f32,
    pub(crate) radius: f32,
    pub(crate) stereo_angles: [f32; 2],
    pub(crate) position: Vec3,
    pub(crate) velocity: Vec3,
    pub(crate) direction: Vec3,
    pub(crate) orientation: Orientation,
    pub(crate) head_relative: bool,
    pub(crate) looping: bool,
    pub(crate) distance_model: DistanceModel,
    pub(crate) resampler: ResamplerKind,
    pub(crate) direct_channels: DirectMode,
    pub(crate) spatialize: SpatializeMode,
    pub(crate) dry_gain_hf_auto: bool,
    pub(crate) wet_gain_auto: bool,
    pub(crate) wet_gain_hf_auto: bool,
}

impl Default for SourceProps {
    fn default() -> Self {
        Self {
            pitch: 1.0,
            gain: 1.0,
            min_gain: 0.0,
            max_gain: 1.0,
            inner_angle: 360.0,
            outer_angle: 360.0,
            ref_distance: 1.0,
            max_distance: f32::MAX,
            rolloff_factor: 1.0,
            room_rolloff_factor: 0.0,
            outer_gain: 0.0,
            outer_gain_hf: 1.0,
            air_absorption_factor: 0.0,
            doppler_factor: 1.0,
            radius: 0.0,
            stereo_angles: [PI / 6.0, -PI / 6.0],
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            direction: Vec3::ZERO,
            orientation: Orientation::default(),
            head_relative: false,
            looping: false,
            distance_model: DistanceModel::default(),
            resampler: ResamplerKind::default(),
            direct_channels: DirectMode::Off,
            spatialize: SpatializeMode::Auto,
            dry_gain_hf_auto: true,
            wet_gain_auto: true,
            wet_gain_hf_auto: true,
        }
    }
}

/// A node of a source's buffer queue, shared with the voice playing it.
pub(crate) struct QueueItem {
    /// Context-unique, never zero.
    pub(crate) serial: u64,
    /// Zero for a null entry.
    pub(crate) buffer_id: u32,
    pub(crate) data: Option<Arc<BufferData>>,
    pub(crate) next: OnceLock<Arc<QueueItem>>,
}

impl QueueItem {
    pub(crate) fn new(serial: u64, buffer_id: u32, data: Option<Arc<BufferData>>) -> Self {
        Self {
            serial,
            buffer_id,
            data,
            next: OnceLock::new(),
        }
    }

    pub(crate) fn sample_len(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.sample_len)
    }

    pub(crate) fn is_callback(&self) -> bool {
        self.data.as_ref().is_some_and(|d| d.callback.is_some())
    }

    /// Whether playback can produce anything from this item.
    pub(crate) fn is_playable(&self) -> bool {
        self.sample_len() != 0 || self.is_callback()
    }
}

impl Drop for QueueItem {
    fn drop(&mut self) {
        // Unlink iteratively so a long queue can't overflow the stack.
        let mut next = self.next.take();
        while let Some(item) = next {
            match Arc::try_unwrap(item) {
                Ok(mut inner) => next = inner.next.take(),
                Err(_) => break,
            }
        }
    }
}

impl std::fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueItem")
            .field("serial", &self.serial)
            .field("buffer_id", &self.buffer_id)
            .field("sample_len", &self.sample_len())
            .finish()
    }
}

/// One auxiliary send as the API sees it.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) struct SourceSend {
    pub(crate) slot: Option<u32>,
    pub(crate) filter: FilterParams,
}

/// Where a voice starts or currently is inside a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueuePos {
    pub(crate) pos: usize,
    pub(crate) frac: u32,
    /// Index into the source's queue.
    pub(crate) item: usize,
}

/// API-side source object.
#[derive(Debug, Default)]
pub(crate) struct Source {
    pub(crate) props: SourceProps,
    pub(crate) direct: FilterParams,
    pub(crate) sends: [SourceSend; MAX_SENDS],
    pub(crate) source_type: SourceType,
    pub(crate) state: SourceState,
    pub(crate) queue: VecDeque<Arc<QueueItem>>,
    /// Start position applied by the next play.
    pub(crate) pending_offset: Option<(OffsetKind, f64)>,
    /// Hint to the voice playing this source.
    pub(crate) voice: Option<usize>,
    pub(crate) dirty: bool,
}

fn finite(name: &str, value: f32) -> Result<f32> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(AlError::InvalidValue(format!("{} is not finite", name)))
    }
}

fn in_range(name: &str, value: f32, min: f32, max: f32) -> Result<f32> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(AlError::InvalidValue(format!(
            "{} out of range: {}",
            name, value
        )))
    }
}

fn finite_vec(name: &str, value: Vec3) -> Result<Vec3> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(AlError::InvalidValue(format!("{} is not finite", name)))
    }
}

fn type_mismatch(param: SourceParam, value: &SourceValue) -> AlError {
    AlError::InvalidEnum(format!("{:?} cannot take {:?}", param, value))
}

impl Source {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Applies a plain property. Table-backed properties (buffer, filters,
    /// sends, offsets) are handled by the context.
    pub(crate) fn set_property(&mut self, param: SourceParam, value: &SourceValue) -> Result<()> {
        let props = &mut self.props;
        let float = || value.as_f32().ok_or_else(|| type_mismatch(param, value));
        let flag = || value.as_bool().ok_or_else(|| type_mismatch(param, value));
        let vector = || match *value {
            SourceValue::Vec3(v) => Ok(v),
            _ => Err(type_mismatch(param, value)),
        };

        match param {
            SourceParam::Pitch => {
                let v = float()?;
                if !(v > 0.0 && v.is_finite()) {
                    return Err(AlError::InvalidValue(format!("pitch out of range: {}", v)));
                }
                props.pitch = v;
            }
            SourceParam::Gain => props.gain = in_range("gain", float()?, 0.0, f32::MAX)?,
            SourceParam::MinGain => props.min_gain = in_range("min gain", float()?, 0.0, 1.0)?,
            SourceParam::MaxGain => props.max_gain = in_range("max gain", float()?, 0.0, 1.0)?,
            SourceParam::MaxDistance => {
                props.max_distance = in_range("max distance", float()?, 0.0, f32::MAX)?
            }
            SourceParam::RolloffFactor => {
                props.rolloff_factor = in_range("rolloff factor", float()?, 0.0, f32::MAX)?
            }
            SourceParam::RoomRolloffFactor => {
                props.room_rolloff_factor =
                    in_range("room rolloff factor", float()?, 0.0, f32::MAX)?
            }
            SourceParam::ReferenceDistance => {
                props.ref_distance = in_range("reference distance", float()?, 0.0, f32::MAX)?
            }
            SourceParam::ConeInnerAngle => {
                props.inner_angle = in_range("cone inner angle", float()?, 0.0, 360.0)?
            }
            SourceParam::ConeOuterAngle => {
                props.outer_angle = in_range("cone outer angle", float()?, 0.0, 360.0)?
            }
            SourceParam::ConeOuterGain => {
                props.outer_gain = in_range("cone outer gain", float()?, 0.0, 1.0)?
            }
            SourceParam::ConeOuterGainHf => {
                props.outer_gain_hf = in_range("cone outer gain HF", float()?, 0.0, 1.0)?
            }
            SourceParam::AirAbsorptionFactor => {
                props.air_absorption_factor =
                    in_range("air absorption factor", float()?, 0.0, 10.0)?
            }
            SourceParam::DopplerFactor => {
                props.doppler_factor = in_range("doppler factor", float()?, 0.0, 1.0)?
            }
            SourceParam::Radius => props.radius = in_range("radius", float()?, 0.0, f32::MAX)?,
            SourceParam::Position => props.position = finite_vec("position", vector()?)?,
            SourceParam::Velocity => props.velocity = finite_vec("velocity", vector()?)?,
            SourceParam::Direction => props.direction = finite_vec("direction", vector()?)?,
            SourceParam::Orientation => match *value {
                SourceValue::Orientation(o) => {
                    finite_vec("orientation", o.at)?;
                    finite_vec("orientation", o.up)?;
                    props.orientation = o;
                }
                _ => return Err(type_mismatch(param, value)),
            },
            SourceParam::HeadRelative => props.head_relative = flag()?,
            SourceParam::Looping => props.looping = flag()?,
            SourceParam::DirectFilterGainHfAuto => props.dry_gain_hf_auto = flag()?,
            SourceParam::AuxSendFilterGainAuto => props.wet_gain_auto = flag()?,
            SourceParam::AuxSendFilterGainHfAuto => props.wet_gain_hf_auto = flag()?,
            SourceParam::StereoAngles => match *value {
                SourceValue::Angles([left, right]) => {
                    props.stereo_angles = [finite("stereo angle", left)?, finite("stereo angle", right)?];
                }
                _ => return Err(type_mismatch(param, value)),
            },
            SourceParam::Resampler => match *value {
                SourceValue::Resampler(kind) => props.resampler = kind,
                _ => return Err(type_mismatch(param, value)),
            },
            SourceParam::DirectChannels => match *value {
                SourceValue::DirectChannels(mode) => props.direct_channels = mode,
                SourceValue::Bool(on) => {
                    props.direct_channels = if on {
                        DirectMode::DropMismatch
                    } else {
                        DirectMode::Off
                    }
                }
                _ => return Err(type_mismatch(param, value)),
            },
            SourceParam::Spatialize => match *value {
                SourceValue::Spatialize(mode) => props.spatialize = mode,
                _ => return Err(type_mismatch(param, value)),
            },
            SourceParam::DistanceModel => match *value {
                SourceValue::DistanceModel(model) => props.distance_model = model,
                _ => return Err(type_mismatch(param, value)),
            },
            other => {
                return Err(AlError::InvalidEnum(format!(
                    "{:?} is not a plain source property",
                    other
                )));
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Reads a plain property, `None` for table-backed or derived ones.
    pub(crate) fn get_property(&self, param: SourceParam) -> Option<SourceValue> {
        let p = &self.props;
        let value = match param {
            SourceParam::Pitch => SourceValue::Float(p.pitch),
            SourceParam::Gain => SourceValue::Float(p.gain),
            SourceParam::MinGain => SourceValue::Float(p.min_gain),
            SourceParam::MaxGain => SourceValue::Float(p.max_gain),
            SourceParam::MaxDistance => SourceValue::Float(p.max_distance),
            SourceParam::RolloffFactor => SourceValue::Float(p.rolloff_factor),
            SourceParam::RoomRolloffFactor => SourceValue::Float(p.room_rolloff_factor),
            SourceParam::ReferenceDistance => SourceValue::Float(p.ref_distance),
            SourceParam::ConeInnerAngle => SourceValue::Float(p.inner_angle),
            SourceParam::ConeOuterAngle => SourceValue::Float(p.outer_angle),
            SourceParam::ConeOuterGain => SourceValue::Float(p.outer_gain),
            SourceParam::ConeOuterGainHf => SourceValue::Float(p.outer_gain_hf),
            SourceParam::AirAbsorptionFactor => SourceValue::Float(p.air_absorption_factor),
            SourceParam::DopplerFactor => SourceValue::Float(p.doppler_factor),
            SourceParam::Radius => SourceValue::Float(p.radius),
            SourceParam::Position => SourceValue::Vec3(p.position),
            SourceParam::Velocity => SourceValue::Vec3(p.velocity),
            SourceParam::Direction => SourceValue::Vec3(p.direction),
            SourceParam::Orientation => SourceValue::Orientation(p.orientation),
            SourceParam::HeadRelative => SourceValue::Bool(p.head_relative),
            SourceParam::Looping => SourceValue::Bool(p.looping),
            SourceParam::DirectFilterGainHfAuto => SourceValue::Bool(p.dry_gain_hf_auto),
            SourceParam::AuxSendFilterGainAuto => SourceValue::Bool(p.wet_gain_auto),
            SourceParam::AuxSendFilterGainHfAuto => SourceValue::Bool(p.wet_gain_hf_auto),
            SourceParam::StereoAngles => SourceValue::Angles(p.stereo_angles),
            SourceParam::Resampler => SourceValue::Resampler(p.resampler),
            SourceParam::DirectChannels => SourceValue::DirectChannels(p.direct_channels),
            SourceParam::Spatialize => SourceValue::Spatialize(p.spatialize),
            SourceParam::DistanceModel => SourceValue::DistanceModel(p.distance_model),
            SourceParam::Type => SourceValue::Type(self.source_type),
            SourceParam::BuffersQueued => SourceValue::Int(self.queue.len() as i64),
            _ => return None,
        };
        Some(value)
    }

    /// Format reference of the queue: the first item carrying data.
    pub(crate) fn queue_format(&self) -> Option<&Arc<BufferData>> {
        self.queue.iter().find_map(|item| item.data.as_ref())
    }

    /// Queue items before the one the voice is on. With no current item
    /// every item has been played.
    pub(crate) fn processed_count(&self, current_serial: Option<u64>) -> usize {
        if self.props.looping || self.source_type != SourceType::Streaming {
            return 0;
        }
        if self.state == SourceState::Initial {
            return 0;
        }
        match current_serial {
            Some(serial) => self
                .queue
                .iter()
                .take_while(|item| item.serial != serial)
                .count(),
            None => self.queue.len(),
        }
    }

    /// Resolves an offset request against the queue.
    pub(crate) fn find_offset(&self, kind: OffsetKind, offset: f64) -> Option<QueuePos> {
        let format = self.queue_format()?;
        if !offset.is_finite() || offset < 0.0 {
            return None;
        }
        let channels = format.channel_count();
        let (mut pos, frac) = match kind {
            OffsetKind::Bytes => {
                let bytes = offset as u64 as usize;
                let align = format.original_align;
                let frames = match format.original_type {
                    UserFmtType::Ima4 | UserFmtType::MsAdpcm => {
                        let block = format.original_type.block_bytes(align, channels);
                        bytes / block * align
                    }
                    other => bytes / (channels * other.storage().bytes()),
                };
                (frames, 0)
            }
            OffsetKind::Samples => split_frac(offset),
            OffsetKind::Seconds => split_frac(offset * f64::from(format.frequency)),
        };

        for (index, item) in self.queue.iter().enumerate() {
            let len = item.sample_len();
            if pos < len {
                return Some(QueuePos {
                    pos,
                    frac,
                    item: index,
                });
            }
            pos -= len;
        }
        None
    }

    /// Converts a voice position into the requested offset unit.
    pub(crate) fn offset_of(&self, kind: OffsetKind, serial: u64, pos: usize, frac: u32) -> f64 {
        let Some(format) = self.queue_format() else {
            return 0.0;
        };
        let before: usize = self
            .queue
            .iter()
            .take_while(|item| item.serial != serial)
            .map(|item| item.sample_len())
            .sum();
        let read_pos = before + pos;
        let channels = format.channel_count();
        match kind {
            OffsetKind::Seconds => {
                (read_pos as f64 + f64::from(frac) / f64::from(MIXER_FRAC_ONE))
                    / f64::from(format.frequency)
            }
            OffsetKind::Samples => read_pos as f64 + f64::from(frac) / f64::from(MIXER_FRAC_ONE),
            OffsetKind::Bytes => {
                let align = format.original_align;
                match format.original_type {
                    UserFmtType::Ima4 | UserFmtType::MsAdpcm => {
                        let block = format.original_type.block_bytes(align, channels);
                        (read_pos / align * block) as f64
                    }
                    other => (read_pos * channels * other.storage().bytes()) as f64,
                }
            }
        }
    }
}

fn split_frac(value: f64) -> (usize, u32) {
    let whole = value.trunc();
    let frac = ((value - whole) * f64::from(MIXER_FRAC_ONE)).min(f64::from(MIXER_FRAC_ONE) - 1.0);
    (whole as usize, frac as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{AmbiLayout, AmbiScaling, FmtChannels, FmtType};

    fn data(frames: usize, frequency: u32) -> Arc<BufferData> {
        Arc::new(BufferData {
            frequency,
            channels: FmtChannels::Mono,
            sample_type: FmtType::Float,
            ambi_order: 0,
            ambi_layout: AmbiLayout::Acn,
            ambi_scaling: AmbiScaling::Sn3d,
            sample_len: frames,
            loop_start: 0,
            loop_end: frames,
            samples: vec![0; frames * 4],
            callback: None,
            original_type: UserFmtType::Float,
            original_align: 1,
        })
    }

    fn queued(lens: &[usize]) -> Source {
        let mut source = Source::new();
        for (i, &len) in lens.iter().enumerate() {
            source
                .queue
                .push_back(Arc::new(QueueItem::new(i as u64 + 1, i as u32 + 1, Some(data(len, 100)))));
        }
        source.source_type = SourceType::Streaming;
        source
    }

    #[test]
    fn test_property_ranges() {
        let mut source = Source::new();
        source.set_property(SourceParam::Gain, &0.5f32.into()).unwrap();
        assert_eq!(source.props.gain, 0.5);
        assert!(source.dirty);
        assert!(matches!(
            source.set_property(SourceParam::MaxGain, &SourceValue::Float(1.5)),
            Err(AlError::InvalidValue(_))
        ));
        assert!(matches!(
            source.set_property(SourceParam::Pitch, &SourceValue::Float(0.0)),
            Err(AlError::InvalidValue(_))
        ));
        assert!(matches!(
            source.set_property(SourceParam::Gain, &SourceValue::Float(f32::NAN)),
            Err(AlError::InvalidValue(_))
        ));
        assert!(matches!(
            source.set_property(SourceParam::Position, &SourceValue::Float(1.0)),
            Err(AlError::InvalidEnum(_))
        ));
        source
            .set_property(SourceParam::Looping, &SourceValue::Int(1))
            .unwrap();
        assert!(source.props.looping);
        assert_eq!(
            source.get_property(SourceParam::Looping),
            Some(SourceValue::Bool(true))
        );
    }

    #[test]
    fn test_find_offset_walks_queue() {
        let source = queued(&[100, 50]);
        assert_eq!(
            source.find_offset(OffsetKind::Samples, 120.5),
            Some(QueuePos {
                pos: 20,
                frac: MIXER_FRAC_ONE / 2,
                item: 1
            })
        );
        assert_eq!(
            source.find_offset(OffsetKind::Seconds, 0.5),
            Some(QueuePos {
                pos: 50,
                frac: 0,
                item: 0
            })
        );
        assert_eq!(
            source.find_offset(OffsetKind::Bytes, 404.0),
            Some(QueuePos {
                pos: 1,
                frac: 0,
                item: 1
            })
        );
        assert_eq!(source.find_offset(OffsetKind::Samples, 150.0), None);
        assert_eq!(source.find_offset(OffsetKind::Samples, -1.0), None);
    }

    #[test]
    fn test_offset_of_counts_earlier_items() {
        let source = queued(&[100, 50]);
        let serial = source.queue[1].serial;
        assert_eq!(source.offset_of(OffsetKind::Samples, serial, 10, 0), 110.0);
        assert_eq!(source.offset_of(OffsetKind::Bytes, serial, 10, 0), 440.0);
        assert_eq!(source.offset_of(OffsetKind::Seconds, serial, 10, 0), 1.1);
    }

    #[test]
    fn test_processed_count() {
        let mut source = queued(&[10, 10, 10]);
        source.state = SourceState::Playing;
        let serial = source.queue[2].serial;
        assert_eq!(source.processed_count(Some(serial)), 2);
        assert_eq!(source.processed_count(None), 3);
        source.props.looping = true;
        assert_eq!(source.processed_count(None), 0);
    }

    #[test]
    fn test_long_queue_drops_without_recursion() {
        let head = Arc::new(QueueItem::new(1, 0, None));
        let mut tail = head.clone();
        for serial in 2..200_000u64 {
            let item = Arc::new(QueueItem::new(serial, 0, None));
            let _ = tail.next.set(item.clone());
            tail = item;
        }
        drop(tail);
        drop(head);
    }
}
