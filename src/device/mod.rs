//! Output devices.
//!
//! A [`Device`] owns a backend, the mixer-side [`Renderer`], the buffer,
//! filter and effect tables, and the list of contexts rendered into it.

mod objects;
pub(crate) mod output;
pub(crate) mod render;

pub use output::OutputSample;

use crate::backend::{self, Backend, BackendKind};
use crate::config::{ContextDesc, DeviceDesc, HrtfMode, StereoEncoding};
use crate::context::{Context, ContextShared};
use crate::dsp::hrtf::HrtfStore;
use crate::dsp::panning::Panner;
use crate::dsp::resampler::{ResamplerKind, warm_tables};
use crate::dsp::SPEED_OF_SOUND_METERS_PER_SEC;
use crate::effect::{DeviceInfo, EffectKind};
use crate::error::{AlError, ErrorCode, ErrorLatch, Result};
use crate::filter::FilterDesc;
use crate::buffer::Buffer;
use crate::format::{AmbiLayout, AmbiScaling, DevFmtChannels, DevFmtType};
use crate::publish::{MixCounter, Published};
use crate::table::IdTable;
use parking_lot::{Mutex, RwLock};
use render::Renderer;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// How the dry mix reaches the output channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputMode {
    /// The dry bus is the output layout.
    Speakers,
    /// Binaural stereo.
    Hrtf,
    /// First-order B-Format encoded to stereo UHJ.
    Uhj,
}

/// Device values the voices and slots render against.
#[derive(Debug, Clone)]
pub(crate) struct DeviceParams {
    pub(crate) sample_rate: u32,
    pub(crate) update_size: usize,
    pub(crate) num_sends: usize,
    pub(crate) channels: DevFmtChannels,
    pub(crate) sample_type: DevFmtType,
    pub(crate) mode: OutputMode,
    pub(crate) dry_panner: Panner,
    pub(crate) hrtf: Option<Arc<HrtfStore>>,
    /// Near-field reference coefficient at the speaker distance.
    pub(crate) nfc_w1: Option<f32>,
    pub(crate) speaker_distance: f32,
    /// Resampler given to new sources.
    pub(crate) resampler: ResamplerKind,
    pub(crate) info: DeviceInfo,
}

impl DeviceParams {
    pub(crate) fn from_desc(desc: &DeviceDesc) -> Self {
        let stereo = desc.channels == DevFmtChannels::Stereo;
        let use_hrtf = stereo
            && match desc.hrtf {
                HrtfMode::On => true,
                HrtfMode::Off => false,
                HrtfMode::Auto => desc.stereo_encoding == StereoEncoding::Hrtf,
            };
        let mode = if use_hrtf {
            OutputMode::Hrtf
        } else if stereo && desc.stereo_encoding == StereoEncoding::Uhj {
            OutputMode::Uhj
        } else {
            OutputMode::Speakers
        };

        let dry_panner = match mode {
            OutputMode::Uhj => Panner::new(DevFmtChannels::Ambi3D(1), AmbiLayout::Acn, AmbiScaling::N3d),
            _ => Panner::new(desc.channels, desc.ambi_layout, desc.ambi_scaling),
        };
        let nfc_w1 = (desc.speaker_distance > 0.0 && !use_hrtf)
            .then(|| SPEED_OF_SOUND_METERS_PER_SEC / (desc.speaker_distance * desc.sample_rate as f32));
        let info = DeviceInfo {
            sample_rate: desc.sample_rate,
            channels: dry_panner.channel_count(),
        };

        Self {
            sample_rate: desc.sample_rate,
            update_size: desc.update_size,
            num_sends: desc.num_aux_sends,
            channels: desc.channels,
            sample_type: desc.sample_type,
            mode,
            dry_panner,
            hrtf: use_hrtf.then(|| Arc::new(HrtfStore::spherical_head(desc.sample_rate))),
            nfc_w1,
            speaker_distance: desc.speaker_distance,
            resampler: desc.resampler,
            info,
        }
    }
}

/// Clock time and output latency read together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockLatency {
    /// Time rendered since the device was opened.
    pub clock_time: Duration,
    pub latency: Duration,
}

/// Device state shared with the mixer and every context.
pub(crate) struct DeviceShared {
    pub(crate) mix_count: MixCounter,
    pub(crate) contexts: Published<Vec<Arc<ContextShared>>>,
    params: RwLock<Arc<DeviceParams>>,
    pub(crate) renderer: Mutex<Renderer>,
    /// Current configuration. Also serialises resets and context list edits.
    config: Mutex<DeviceDesc>,
    connected: AtomicBool,
    samples_done: AtomicU64,
    clock_base_ns: AtomicU64,
    fixed_latency_ns: AtomicU64,
    backend_latency_ns: AtomicU64,
    pub(crate) errors: ErrorLatch,
    pub(crate) buffers: Mutex<IdTable<Buffer>>,
    pub(crate) filters: Mutex<IdTable<FilterDesc>>,
    pub(crate) effects: Mutex<IdTable<EffectKind>>,
}

impl DeviceShared {
    fn new(desc: DeviceDesc) -> Self {
        let params = Arc::new(DeviceParams::from_desc(&desc));
        let renderer = Renderer::new(params.clone(), &desc);
        let fixed = samples_to_nanos(renderer.fixed_latency() as u64, params.sample_rate);
        Self {
            mix_count: MixCounter::default(),
            contexts: Published::new(Vec::new()),
            params: RwLock::new(params),
            renderer: Mutex::new(renderer),
            connected: AtomicBool::new(true),
            samples_done: AtomicU64::new(0),
            clock_base_ns: AtomicU64::new(0),
            fixed_latency_ns: AtomicU64::new(fixed),
            backend_latency_ns: AtomicU64::new(0),
            errors: ErrorLatch::default(),
            buffers: Mutex::new(IdTable::with_limit("buffer", desc.max_buffers)),
            filters: Mutex::new(IdTable::new("filter")),
            effects: Mutex::new(IdTable::new("effect")),
            config: Mutex::new(desc),
        }
    }

    pub(crate) fn params(&self) -> Arc<DeviceParams> {
        self.params.read().clone()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn clock_time(&self) -> Duration {
        let rate = self.params.read().sample_rate;
        let (base, done) = self.mix_count.read_consistent(|| {
            (
                self.clock_base_ns.load(Ordering::SeqCst),
                self.samples_done.load(Ordering::SeqCst),
            )
        });
        Duration::from_nanos(base + samples_to_nanos(done, rate))
    }

    pub(crate) fn latency(&self) -> Duration {
        Duration::from_nanos(
            self.fixed_latency_ns.load(Ordering::Acquire) + self.backend_latency_ns.load(Ordering::Acquire),
        )
    }

    /// Rebuilds the renderer and every context for `desc`. The backend must
    /// be stopped.
    fn configure(&self, desc: &DeviceDesc, backend_latency: Duration) {
        let params = Arc::new(DeviceParams::from_desc(desc));
        let mut renderer = self.renderer.lock();

        let done = self.samples_done.swap(0, Ordering::SeqCst);
        self.clock_base_ns
            .fetch_add(samples_to_nanos(done, renderer.params.sample_rate), Ordering::SeqCst);

        *renderer = Renderer::new(params.clone(), desc);
        self.fixed_latency_ns.store(
            samples_to_nanos(renderer.fixed_latency() as u64, params.sample_rate),
            Ordering::Release,
        );
        self.backend_latency_ns
            .store(backend_latency.as_nanos() as u64, Ordering::Release);
        *self.params.write() = params.clone();

        for context in self.contexts.current().iter() {
            context.reset_device(&params);
        }
    }

    pub(crate) fn add_context(&self, context: Arc<ContextShared>) {
        let _config = self.config.lock();
        let mut list = self.contexts.current().clone();
        list.push(context);
        drop(self.contexts.replace(list, &self.mix_count));
    }

    pub(crate) fn remove_context(&self, context: &Arc<ContextShared>) {
        let _config = self.config.lock();
        let list: Vec<_> = self
            .contexts
            .current()
            .iter()
            .filter(|c| !Arc::ptr_eq(c, context))
            .cloned()
            .collect();
        drop(self.contexts.replace(list, &self.mix_count));
    }
}

fn samples_to_nanos(samples: u64, rate: u32) -> u64 {
    (u128::from(samples) * u128::from(NANOS_PER_SEC) / u128::from(rate.max(1))) as u64
}

/// An open output device.
///
/// Dropping the device stops its backend. Contexts created from it keep
/// the shared state alive but are no longer rendered.
pub struct Device {
    pub(crate) shared: Arc<DeviceShared>,
    backend: Box<dyn Backend>,
    kind: BackendKind,
}

impl Device {
    /// Opens a device on `kind` and starts rendering.
    pub fn open(kind: BackendKind, desc: DeviceDesc) -> Result<Self> {
        let mut desc = desc;
        desc.validate()?;
        warm_tables();

        let mut backend = backend::create(kind)?;
        backend.reset(&mut desc)?;
        let latency = backend.latency(&desc);
        log::info!(
            "Opened {} device: {}Hz {:?} {:?}, {} frame updates",
            backend.name(),
            desc.sample_rate,
            desc.channels,
            desc.sample_type,
            desc.update_size
        );

        let shared = Arc::new(DeviceShared::new(desc));
        shared
            .backend_latency_ns
            .store(latency.as_nanos() as u64, Ordering::Release);
        backend.start(shared.clone())?;
        Ok(Self {
            shared,
            backend,
            kind,
        })
    }

    /// Opens a device the caller renders with [`Device::render_samples`].
    pub fn open_loopback(desc: DeviceDesc) -> Result<Self> {
        Self::open(BackendKind::Loopback, desc)
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    /// Applies a new configuration. Playing sources carry over.
    pub fn reset(&mut self, desc: DeviceDesc) -> Result<()> {
        let result = self.reset_inner(desc);
        self.shared.errors.record(result)
    }

    fn reset_inner(&mut self, desc: DeviceDesc) -> Result<()> {
        let mut desc = desc;
        desc.validate()?;
        let shared = self.shared.clone();
        let mut config = shared.config.lock();

        self.backend.stop();
        if let Err(err) = self.backend.reset(&mut desc) {
            drop(config);
            self.shared
                .handle_disconnect(&format!("Device reset failed: {}", err));
            return Err(err);
        }
        shared.configure(&desc, self.backend.latency(&desc));
        log::info!(
            "Reset {} device: {}Hz {:?} {:?}",
            self.backend.name(),
            desc.sample_rate,
            desc.channels,
            desc.sample_type
        );
        *config = desc;
        drop(config);

        if self.shared.is_connected() {
            self.backend.start(self.shared.clone())?;
        }
        Ok(())
    }

    /// Reopens the backend after a disconnect and resets with `desc`.
    pub fn reopen(&mut self, desc: DeviceDesc) -> Result<()> {
        let result = self.reopen_inner(desc);
        self.shared.errors.record(result)
    }

    fn reopen_inner(&mut self, desc: DeviceDesc) -> Result<()> {
        desc.validate()?;
        self.backend.stop();
        self.backend = backend::create(self.kind)?;
        self.shared.connected.store(true, Ordering::Release);
        log::info!("Reopened {} device", self.backend.name());
        self.reset_inner(desc)
    }

    /// Renders `out.len() / channels` interleaved frames. Loopback only.
    pub fn render_samples<T: OutputSample>(&self, out: &mut [T]) -> Result<()> {
        let result = self.check_render::<T>(out.len());
        self.shared.errors.record(result)?;
        self.shared.render(out);
        Ok(())
    }

    fn check_render<T: OutputSample>(&self, len: usize) -> Result<()> {
        if self.kind != BackendKind::Loopback {
            return Err(AlError::InvalidDevice(
                "only loopback devices can be rendered by the caller".into(),
            ));
        }
        let params = self.shared.params();
        if T::TYPE != params.sample_type {
            return Err(AlError::InvalidValue(format!(
                "device renders {:?}, not {:?}",
                params.sample_type,
                T::TYPE
            )));
        }
        if len % params.channels.count() != 0 {
            return Err(AlError::InvalidValue(format!(
                "{} samples is not a whole number of {} channel frames",
                len,
                params.channels.count()
            )));
        }
        Ok(())
    }

    /// Reports the device as lost, as a failing backend would.
    pub fn handle_disconnect(&self, message: &str) {
        self.shared.handle_disconnect(message);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn frequency(&self) -> u32 {
        self.shared.params().sample_rate
    }

    pub fn channels(&self) -> DevFmtChannels {
        self.shared.params().channels
    }

    pub fn sample_type(&self) -> DevFmtType {
        self.shared.params().sample_type
    }

    pub fn update_size(&self) -> usize {
        self.shared.params().update_size
    }

    /// Whether binaural rendering is active.
    pub fn hrtf_enabled(&self) -> bool {
        self.shared.params().mode == OutputMode::Hrtf
    }

    pub fn clock_latency(&self) -> ClockLatency {
        ClockLatency {
            clock_time: self.shared.clock_time(),
            latency: self.shared.latency(),
        }
    }

    /// Delay added by the post-processing chain.
    pub fn fixed_latency(&self) -> Duration {
        Duration::from_nanos(self.shared.fixed_latency_ns.load(Ordering::Acquire))
    }

    /// Returns and clears the first error raised by a device call.
    pub fn get_error(&self) -> ErrorCode {
        self.shared.errors.take()
    }

    pub fn create_context(&self, desc: ContextDesc) -> Result<Context> {
        let result = Context::new(self.shared.clone(), desc);
        self.shared.errors.record(result)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.backend.stop();
        log::info!("Closed {} device", self.backend.name());
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("backend", &self.kind)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceDesc;

    #[test]
    fn test_stereo_speakers_by_default() {
        let params = DeviceParams::from_desc(&DeviceDesc::default());
        assert_eq!(params.mode, OutputMode::Speakers);
        assert_eq!(params.dry_panner.channel_count(), 2);
        assert!(params.hrtf.is_none());
        assert!(params.nfc_w1.is_none());
    }

    #[test]
    fn test_uhj_mixes_first_order() {
        let desc = DeviceDesc::default().stereo_encoding(StereoEncoding::Uhj);
        let params = DeviceParams::from_desc(&desc);
        assert_eq!(params.mode, OutputMode::Uhj);
        assert_eq!(params.info.channels, 4);
        assert_eq!(params.channels.count(), 2);
    }

    #[test]
    fn test_hrtf_only_for_stereo() {
        let desc = DeviceDesc::default().hrtf(HrtfMode::On);
        assert_eq!(DeviceParams::from_desc(&desc).mode, OutputMode::Hrtf);
        let quad = desc.channels(DevFmtChannels::Quad);
        assert_eq!(DeviceParams::from_desc(&quad).mode, OutputMode::Speakers);
    }

    #[test]
    fn test_speaker_distance_enables_nfc() {
        let desc = DeviceDesc::default()
            .channels(DevFmtChannels::Quad)
            .speaker_distance(1.0);
        let params = DeviceParams::from_desc(&desc);
        let w1 = params.nfc_w1.unwrap();
        assert!((w1 - SPEED_OF_SOUND_METERS_PER_SEC / 48000.0).abs() < 1e-9);
    }

    #[test]
    fn test_loopback_render_checks_type_and_frames() {
        let device = Device::open_loopback(DeviceDesc::default()).unwrap();
        let mut ints = [0i16; 4];
        assert!(device.render_samples(&mut ints).is_err());
        assert_eq!(device.get_error(), ErrorCode::InvalidValue);
        let mut odd = [0.0f32; 3];
        assert!(device.render_samples(&mut odd).is_err());
        let mut frames = [1.0f32; 8];
        device.render_samples(&mut frames).unwrap();
        assert!(frames.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_clock_advances_with_rendering_and_survives_reset() {
        let mut device = Device::open_loopback(DeviceDesc::default()).unwrap();
        let mut frames = vec![0.0f32; 4800 * 2];
        device.render_samples(&mut frames).unwrap();
        assert_eq!(device.clock_latency().clock_time, Duration::from_millis(100));

        device
            .reset(DeviceDesc::default().sample_rate(44100))
            .unwrap();
        assert_eq!(device.frequency(), 44100);
        assert_eq!(device.clock_latency().clock_time, Duration::from_millis(100));
    }

    #[test]
    fn test_limiter_reports_fixed_latency() {
        let desc = DeviceDesc::default()
            .sample_type(DevFmtType::I16)
            .dither(false);
        let device = Device::open_loopback(desc).unwrap();
        assert_eq!(device.fixed_latency(), Duration::from_nanos(samples_to_nanos(48, 48000)));
        assert_eq!(device.fixed_latency(), Duration::from_millis(1));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let device = Device::open_loopback(DeviceDesc::default()).unwrap();
        device.handle_disconnect("unplugged");
        device.handle_disconnect("unplugged again");
        assert!(!device.is_connected());
    }
}
