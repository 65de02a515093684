//! Audio output backends.
//!
//! A backend pulls rendered frames from a [`DeviceShared`] at the device
//! rate. Loopback has no output of its own; the caller renders instead.

mod cpal_backend;
mod loopback;
mod null;

use crate::config::DeviceDesc;
use crate::device::DeviceShared;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// Which backend a device is opened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Rendered on demand by the caller.
    #[default]
    Loopback,
    /// Renders in real time and discards the output.
    Null,
    /// The system's default output device.
    Cpal,
}

pub(crate) trait Backend {
    fn name(&self) -> &'static str;

    /// Negotiates `desc` with the output, adjusting what it can't honour.
    fn reset(&mut self, desc: &mut DeviceDesc) -> Result<()>;

    fn start(&mut self, device: Arc<DeviceShared>) -> Result<()>;

    fn stop(&mut self);

    /// Buffering between the mixer and the output.
    fn latency(&self, desc: &DeviceDesc) -> Duration {
        let frames = (desc.update_size * desc.num_updates) as u64;
        Duration::from_nanos(frames * 1_000_000_000 / u64::from(desc.sample_rate.max(1)))
    }
}

pub(crate) fn create(kind: BackendKind) -> Result<Box<dyn Backend>> {
    Ok(match kind {
        BackendKind::Loopback => Box::new(loopback::LoopbackBackend),
        BackendKind::Null => Box::new(null::NullBackend::default()),
        BackendKind::Cpal => Box::new(cpal_backend::CpalBackend::new()?),
    })
}
