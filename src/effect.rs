//! Effect objects and the kernels effect slots run.

use crate::dsp::BufferLine;
use crate::error::{AlError, Result};
use std::sync::Arc;

/// Lightweight, type-safe handle for effects.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EffectId(pub(crate) u32);

impl EffectId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for EffectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EffectId({})", self.0)
    }
}

/// Output parameters a kernel is prepared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub sample_rate: u32,
    /// Lines in the bus a kernel reads from and writes into.
    pub channels: usize,
}

/// A user-supplied effect kernel.
///
/// `process` runs on the mixer thread and must not block or allocate. It
/// reads the slot's wet bus and accumulates into `output`, which is either
/// the device's dry bus or another slot's wet bus.
pub trait EffectProcessor: Send {
    /// Called before first use and after every device reset.
    fn device_update(&mut self, _device: &DeviceInfo) {}

    /// Called on the mixer thread when slot properties change.
    fn update(&mut self, _slot_gain: f32) {}

    fn process(&mut self, samples_to_do: usize, input: &[BufferLine], output: &mut [BufferLine]);
}

pub type EffectFactory = dyn Fn() -> Box<dyn EffectProcessor> + Send + Sync;

/// The effect type and its properties.
#[derive(Clone, Default)]
pub enum EffectKind {
    /// Produces no output.
    #[default]
    Null,
    /// Copies its input to the output scaled by `gain`.
    Passthrough { gain: f32 },
    Custom(Arc<EffectFactory>),
}

impl std::fmt::Debug for EffectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Passthrough { gain } => f.debug_struct("Passthrough").field("gain", gain).finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl EffectKind {
    pub(crate) fn validate(&self) -> Result<()> {
        if let Self::Passthrough { gain } = *self {
            if !(gain.is_finite() && gain >= 0.0) {
                return Err(AlError::InvalidValue(format!(
                    "passthrough gain out of range: {}",
                    gain
                )));
            }
        }
        Ok(())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// The kernel instance owned by an effect slot.
#[derive(Default)]
pub(crate) enum EffectKernel {
    #[default]
    Null,
    Passthrough {
        gain: f32,
        slot_gain: f32,
    },
    Custom(Box<dyn EffectProcessor>),
}

impl EffectKernel {
    /// Instantiates a kernel on the API thread, prepared for `device`.
    pub(crate) fn create(kind: &EffectKind, device: &DeviceInfo) -> Self {
        match kind {
            EffectKind::Null => Self::Null,
            EffectKind::Passthrough { gain } => Self::Passthrough {
                gain: *gain,
                slot_gain: 1.0,
            },
            EffectKind::Custom(factory) => {
                let mut processor = factory();
                processor.device_update(device);
                Self::Custom(processor)
            }
        }
    }

    pub(crate) fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub(crate) fn device_update(&mut self, device: &DeviceInfo) {
        if let Self::Custom(processor) = self {
            processor.device_update(device);
        }
    }

    pub(crate) fn update(&mut self, gain: f32) {
        match self {
            Self::Null => {}
            Self::Passthrough { slot_gain, .. } => *slot_gain = gain,
            Self::Custom(processor) => processor.update(gain),
        }
    }

    pub(crate) fn process(&mut self, samples_to_do: usize, input: &[BufferLine], output: &mut [BufferLine]) {
        match self {
            Self::Null => {}
            Self::Passthrough { gain, slot_gain } => {
                let scale = *gain * *slot_gain;
                for (src, dst) in input.iter().zip(output.iter_mut()) {
                    for (d, s) in dst[..samples_to_do].iter_mut().zip(&src[..samples_to_do]) {
                        *d += s * scale;
                    }
                }
            }
            Self::Custom(processor) => processor.process(samples_to_do, input, output),
        }
    }
}
