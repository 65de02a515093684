use super::Backend;
use crate::config::DeviceDesc;
use crate::device::{DeviceShared, OutputSample};
use crate::error::{AlError, Result};
use crate::format::DevFmtType;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::Arc;

/// Plays through the host's default output device.
pub(crate) struct CpalBackend {
    device: cpal::Device,
    config: Option<cpal::StreamConfig>,
    sample_type: DevFmtType,
    stream: Option<cpal::Stream>,
}

impl CpalBackend {
    pub(crate) fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AlError::AudioDevice("No default output device available".into()))?;
        if let Ok(name) = device.name() {
            log::info!("Using output device: {}", name);
        }
        Ok(Self {
            device,
            config: None,
            sample_type: DevFmtType::F32,
            stream: None,
        })
    }

    fn create_stream<T: OutputSample>(
        &self,
        config: &cpal::StreamConfig,
        shared: Arc<DeviceShared>,
    ) -> Result<cpal::Stream> {
        let on_error = shared.clone();
        self.device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    shared.render(data);
                },
                move |err| {
                    log::error!("Audio stream error: {}", err);
                    if let cpal::StreamError::DeviceNotAvailable = err {
                        on_error.handle_disconnect("Output device is no longer available");
                    }
                },
                None,
            )
            .map_err(|e| AlError::AudioDevice(format!("Failed to build stream: {}", e)))
    }
}

fn sample_type_of(format: cpal::SampleFormat) -> Option<DevFmtType> {
    Some(match format {
        cpal::SampleFormat::I8 => DevFmtType::I8,
        cpal::SampleFormat::U8 => DevFmtType::U8,
        cpal::SampleFormat::I16 => DevFmtType::I16,
        cpal::SampleFormat::U16 => DevFmtType::U16,
        cpal::SampleFormat::I32 => DevFmtType::I32,
        cpal::SampleFormat::U32 => DevFmtType::U32,
        cpal::SampleFormat::F32 => DevFmtType::F32,
        _ => return None,
    })
}

impl Backend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn reset(&mut self, desc: &mut DeviceDesc) -> Result<()> {
        let default_config = self
            .device
            .default_output_config()
            .map_err(|e| AlError::AudioDevice(format!("Failed to get default config: {}", e)))?;
        let sample_type = sample_type_of(default_config.sample_format()).ok_or_else(|| {
            AlError::AudioDevice(format!(
                "Unsupported sample format {:?}",
                default_config.sample_format()
            ))
        })?;
        if sample_type != desc.sample_type {
            log::info!(
                "Output device uses {:?} samples, not {:?}",
                sample_type,
                desc.sample_type
            );
            desc.sample_type = sample_type;
        }

        self.sample_type = sample_type;
        self.config = Some(cpal::StreamConfig {
            channels: desc.channels.count() as u16,
            sample_rate: cpal::SampleRate(desc.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(desc.update_size as u32),
        });
        Ok(())
    }

    fn start(&mut self, shared: Arc<DeviceShared>) -> Result<()> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| AlError::InvalidDevice("starting an unconfigured backend".into()))?;
        let stream = match self.sample_type {
            DevFmtType::I8 => self.create_stream::<i8>(&config, shared)?,
            DevFmtType::U8 => self.create_stream::<u8>(&config, shared)?,
            DevFmtType::I16 => self.create_stream::<i16>(&config, shared)?,
            DevFmtType::U16 => self.create_stream::<u16>(&config, shared)?,
            DevFmtType::I32 => self.create_stream::<i32>(&config, shared)?,
            DevFmtType::U32 => self.create_stream::<u32>(&config, shared)?,
            DevFmtType::F32 => self.create_stream::<f32>(&config, shared)?,
        };
        stream
            .play()
            .map_err(|e| AlError::AudioDevice(format!("Failed to start stream: {}", e)))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) {
        // Dropping the stream stops it.
        self.stream = None;
    }
}
