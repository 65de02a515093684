use super::Backend;
use crate::config::DeviceDesc;
use crate::device::{DeviceShared, OutputSample};
use crate::error::{AlError, Result};
use crate::format::DevFmtType;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Renders at the device rate on a timer thread and drops the output.
#[derive(Default)]
pub(crate) struct NullBackend {
    update_size: usize,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Backend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn reset(&mut self, desc: &mut DeviceDesc) -> Result<()> {
        self.update_size = desc.update_size;
        Ok(())
    }

    fn start(&mut self, device: Arc<DeviceShared>) -> Result<()> {
        self.stop();
        let running = Arc::new(AtomicBool::new(true));
        self.running = running.clone();
        let update_size = self.update_size;
        let thread = std::thread::Builder::new()
            .name("alsonic-null".into())
            .spawn(move || match device.params().sample_type {
                DevFmtType::I8 => run::<i8>(&device, &running, update_size),
                DevFmtType::U8 => run::<u8>(&device, &running, update_size),
                DevFmtType::I16 => run::<i16>(&device, &running, update_size),
                DevFmtType::U16 => run::<u16>(&device, &running, update_size),
                DevFmtType::I32 => run::<i32>(&device, &running, update_size),
                DevFmtType::U32 => run::<u32>(&device, &running, update_size),
                DevFmtType::F32 => run::<f32>(&device, &running, update_size),
            })
            .map_err(|e| AlError::AudioDevice(format!("Failed to start mixer thread: {}", e)))?;
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("null backend mixer thread panicked");
            }
        }
    }
}

impl Drop for NullBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<T: OutputSample>(device: &DeviceShared, running: &AtomicBool, update_size: usize) {
    let params = device.params();
    let channels = params.channels.count();
    let period = Duration::from_nanos(update_size as u64 * 1_000_000_000 / u64::from(params.sample_rate));
    let mut block = vec![T::EQUILIBRIUM; update_size * channels];

    let start = Instant::now();
    let mut rendered: u32 = 0;
    while running.load(Ordering::Acquire) {
        let due = start + period * rendered;
        let now = Instant::now();
        if now < due {
            std::thread::sleep((due - now).min(Duration::from_millis(5)));
            continue;
        }
        device.render(&mut block);
        rendered = rendered.wrapping_add(1);
    }
}
