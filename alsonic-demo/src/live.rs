use alsonic::{
    BackendKind, BufferFormat, ContextDesc, Device, DeviceDesc, SourceParam, Vec3,
};
use anyhow::Result;
use std::time::{Duration, Instant};

const TONE_RATE: u32 = 44100;
const ORBIT_RADIUS: f32 = 2.0;
const ORBIT_PERIOD: Duration = Duration::from_secs(4);
const PLAY_TIME: Duration = Duration::from_secs(8);

/// Plays a looping tone that circles the listener on the default output.
pub fn run_circling_tone() -> Result<()> {
    let device = Device::open(BackendKind::Cpal, DeviceDesc::default())?;
    log::info!(
        "Opened output: {} Hz, {:?}, {:?}",
        device.frequency(),
        device.channels(),
        device.sample_type()
    );
    let context = device.create_context(ContextDesc::default())?;

    // A short buzz with some harmonics so the panning is easy to follow.
    let bytes: Vec<u8> = (0..TONE_RATE / 2)
        .flat_map(|i| {
            let t = i as f32 / TONE_RATE as f32;
            let phase = t * 330.0 * std::f32::consts::TAU;
            let sample = 0.4 * phase.sin() + 0.15 * (3.0 * phase).sin();
            ((sample * i16::MAX as f32) as i16).to_le_bytes()
        })
        .collect();
    let buffer = device.gen_buffers(1)?[0];
    device.buffer_data(buffer, BufferFormat::MONO16, &bytes, TONE_RATE)?;

    let source = context.gen_sources(1)?[0];
    context.set_source(source, SourceParam::Buffer, buffer)?;
    context.set_source(source, SourceParam::Looping, true)?;
    context.set_source(source, SourceParam::Position, Vec3::new(0.0, 0.0, -ORBIT_RADIUS))?;
    context.play_source(source)?;
    log::info!("Tone playing, circling the listener");

    let start = Instant::now();
    while start.elapsed() < PLAY_TIME {
        let turn = start.elapsed().as_secs_f32() / ORBIT_PERIOD.as_secs_f32();
        let angle = turn * std::f32::consts::TAU;
        let position = Vec3::new(angle.sin(), 0.0, -angle.cos()) * ORBIT_RADIUS;
        context.set_source(source, SourceParam::Position, position)?;
        std::thread::sleep(Duration::from_millis(20));
    }

    context.stop_source(source)?;
    std::thread::sleep(Duration::from_millis(100));
    let clock = device.clock_latency();
    log::info!(
        "Stopped after {:.2} s of device time (latency {:?})",
        clock.clock_time.as_secs_f64(),
        clock.latency
    );
    Ok(())
}
