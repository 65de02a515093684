use alsonic::{
    BufferFormat, BufferId, Context, ContextDesc, Device, DeviceDesc, EffectKind, FilterKind,
    FilterProperty, SourceId, SourceParam, SourceValue, SpatializeMode,
};
use anyhow::Result;

const SAMPLE_RATE: u32 = 48000;

pub fn run_scenarios() -> Result<()> {
    log::info!("=== Static sine through the dry path ===");
    static_sine()?;

    log::info!("=== Send routing into a bypass slot ===");
    send_routing()?;

    log::info!("=== Slot feeding another slot ===");
    slot_chain()?;
    Ok(())
}

fn open() -> Result<(Device, Context)> {
    let device = Device::open_loopback(DeviceDesc::default())?;
    let context = device.create_context(ContextDesc::default())?;
    Ok((device, context))
}

/// One second of a mono 16-bit sine at `frequency`.
fn sine_buffer(device: &Device, frequency: f32, amplitude: f32) -> Result<BufferId> {
    let bytes: Vec<u8> = (0..SAMPLE_RATE)
        .flat_map(|i| {
            let phase = i as f32 * frequency * std::f32::consts::TAU / SAMPLE_RATE as f32;
            ((phase.sin() * amplitude * i16::MAX as f32) as i16).to_le_bytes()
        })
        .collect();
    let id = device.gen_buffers(1)?[0];
    device.buffer_data(id, BufferFormat::MONO16, &bytes, SAMPLE_RATE)?;
    Ok(id)
}

/// Renders `frames` stereo frames and returns the left and right peaks.
fn render_peaks(device: &Device, frames: usize) -> Result<(f32, f32)> {
    let mut out = vec![0.0f32; frames * 2];
    device.render_samples(&mut out)?;
    let peak = |channel: usize| {
        out.chunks_exact(2)
            .map(|frame| frame[channel].abs())
            .fold(0.0f32, f32::max)
    };
    Ok((peak(0), peak(1)))
}

fn non_spatial_source(context: &Context, buffer: BufferId) -> Result<SourceId> {
    let source = context.gen_sources(1)?[0];
    context.set_source(source, SourceParam::Buffer, buffer)?;
    context.set_source(
        source,
        SourceParam::Spatialize,
        SourceValue::Spatialize(SpatializeMode::Off),
    )?;
    Ok(source)
}

fn static_sine() -> Result<()> {
    let (device, context) = open()?;
    let buffer = sine_buffer(&device, 440.0, 0.5)?;
    let source = non_spatial_source(&context, buffer)?;

    context.play_source(source)?;
    let (left, right) = render_peaks(&device, 4800)?;
    log::info!("Peaks after 100 ms: left {:.3}, right {:.3}", left, right);
    log::info!("Source state: {:?}", context.source_state(source)?);

    context.stop_source(source)?;
    let (left, right) = render_peaks(&device, 4800)?;
    log::info!("Peaks after stop: left {:.3}, right {:.3}", left, right);
    Ok(())
}

fn send_routing() -> Result<()> {
    let (device, context) = open()?;
    let buffer = sine_buffer(&device, 880.0, 0.5)?;
    let source = non_spatial_source(&context, buffer)?;

    // Silence the direct path so only the send is heard.
    let mute = device.gen_filters(1)?[0];
    device.set_filter(mute, FilterProperty::Kind(FilterKind::LowPass))?;
    device.set_filter(mute, FilterProperty::Gain(0.0))?;
    context.set_source(source, SourceParam::DirectFilter, SourceValue::Filter(Some(mute)))?;

    let effect = device.gen_effects(1)?[0];
    device.set_effect(effect, EffectKind::Passthrough { gain: 1.0 })?;
    let slot = context.gen_effect_slots(1)?[0];
    context.set_effect_slot_effect(slot, Some(effect))?;
    context.set_source(
        source,
        SourceParam::AuxSendFilter,
        SourceValue::AuxSend {
            slot: Some(slot),
            send: 0,
            filter: None,
        },
    )?;

    context.play_source(source)?;
    let (left, right) = render_peaks(&device, 4800)?;
    log::info!("Wet-only peaks: left {:.3}, right {:.3}", left, right);
    Ok(())
}

fn slot_chain() -> Result<()> {
    let (device, context) = open()?;
    let buffer = sine_buffer(&device, 220.0, 0.8)?;
    let source = non_spatial_source(&context, buffer)?;

    let mute = device.gen_filters(1)?[0];
    device.set_filter(mute, FilterProperty::Kind(FilterKind::LowPass))?;
    device.set_filter(mute, FilterProperty::Gain(0.0))?;
    context.set_source(source, SourceParam::DirectFilter, SourceValue::Filter(Some(mute)))?;

    let effect = device.gen_effects(1)?[0];
    device.set_effect(effect, EffectKind::Passthrough { gain: 0.5 })?;
    let slots = context.gen_effect_slots(2)?;
    for &slot in &slots {
        context.set_effect_slot_effect(slot, Some(effect))?;
    }
    context.set_effect_slot_target(slots[0], Some(slots[1]))?;
    context.set_source(
        source,
        SourceParam::AuxSendFilter,
        SourceValue::AuxSend {
            slot: Some(slots[0]),
            send: 0,
            filter: None,
        },
    )?;

    context.play_source(source)?;
    let (left, right) = render_peaks(&device, 4800)?;
    log::info!(
        "Chained peaks (two 0.5 stages): left {:.3}, right {:.3}",
        left,
        right
    );
    Ok(())
}
