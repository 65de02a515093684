//! Realtime mixing core of a 3D audio engine with an OpenAL-style object
//! model: devices own buffers, filters and effects; contexts own a listener,
//! sources and auxiliary effect slots; a lock-free mixer renders them.

mod adpcm;
pub mod backend;
pub mod buffer;
pub mod config;
pub mod context;
pub mod device;
pub mod dsp;
pub mod effect;
pub mod effect_slot;
pub mod error;
pub mod events;
pub mod filter;
pub mod format;
pub mod math;
mod props;
mod publish;
pub mod source;
mod table;
mod voice;
mod voice_change;

pub use backend::BackendKind;
pub use buffer::{BufferCallbackFn, BufferId, BufferInfo, MapFlags};
pub use config::{ContextDesc, DeviceDesc, HrtfMode, MAX_SENDS, StereoEncoding};
pub use context::{Context, ContextProps, Listener};
pub use device::{ClockLatency, Device, OutputSample};
pub use dsp::resampler::ResamplerKind;
pub use effect::{DeviceInfo, EffectFactory, EffectId, EffectKind, EffectProcessor};
pub use effect_slot::{EffectSlotId, EffectSlotInfo, SlotState};
pub use error::{AlError, ErrorCode, Result};
pub use events::{AlEvent, EventType};
pub use filter::{FilterId, FilterKind, FilterProperty};
pub use format::{AmbiLayout, AmbiScaling, BufferFormat, DevFmtChannels, DevFmtType};
pub use math::{Orientation, Vec3};
pub use source::{
    DirectMode, DistanceModel, OffsetKind, SourceId, SourceParam, SourceState, SourceType,
    SourceValue, SpatializeMode,
};

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const RATE: u32 = 48000;

    fn open() -> (Device, Context) {
        let _ = env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
        let device = Device::open_loopback(DeviceDesc::default()).unwrap();
        let context = device.create_context(ContextDesc::default()).unwrap();
        (device, context)
    }

    fn float_buffer(device: &Device, samples: &[f32]) -> BufferId {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let id = device.gen_buffers(1).unwrap()[0];
        device
            .buffer_data(id, BufferFormat::MONO_FLOAT32, &bytes, RATE)
            .unwrap();
        id
    }

    fn sine(frames: usize, frequency: f32) -> Vec<f32> {
        (0..frames)
            .map(|n| (std::f32::consts::TAU * frequency * n as f32 / RATE as f32).sin())
            .collect()
    }

    fn flat_source(context: &Context, buffer: BufferId) -> SourceId {
        let source = context.gen_sources(1).unwrap()[0];
        context.set_source(source, SourceParam::Buffer, buffer).unwrap();
        context
            .set_source(
                source,
                SourceParam::Spatialize,
                SourceValue::Spatialize(SpatializeMode::Off),
            )
            .unwrap();
        source
    }

    /// Renders `frames` stereo frames and splits them into (left, right).
    fn render(device: &Device, frames: usize) -> (Vec<f32>, Vec<f32>) {
        let mut out = vec![0.0f32; frames * 2];
        device.render_samples(&mut out).unwrap();
        let left = out.iter().step_by(2).copied().collect();
        let right = out.iter().skip(1).step_by(2).copied().collect();
        (left, right)
    }

    fn mute_direct(device: &Device, context: &Context, source: SourceId) {
        let mute = device.gen_filters(1).unwrap()[0];
        device
            .set_filter(mute, FilterProperty::Kind(FilterKind::LowPass))
            .unwrap();
        device.set_filter(mute, FilterProperty::Gain(0.0)).unwrap();
        context
            .set_source(source, SourceParam::DirectFilter, SourceValue::Filter(Some(mute)))
            .unwrap();
    }

    fn bypass_slot(device: &Device, context: &Context, gain: f32) -> EffectSlotId {
        let effect = device.gen_effects(1).unwrap()[0];
        device
            .set_effect(effect, EffectKind::Passthrough { gain })
            .unwrap();
        let slot = context.gen_effect_slots(1).unwrap()[0];
        context.set_effect_slot_effect(slot, Some(effect)).unwrap();
        slot
    }

    fn send_to(context: &Context, source: SourceId, slot: EffectSlotId) {
        let send = SourceValue::AuxSend {
            slot: Some(slot),
            send: 0,
            filter: None,
        };
        context
            .set_source(source, SourceParam::AuxSendFilter, send)
            .unwrap();
    }

    #[test]
    fn test_static_sine_then_silence() {
        let (device, context) = open();
        let samples = sine(480, 1000.0);
        let source = flat_source(&context, float_buffer(&device, &samples));

        context.play_source(source).unwrap();
        let (left, right) = render(&device, 960);
        for n in 0..480 {
            assert_abs_diff_eq!(left[n], samples[n], epsilon = 1e-6);
            assert_abs_diff_eq!(right[n], samples[n], epsilon = 1e-6);
        }
        assert!(left[480..].iter().chain(&right[480..]).all(|&s| s == 0.0));
        assert_eq!(context.source_state(source).unwrap(), SourceState::Stopped);
    }

    #[test]
    fn test_gain_change_ramps_over_block() {
        let (device, context) = open();
        let samples = sine(480, 1000.0);
        let source = flat_source(&context, float_buffer(&device, &samples));
        context.set_source(source, SourceParam::Gain, 0.0f32).unwrap();
        context.play_source(source).unwrap();
        context.set_source(source, SourceParam::Gain, 1.0f32).unwrap();

        let (left, _) = render(&device, 960);
        for n in 0..480 {
            assert_abs_diff_eq!(left[n], samples[n] * (n as f32 / 960.0), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_last_source_update_in_a_period_wins() {
        let (device, context) = open();
        let samples = sine(4800, 440.0);
        let source = flat_source(&context, float_buffer(&device, &samples));
        context.play_source(source).unwrap();
        render(&device, 512);

        context.set_source(source, SourceParam::Gain, 0.0f32).unwrap();
        context.set_source(source, SourceParam::Pitch, 2.0f32).unwrap();
        context.set_source(source, SourceParam::Pitch, 1.0f32).unwrap();
        context.set_source(source, SourceParam::Gain, 1.0f32).unwrap();
        let (left, _) = render(&device, 512);
        for n in 0..512 {
            assert_abs_diff_eq!(left[n], samples[512 + n], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_send_matches_direct_path() {
        let samples = sine(2048, 440.0);

        let (device, context) = open();
        let source = flat_source(&context, float_buffer(&device, &samples));
        context.play_source(source).unwrap();
        let (direct, _) = render(&device, 1024);

        let (device, context) = open();
        let source = flat_source(&context, float_buffer(&device, &samples));
        mute_direct(&device, &context, source);
        let slot = bypass_slot(&device, &context, 1.0);
        send_to(&context, source, slot);
        context.play_source(source).unwrap();
        let (wet, _) = render(&device, 1024);

        for n in 0..1024 {
            assert_abs_diff_eq!(wet[n], direct[n], epsilon = 1e-6);
        }
        assert!(wet.iter().any(|&s| s.abs() > 0.5));
    }

    #[test]
    fn test_muted_send_leaves_only_silence() {
        let (device, context) = open();
        let source = flat_source(&context, float_buffer(&device, &sine(1024, 440.0)));
        mute_direct(&device, &context, source);
        context.play_source(source).unwrap();
        let (left, right) = render(&device, 512);
        assert!(left.iter().chain(&right).all(|&s| s == 0.0));
    }

    #[test]
    fn test_sample_offset_seeks_before_play() {
        let (device, context) = open();
        let samples: Vec<f32> = (0..96000).map(|n| n as f32 / 96000.0).collect();
        let source = flat_source(&context, float_buffer(&device, &samples));
        context
            .set_source(source, SourceParam::SampleOffset, 48000i64)
            .unwrap();
        context.play_source(source).unwrap();

        let (left, _) = render(&device, 16);
        assert_abs_diff_eq!(left[0], samples[48000], epsilon = 1e-6);
        assert_abs_diff_eq!(left[15], samples[48015], epsilon = 1e-6);
    }

    #[test]
    fn test_slot_chain_runs_in_one_block() {
        let (device, context) = open();
        let mut impulse = vec![0.0f32; 64];
        impulse[0] = 1.0;
        let source = flat_source(&context, float_buffer(&device, &impulse));
        mute_direct(&device, &context, source);

        let a = bypass_slot(&device, &context, 0.5);
        let b = bypass_slot(&device, &context, 0.5);
        context.set_effect_slot_target(a, Some(b)).unwrap();
        send_to(&context, source, a);
        context.play_source(source).unwrap();

        let (left, right) = render(&device, 64);
        assert_abs_diff_eq!(left[0], 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(right[0], 0.25, epsilon = 1e-6);
        assert!(left[1..].iter().all(|&s| s.abs() < 1e-6));
    }

    #[test]
    fn test_slot_gain_set_with_effect_keeps_kernel() {
        let samples = sine(2048, 440.0);
        let (device, context) = open();
        let source = flat_source(&context, float_buffer(&device, &samples));
        mute_direct(&device, &context, source);
        let slot = bypass_slot(&device, &context, 1.0);
        context.set_effect_slot_gain(slot, 0.5).unwrap();
        send_to(&context, source, slot);
        context.play_source(source).unwrap();

        let (left, right) = render(&device, 512);
        for n in 0..512 {
            assert_abs_diff_eq!(left[n], samples[n] * 0.5, epsilon = 1e-6);
            assert_abs_diff_eq!(right[n], samples[n] * 0.5, epsilon = 1e-6);
        }
        let (left, _) = render(&device, 512);
        assert_abs_diff_eq!(left[100], samples[612] * 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_stopped_target_silences_chain() {
        let samples = sine(48000, 440.0);
        let (device, context) = open();
        let source = flat_source(&context, float_buffer(&device, &samples));
        mute_direct(&device, &context, source);
        let a = bypass_slot(&device, &context, 1.0);
        let b = bypass_slot(&device, &context, 1.0);
        context.set_effect_slot_target(a, Some(b)).unwrap();
        context.stop_effect_slots(&[b]).unwrap();
        send_to(&context, source, a);
        context.play_source(source).unwrap();

        let (left, right) = render(&device, 512);
        assert!(left.iter().chain(&right).all(|&s| s == 0.0));

        context.play_effect_slots(&[b]).unwrap();
        let (left, _) = render(&device, 512);
        assert!(left.iter().any(|&s| s.abs() > 0.5));
    }

    #[test]
    fn test_replay_matches_fresh_play() {
        let samples = sine(4800, 440.0);

        let (device, context) = open();
        let source = flat_source(&context, float_buffer(&device, &samples));
        context.play_source(source).unwrap();
        render(&device, 256);
        context.stop_source(source).unwrap();
        render(&device, 1024);
        context.play_source(source).unwrap();
        let (replayed, _) = render(&device, 512);

        let (device, context) = open();
        let source = flat_source(&context, float_buffer(&device, &samples));
        context.play_source(source).unwrap();
        let (fresh, _) = render(&device, 512);

        for n in 0..512 {
            assert_abs_diff_eq!(replayed[n], fresh[n], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_looping_source_tiles_its_buffer() {
        let (device, context) = open();
        let samples = sine(100, 960.0);
        let source = flat_source(&context, float_buffer(&device, &samples));
        context.set_source(source, SourceParam::Looping, true).unwrap();
        context.play_source(source).unwrap();

        let (left, _) = render(&device, 1000);
        for n in 0..1000 {
            assert_abs_diff_eq!(left[n], samples[n % 100], epsilon = 1e-6);
        }
        assert_eq!(context.source_state(source).unwrap(), SourceState::Playing);
    }

    #[test]
    fn test_mismatched_queue_leaves_queue_unchanged() {
        let (device, context) = open();
        let first = float_buffer(&device, &sine(64, 440.0));
        let other = device.gen_buffers(1).unwrap()[0];
        device
            .buffer_data(other, BufferFormat::MONO_FLOAT32, &[0u8; 256], 22050)
            .unwrap();
        let source = context.gen_sources(1).unwrap()[0];
        context.queue_buffers(source, &[first]).unwrap();

        assert!(context.queue_buffers(source, &[other]).is_err());
        assert_eq!(context.get_error(), ErrorCode::InvalidOperation);
        let queued = context
            .get_source(source, SourceParam::BuffersQueued)
            .unwrap();
        assert_eq!(queued, SourceValue::Int(1));
    }

    #[test]
    fn test_play_after_disconnect_and_reopen() {
        let (mut device, context) = open();
        let source = flat_source(&context, float_buffer(&device, &sine(48000, 440.0)));
        context.play_source(source).unwrap();
        render(&device, 128);

        device.handle_disconnect("cable pulled");
        assert_eq!(context.source_state(source).unwrap(), SourceState::Stopped);
        context.play_source(source).unwrap();
        assert_eq!(context.source_state(source).unwrap(), SourceState::Stopped);

        device.reopen(DeviceDesc::default()).unwrap();
        assert!(device.is_connected());
        context.play_source(source).unwrap();
        assert_eq!(context.source_state(source).unwrap(), SourceState::Playing);
        let (left, _) = render(&device, 128);
        assert!(left.iter().any(|&s| s != 0.0));
    }
}
