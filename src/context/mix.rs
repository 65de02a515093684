//! The mixer's view of a context: applying voice changes, mixing voices,
//! running effect slots, and the disconnect and device-reset paths.

use super::ContextShared;
use crate::device::DeviceParams;
use crate::dsp::{BufferLine, new_bus};
use crate::events::AlEvent;
use crate::publish::MixGuard;
use crate::source::SourceState;
use crate::voice::{MixEnv, MixScratch, Voice, VoiceState};
use crate::voice_change::{VoiceChange, VoiceChangeState};
use std::sync::Arc;
use std::sync::atomic::Ordering;

impl ContextShared {
    /// Renders this context's share of one block into `dry`.
    pub(crate) fn mix_block(
        &self,
        pass: &MixGuard<'_>,
        device: &DeviceParams,
        dry: &mut [BufferLine],
        scratch: &mut MixScratch,
        samples: usize,
    ) {
        let Some(mut listener) = self.mix_listener.try_lock() else {
            log::warn!("Context busy, skipping block");
            return;
        };
        let apply_updates = !self.hold_updates.load(Ordering::Acquire);
        let mut force_recalc = false;
        if apply_updates {
            force_recalc = self
                .listener_update
                .consume(&self.listener_free, |params| std::mem::swap(&mut *listener, params));
        }

        let voices = self.voices.load(pass);
        self.voice_changes
            .drain(|change| self.apply_voice_change(voices, change));

        let slots = self.active_slots.load(pass);
        for slot in slots.iter() {
            let Some(mut slot_mix) = slot.mix.try_lock() else {
                continue;
            };
            if apply_updates {
                slot.consume_update(&mut slot_mix, &self.slot_free);
            }
            for line in &mut slot_mix.wet {
                line[..samples].fill(0.0);
            }
        }

        let env = MixEnv {
            listener: &*listener,
            device,
            free: &self.voice_free,
            apply_updates,
            force_recalc,
        };
        let observed = self.active_voices.load(Ordering::Acquire);
        let active = (observed & super::ACTIVE_COUNT_MASK) as usize;
        for voice in voices.iter().take(active) {
            if !matches!(voice.state(), VoiceState::Playing | VoiceState::Stopping) {
                continue;
            }
            let Some(mut voice_mix) = voice.mix.try_lock() else {
                log::warn!("Voice locked during mix, skipping");
                continue;
            };
            let source_id = voice.source_id.load(Ordering::Acquire);
            let outcome = voice.mix(&mut voice_mix, &env, dry, scratch, samples);
            if source_id == 0 {
                continue;
            }
            if outcome.buffers_completed > 0 {
                self.events.post(AlEvent::BufferCompleted {
                    source_id,
                    count: outcome.buffers_completed,
                });
            }
            if outcome.ended {
                self.events.post(AlEvent::SourceStateChanged {
                    source_id,
                    state: SourceState::Stopped,
                });
            }
        }

        for slot in slots.iter() {
            let Some(mut slot_mix) = slot.mix.try_lock() else {
                continue;
            };
            let slot_mix = &mut *slot_mix;
            if slot_mix.kernel.is_null() {
                continue;
            }
            match slot_mix.target.as_ref() {
                // A stopped target swallows what is routed into it.
                Some(target) if !target.is_active() => {}
                Some(target) => {
                    let Some(mut target_mix) = target.mix.try_lock() else {
                        log::warn!("Failed to acquire target slot {} in mixer", target.id);
                        continue;
                    };
                    slot_mix
                        .kernel
                        .process(samples, &slot_mix.wet, &mut target_mix.wet);
                }
                None => slot_mix.kernel.process(samples, &slot_mix.wet, dry),
            }
        }

        self.trim_active(voices, observed);
    }

    fn apply_voice_change(&self, voices: &[Arc<Voice>], change: VoiceChange) {
        let voice = change.voice.and_then(|index| voices.get(index));
        let old_voice = change.old_voice.and_then(|index| voices.get(index));
        let source_id = change.source_id;

        let event = match change.state {
            VoiceChangeState::Reset | VoiceChangeState::Stop => {
                if let Some(voice) = voice {
                    voice.release_source(source_id);
                    voice.transition(VoiceState::Playing, VoiceState::Stopping);
                }
                Some(if change.state == VoiceChangeState::Reset {
                    SourceState::Initial
                } else {
                    SourceState::Stopped
                })
            }
            VoiceChangeState::Play => {
                let was_playing = old_voice.is_some_and(|old| {
                    old.source_id.store(0, Ordering::Release);
                    let playing = old.transition(VoiceState::Playing, VoiceState::Stopping);
                    old.pending_change.store(false, Ordering::Release);
                    playing
                });
                if let Some(voice) = voice {
                    voice.set_state(VoiceState::Playing);
                }
                (!was_playing).then_some(SourceState::Playing)
            }
            VoiceChangeState::Pause => {
                let paused = voice
                    .is_some_and(|voice| voice.transition(VoiceState::Playing, VoiceState::Stopping));
                paused.then_some(SourceState::Paused)
            }
            VoiceChangeState::Restart => {
                let was_playing = old_voice.is_some_and(|old| {
                    old.source_id.store(0, Ordering::Release);
                    let playing = old.transition(VoiceState::Playing, VoiceState::Stopping);
                    old.pending_change.store(false, Ordering::Release);
                    playing
                });
                if let Some(voice) = voice {
                    voice.set_state(if was_playing {
                        VoiceState::Playing
                    } else {
                        VoiceState::Stopped
                    });
                }
                None
            }
        };

        if let Some(voice) = voice {
            voice.pending_change.store(false, Ordering::Release);
        }
        if let Some(state) = event {
            self.events
                .post(AlEvent::SourceStateChanged { source_id, state });
        }
    }

    /// Device loss as seen by this context. Runs inside a mix pass.
    pub(crate) fn disconnect(&self, pass: &MixGuard<'_>, message: &str) {
        self.events.post(AlEvent::Disconnected {
            message: message.to_owned(),
        });

        let voices = self.voices.load(pass);
        self.voice_changes
            .drain(|change| self.apply_voice_change(voices, change));
        if !self.stop_on_disconnect {
            return;
        }
        for voice in voices.iter() {
            let source_id = voice.source_id.swap(0, Ordering::AcqRel);
            voice.set_state(VoiceState::Stopped);
            voice.pending_change.store(false, Ordering::Release);
            if source_id != 0 {
                self.events.post(AlEvent::SourceStateChanged {
                    source_id,
                    state: SourceState::Stopped,
                });
            }
        }
        log::info!("Stopped all voices after disconnect");
    }

    /// Re-prepares voices and slots for a new device configuration. Called
    /// with the renderer locked, so no mix pass is running.
    pub(crate) fn reset_device(&self, device: &DeviceParams) {
        let listener = *self.mix_listener.lock();
        let mut state = self.state.lock();

        for voice in self.voices.current().iter() {
            voice.reset_device(&listener, device, &self.voice_free);
        }

        for (_, slot) in state.slots.iter_mut() {
            {
                let mut slot_mix = slot.shared.mix.lock();
                slot.shared.consume_update(&mut slot_mix, &self.slot_free);
                slot_mix.kernel.device_update(&device.info);
                slot_mix.wet = new_bus(device.info.channels);
            }
            if let Some(kernel) = slot.pending_kernel.as_mut() {
                kernel.device_update(&device.info);
            }
        }

        // Voice resets dropped any update in flight.
        self.republish_sources(&mut state);
        log::debug!(
            "Context reset for {} Hz, {} channels",
            device.info.sample_rate,
            device.info.channels
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{ContextDesc, DeviceDesc};
    use crate::device::Device;
    use crate::events::{AlEvent, EventType};
    use crate::source::SourceState;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    #[test]
    fn test_disconnect_stops_sources_and_reports() {
        let device = Device::open_loopback(DeviceDesc::default()).unwrap();
        let context = device.create_context(ContextDesc::default()).unwrap();
        let (tx, rx) = unbounded();
        context.set_event_callback(Some(move |event: &AlEvent| {
            let _ = tx.send(event.clone());
        }));
        context.enable_events(EventType::ALL, true);

        device.handle_disconnect("unplugged");
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(
            event,
            AlEvent::Disconnected {
                message: "unplugged".into()
            }
        );

        let ids = context.gen_sources(1).unwrap();
        context.play_sources(&ids).unwrap();
        assert_eq!(
            context.source_state(ids[0]).unwrap(),
            SourceState::Stopped
        );
    }
}
