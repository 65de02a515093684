//! Auxiliary effect slots owned by a context.

use super::{Context, ContextShared, ContextState};
use crate::effect::{EffectId, EffectKernel, EffectKind};
use crate::effect_slot::{
    EffectSlot, EffectSlotId, EffectSlotInfo, SlotObject, SlotState, check_target_chain,
    next_active_order,
};
use crate::error::{AlError, Result};
use crate::publish::MixCounter;
use crate::table::IdTable;
use std::sync::Arc;
use std::sync::atomic::Ordering;

fn target_of(slots: &IdTable<SlotObject>) -> impl Fn(u32) -> Option<u32> + '_ {
    |id| slots.get(id).and_then(|slot| slot.target)
}

impl ContextShared {
    /// Publishes one slot's properties with its target resolved.
    fn publish_slot(&self, slots: &mut IdTable<SlotObject>, id: u32) -> Result<()> {
        let target = slots
            .get(id)
            .and_then(|slot| slot.target)
            .and_then(|target| slots.get(target))
            .map(|target| target.shared.clone());
        let slot = slots.lookup_mut(id)?;
        slot.publish(&self.slot_free, target)
    }

    fn commit_slot(&self, state: &mut ContextState, id: u32) -> Result<()> {
        if state.deferred {
            state.slots.lookup_mut(id)?.dirty = true;
            return Ok(());
        }
        self.publish_slot(&mut state.slots, id)
    }

    pub(crate) fn publish_dirty_slots(&self, state: &mut ContextState) -> Result<()> {
        let dirty: Vec<u32> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.dirty)
            .map(|(id, _)| id)
            .collect();
        let mut result = Ok(());
        for id in dirty {
            if let Err(err) = self.publish_slot(&mut state.slots, id) {
                result = result.and(Err(err));
            }
        }
        result
    }

    /// Rebuilds and publishes the active array.
    fn update_active_slots(&self, slots: &IdTable<SlotObject>, added: &[u32], removed: &[u32], counter: &MixCounter) {
        let current: Vec<u32> = self
            .active_slots
            .current()
            .iter()
            .map(|slot| slot.id)
            .collect();
        let order = next_active_order(&current, added, removed, target_of(slots));
        let next: Vec<Arc<EffectSlot>> = order
            .iter()
            .filter_map(|&id| slots.get(id))
            .map(|slot| slot.shared.clone())
            .collect();

        for &id in removed {
            if let Some(slot) = slots.get(id) {
                slot.shared.active.store(false, Ordering::Release);
            }
        }
        drop(self.active_slots.replace(next, counter));
        for &id in added {
            if let Some(slot) = slots.get(id) {
                slot.shared.active.store(true, Ordering::Release);
            }
        }
    }
}

impl Context {
    fn check_slot_ids(state: &ContextState, ids: &[EffectSlotId]) -> Result<()> {
        for id in ids {
            state.slots.lookup(id.0)?;
        }
        Ok(())
    }

    /// Allocates `count` slots. New slots start playing with the null
    /// effect.
    pub fn gen_effect_slots(&self, count: usize) -> Result<Vec<EffectSlotId>> {
        let result = (|| {
            let channels = self.device.params().info.channels;
            let mut state = self.shared.state.lock();
            let ids = state.slots.insert_n(count, |id| {
                let mut slot = SlotObject::new(Arc::new(EffectSlot::new(id, channels)));
                slot.state = SlotState::Playing;
                slot
            })?;
            for &id in &ids {
                if let Err(err) = self.shared.publish_slot(&mut state.slots, id) {
                    log::warn!("Effect slot {} update deferred: {}", id, err);
                }
            }
            self.shared
                .update_active_slots(&state.slots, &ids, &[], &self.device.mix_count);
            log::debug!("Generated {} effect slots", ids.len());
            Ok(ids.into_iter().map(EffectSlotId).collect())
        })();
        self.record(result)
    }

    /// Deletes slots. Fails without deleting any if one is unknown or still
    /// fed by a source send or another slot.
    pub fn delete_effect_slots(&self, ids: &[EffectSlotId]) -> Result<()> {
        let result = (|| {
            let mut state = self.shared.state.lock();
            for id in ids {
                let slot = state.slots.lookup(id.0)?;
                if slot.ref_count > 0 {
                    return Err(AlError::InvalidOperation(format!(
                        "deleting in-use effect slot {}",
                        id
                    )));
                }
            }
            let raw: Vec<u32> = ids.iter().map(|id| id.0).collect();
            self.shared
                .update_active_slots(&state.slots, &[], &raw, &self.device.mix_count);
            for id in &raw {
                let Some(slot) = state.slots.remove(*id) else {
                    continue;
                };
                if let Some(target) = slot.target.and_then(|target| state.slots.get_mut(target)) {
                    target.ref_count = target.ref_count.saturating_sub(1);
                }
            }
            Ok(())
        })();
        self.record(result)
    }

    pub fn is_effect_slot(&self, id: EffectSlotId) -> bool {
        self.shared.state.lock().slots.contains(id.0)
    }

    /// Loads an effect into a slot. The kernel is built now and swapped in
    /// by the mixer.
    pub fn set_effect_slot_effect(&self, id: EffectSlotId, effect: Option<EffectId>) -> Result<()> {
        let result = (|| {
            let mut state = self.shared.state.lock();
            state.slots.lookup(id.0)?;
            let kind = match effect {
                Some(effect) => self.device.effects.lock().lookup(effect.0)?.clone(),
                None => EffectKind::Null,
            };
            let kernel = EffectKernel::create(&kind, &self.device.params().info);
            let slot = state.slots.lookup_mut(id.0)?;
            slot.effect = kind;
            slot.effect_id = effect.map(|effect| effect.0);
            slot.pending_kernel = Some(kernel);
            self.shared.commit_slot(&mut state, id.0)
        })();
        self.record(result)
    }

    pub fn set_effect_slot_gain(&self, id: EffectSlotId, gain: f32) -> Result<()> {
        let result = (|| {
            if !(0.0..=1.0).contains(&gain) {
                return Err(AlError::InvalidValue(format!(
                    "effect slot gain out of range: {}",
                    gain
                )));
            }
            let mut state = self.shared.state.lock();
            state.slots.lookup_mut(id.0)?.gain = gain;
            self.shared.commit_slot(&mut state, id.0)
        })();
        self.record(result)
    }

    /// Whether sends into this slot get distance-based gain adjustment.
    pub fn set_effect_slot_aux_send_auto(&self, id: EffectSlotId, enable: bool) -> Result<()> {
        let result = (|| {
            let mut state = self.shared.state.lock();
            state.slots.lookup_mut(id.0)?.aux_send_auto = enable;
            self.shared.commit_slot(&mut state, id.0)
        })();
        self.record(result)
    }

    /// Routes a slot's output into another slot instead of the dry mix.
    /// Loops are refused.
    pub fn set_effect_slot_target(&self, id: EffectSlotId, target: Option<EffectSlotId>) -> Result<()> {
        let result = (|| {
            let mut state = self.shared.state.lock();
            let old = state.slots.lookup(id.0)?.target;
            let new = target.map(|target| target.0);
            if let Some(target) = new {
                state.slots.lookup(target)?;
            }
            check_target_chain(id.0, new, target_of(&state.slots))?;
            if old == new {
                return Ok(());
            }

            if let Some(slot) = new.and_then(|target| state.slots.get_mut(target)) {
                slot.ref_count += 1;
            }
            if let Some(slot) = old.and_then(|target| state.slots.get_mut(target)) {
                slot.ref_count = slot.ref_count.saturating_sub(1);
            }
            let slot = state.slots.lookup_mut(id.0)?;
            slot.target = new;
            let playing = slot.state == SlotState::Playing;

            // Feeding order changed.
            if playing {
                self.shared
                    .update_active_slots(&state.slots, &[], &[], &self.device.mix_count);
            }
            self.shared.commit_slot(&mut state, id.0)
        })();
        self.record(result)
    }

    pub fn get_effect_slot(&self, id: EffectSlotId) -> Result<EffectSlotInfo> {
        let result = self
            .shared
            .state
            .lock()
            .slots
            .lookup(id.0)
            .map(SlotObject::info);
        self.record(result)
    }

    /// Starts processing slots. All join the active array at once.
    pub fn play_effect_slots(&self, ids: &[EffectSlotId]) -> Result<()> {
        let result = (|| {
            let mut state = self.shared.state.lock();
            Self::check_slot_ids(&state, ids)?;
            let mut added = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(slot) = state.slots.get_mut(id.0) else {
                    continue;
                };
                if slot.state != SlotState::Playing {
                    slot.state = SlotState::Playing;
                    added.push(id.0);
                }
            }
            for &id in &added {
                if let Err(err) = self.shared.publish_slot(&mut state.slots, id) {
                    log::warn!("Effect slot {} update deferred: {}", id, err);
                }
            }
            self.shared
                .update_active_slots(&state.slots, &added, &[], &self.device.mix_count);
            Ok(())
        })();
        self.record(result)
    }

    /// Stops processing slots. Sends into a stopped slot are dropped.
    pub fn stop_effect_slots(&self, ids: &[EffectSlotId]) -> Result<()> {
        let result = (|| {
            let mut state = self.shared.state.lock();
            Self::check_slot_ids(&state, ids)?;
            let mut removed = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(slot) = state.slots.get_mut(id.0) else {
                    continue;
                };
                if slot.state == SlotState::Playing {
                    slot.state = SlotState::Stopped;
                    removed.push(id.0);
                }
            }
            self.shared
                .update_active_slots(&state.slots, &[], &removed, &self.device.mix_count);
            Ok(())
        })();
        self.record(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextDesc, DeviceDesc};
    use crate::device::Device;
    use crate::error::ErrorCode;

    fn setup() -> (Device, Context) {
        let device = Device::open_loopback(DeviceDesc::default()).unwrap();
        let context = device.create_context(ContextDesc::default()).unwrap();
        (device, context)
    }

    fn active_ids(context: &Context) -> Vec<u32> {
        context
            .shared
            .active_slots
            .current()
            .iter()
            .map(|slot| slot.id)
            .collect()
    }

    #[test]
    fn test_new_slots_are_active_newest_first() {
        let (_device, context) = setup();
        let a = context.gen_effect_slots(1).unwrap()[0];
        let b = context.gen_effect_slots(1).unwrap()[0];
        assert_eq!(active_ids(&context), vec![b.0, a.0]);
        assert_eq!(context.get_effect_slot(a).unwrap().state, SlotState::Playing);
    }

    #[test]
    fn test_target_loop_refused() {
        let (_device, context) = setup();
        let ids = context.gen_effect_slots(3).unwrap();
        context.set_effect_slot_target(ids[0], Some(ids[1])).unwrap();
        context.set_effect_slot_target(ids[1], Some(ids[2])).unwrap();
        assert!(context.set_effect_slot_target(ids[2], Some(ids[0])).is_err());
        assert_eq!(context.get_error(), ErrorCode::InvalidOperation);
        assert!(context.set_effect_slot_target(ids[0], Some(ids[0])).is_err());
        assert_eq!(context.get_effect_slot(ids[2]).unwrap().target, None);
    }

    #[test]
    fn test_sources_of_a_chain_run_first() {
        let (_device, context) = setup();
        let ids = context.gen_effect_slots(3).unwrap();
        context.set_effect_slot_target(ids[2], Some(ids[1])).unwrap();
        context.set_effect_slot_target(ids[1], Some(ids[0])).unwrap();
        let order = active_ids(&context);
        let at = |id: EffectSlotId| order.iter().position(|&x| x == id.0).unwrap();
        assert!(at(ids[2]) < at(ids[1]));
        assert!(at(ids[1]) < at(ids[0]));
    }

    #[test]
    fn test_targeted_slot_cannot_be_deleted() {
        let (_device, context) = setup();
        let ids = context.gen_effect_slots(2).unwrap();
        context.set_effect_slot_target(ids[0], Some(ids[1])).unwrap();
        assert!(context.delete_effect_slots(&[ids[1]]).is_err());
        assert!(context.is_effect_slot(ids[1]));

        context.delete_effect_slots(&ids).unwrap_err();
        context.set_effect_slot_target(ids[0], None).unwrap();
        context.delete_effect_slots(&ids).unwrap();
        assert!(active_ids(&context).is_empty());
    }

    #[test]
    fn test_stop_and_play_toggle_activity() {
        let (_device, context) = setup();
        let id = context.gen_effect_slots(1).unwrap()[0];
        context.stop_effect_slots(&[id]).unwrap();
        assert!(active_ids(&context).is_empty());
        assert_eq!(context.get_effect_slot(id).unwrap().state, SlotState::Stopped);

        context.play_effect_slots(&[id]).unwrap();
        assert_eq!(active_ids(&context), vec![id.0]);
    }

    #[test]
    fn test_slot_values_validated() {
        let (device, context) = setup();
        let id = context.gen_effect_slots(1).unwrap()[0];
        assert!(context.set_effect_slot_gain(id, 1.5).is_err());
        assert_eq!(context.get_error(), ErrorCode::InvalidValue);

        let effect = device.gen_effects(1).unwrap()[0];
        device
            .set_effect(effect, EffectKind::Passthrough { gain: 1.0 })
            .unwrap();
        context.set_effect_slot_effect(id, Some(effect)).unwrap();
        context.set_effect_slot_gain(id, 0.5).unwrap();
        let info = context.get_effect_slot(id).unwrap();
        assert_eq!(info.effect, Some(effect));
        assert_eq!(info.gain, 0.5);
    }
}
