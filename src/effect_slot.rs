//! Auxiliary effect slots: the API object and its mixer-side counterpart.

use crate::dsp::{BufferLine, new_bus};
use crate::effect::{EffectKernel, EffectKind};
use crate::error::{AlError, Result};
use crate::props::{PropsFreeList, UpdateSlot};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Lightweight, type-safe handle for auxiliary effect slots.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EffectSlotId(pub(crate) u32);

impl EffectSlotId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for EffectSlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EffectSlotId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    #[default]
    Initial,
    Playing,
    Stopped,
}

/// A snapshot of a slot's queryable state.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectSlotInfo {
    pub gain: f32,
    pub aux_send_auto: bool,
    pub target: Option<EffectSlotId>,
    pub state: SlotState,
    pub effect: Option<crate::effect::EffectId>,
}

/// Update record handed to the mixer.
#[derive(Default)]
pub(crate) struct EffectSlotProps {
    pub(crate) gain: f32,
    pub(crate) aux_send_auto: bool,
    pub(crate) target: Option<Arc<EffectSlot>>,
    /// Replacement kernel; `None` keeps the running one.
    pub(crate) kernel: Option<EffectKernel>,
}

/// Mixer-owned state, only touched by the API while the slot is idle.
pub(crate) struct SlotMix {
    pub(crate) gain: f32,
    pub(crate) target: Option<Arc<EffectSlot>>,
    pub(crate) kernel: EffectKernel,
    pub(crate) wet: Vec<BufferLine>,
}

pub(crate) struct EffectSlot {
    pub(crate) id: u32,
    pub(crate) update: UpdateSlot<EffectSlotProps>,
    pub(crate) mix: Mutex<SlotMix>,
    /// Mirrors membership of the published active array.
    pub(crate) active: AtomicBool,
    pub(crate) aux_send_auto: AtomicBool,
}

impl std::fmt::Debug for EffectSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectSlot")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl EffectSlot {
    pub(crate) fn new(id: u32, channels: usize) -> Self {
        Self {
            id,
            update: UpdateSlot::new(),
            mix: Mutex::new(SlotMix {
                gain: 1.0,
                target: None,
                kernel: EffectKernel::Null,
                wet: new_bus(channels),
            }),
            active: AtomicBool::new(false),
            aux_send_auto: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Applies a pending update. Replaced values are parked in the record
    /// so they are released on the API thread when it is reused.
    pub(crate) fn consume_update(&self, mix: &mut SlotMix, free: &PropsFreeList<EffectSlotProps>) -> bool {
        self.update.consume(free, |props| {
            mix.gain = props.gain;
            std::mem::swap(&mut mix.target, &mut props.target);
            if let Some(kernel) = props.kernel.as_mut() {
                std::mem::swap(&mut mix.kernel, kernel);
            }
            mix.kernel.update(mix.gain);
        })
    }
}

/// API-side slot object.
pub(crate) struct SlotObject {
    pub(crate) effect: EffectKind,
    pub(crate) effect_id: Option<u32>,
    pub(crate) gain: f32,
    pub(crate) aux_send_auto: bool,
    pub(crate) target: Option<u32>,
    /// Sends and slots routing into this slot.
    pub(crate) ref_count: u32,
    pub(crate) state: SlotState,
    pub(crate) dirty: bool,
    pub(crate) pending_kernel: Option<EffectKernel>,
    pub(crate) shared: Arc<EffectSlot>,
}

impl SlotObject {
    pub(crate) fn new(shared: Arc<EffectSlot>) -> Self {
        Self {
            effect: EffectKind::Null,
            effect_id: None,
            gain: 1.0,
            aux_send_auto: true,
            target: None,
            ref_count: 0,
            state: SlotState::Initial,
            dirty: true,
            pending_kernel: None,
            shared,
        }
    }

    pub(crate) fn info(&self) -> EffectSlotInfo {
        EffectSlotInfo {
            gain: self.gain,
            aux_send_auto: self.aux_send_auto,
            target: self.target.map(EffectSlotId),
            state: self.state,
            effect: self.effect_id.map(crate::effect::EffectId),
        }
    }

    /// Hands current properties to the mixer. On failure the slot stays
    /// dirty and keeps any unpublished kernel for a retry.
    pub(crate) fn publish(
        &mut self,
        free: &PropsFreeList<EffectSlotProps>,
        target: Option<Arc<EffectSlot>>,
    ) -> Result<()> {
        let mut kernel = self.pending_kernel.take();
        let (gain, aux_send_auto) = (self.gain, self.aux_send_auto);
        let result = free.publish_carrying(
            &self.shared.update,
            |props| {
                props.gain = gain;
                props.aux_send_auto = aux_send_auto;
                props.target = target;
                props.kernel = kernel.take();
            },
            |pending, props| {
                if props.kernel.is_none() {
                    props.kernel = pending.kernel.take();
                }
            },
        );
        match result {
            Ok(()) => {
                self.shared
                    .aux_send_auto
                    .store(aux_send_auto, Ordering::Release);
                self.dirty = false;
                Ok(())
            }
            Err(err) => {
                self.pending_kernel = kernel;
                self.dirty = true;
                Err(err)
            }
        }
    }
}

/// Fails if routing `slot` into `target` would close a loop.
pub(crate) fn check_target_chain(
    slot: u32,
    target: Option<u32>,
    target_of: impl Fn(u32) -> Option<u32>,
) -> Result<()> {
    let mut next = target;
    while let Some(id) = next {
        if id == slot {
            return Err(AlError::InvalidOperation(format!(
                "targeting slot {} would create a loop",
                slot
            )));
        }
        next = target_of(id);
    }
    Ok(())
}

/// Builds the next active array: `added` prepended, duplicates dropped
/// keeping the first occurrence, `removed` filtered out, and every slot
/// ordered before the slots it feeds.
pub(crate) fn next_active_order(
    current: &[u32],
    added: &[u32],
    removed: &[u32],
    target_of: impl Fn(u32) -> Option<u32>,
) -> Vec<u32> {
    let mut order: Vec<u32> = Vec::with_capacity(current.len() + added.len());
    for &id in added.iter().chain(current) {
        if !removed.contains(&id) && !order.contains(&id) {
            order.push(id);
        }
    }
    let depth = |mut id: u32| {
        let mut hops = 0usize;
        while let Some(next) = target_of(id) {
            hops += 1;
            id = next;
        }
        hops
    };
    order.sort_by_key(|&id| Reverse(depth(id)));
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_cycle_rejected() {
        let targets: HashMap<u32, u32> = [(1, 2)].into_iter().collect();
        let target_of = |id: u32| targets.get(&id).copied();
        assert!(check_target_chain(2, Some(1), target_of).is_err());
        assert!(check_target_chain(2, Some(2), target_of).is_err());
        assert!(check_target_chain(3, Some(1), target_of).is_ok());
    }

    #[test]
    fn test_active_order_prepends_and_dedupes() {
        let none = |_: u32| None;
        assert_eq!(next_active_order(&[1, 2], &[3], &[], none), vec![3, 1, 2]);
        assert_eq!(next_active_order(&[3, 1, 2], &[2], &[], none), vec![2, 3, 1]);
        assert_eq!(next_active_order(&[3, 1, 2], &[], &[1], none), vec![3, 2]);
    }

    #[test]
    fn test_active_order_runs_sources_before_targets() {
        // 1 feeds 2; 2 was played last so it would otherwise run first.
        let targets: HashMap<u32, u32> = [(1, 2)].into_iter().collect();
        let order = next_active_order(&[1], &[2], &[], |id| targets.get(&id).copied());
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn test_update_swaps_kernel() {
        let free = PropsFreeList::new(None);
        let mut object = SlotObject::new(Arc::new(EffectSlot::new(1, 2)));
        object.gain = 0.5;
        object.pending_kernel = Some(EffectKernel::Passthrough {
            gain: 1.0,
            slot_gain: 1.0,
        });
        object.publish(&free, None).unwrap();
        assert!(object.pending_kernel.is_none());

        let shared = object.shared.clone();
        let mut mix = shared.mix.lock();
        assert!(shared.consume_update(&mut mix, &free));
        assert_eq!(mix.gain, 0.5);
        assert!(matches!(
            mix.kernel,
            EffectKernel::Passthrough { slot_gain, .. } if slot_gain == 0.5
        ));
    }

    #[test]
    fn test_kernel_survives_later_update_in_same_period() {
        let free = PropsFreeList::new(None);
        let mut object = SlotObject::new(Arc::new(EffectSlot::new(1, 2)));
        object.pending_kernel = Some(EffectKernel::Passthrough {
            gain: 1.0,
            slot_gain: 1.0,
        });
        object.publish(&free, None).unwrap();
        object.gain = 0.25;
        object.publish(&free, None).unwrap();
        object.aux_send_auto = false;
        object.publish(&free, None).unwrap();

        let shared = object.shared.clone();
        let mut mix = shared.mix.lock();
        assert!(shared.consume_update(&mut mix, &free));
        assert_eq!(mix.gain, 0.25);
        assert!(matches!(
            mix.kernel,
            EffectKernel::Passthrough { slot_gain, .. } if slot_gain == 0.25
        ));
        assert!(!shared.aux_send_auto.load(Ordering::Acquire));
    }

    #[test]
    fn test_newer_kernel_replaces_unconsumed_one() {
        let free = PropsFreeList::new(None);
        let mut object = SlotObject::new(Arc::new(EffectSlot::new(1, 2)));
        object.pending_kernel = Some(EffectKernel::Passthrough {
            gain: 1.0,
            slot_gain: 1.0,
        });
        object.publish(&free, None).unwrap();
        object.pending_kernel = Some(EffectKernel::Null);
        object.publish(&free, None).unwrap();

        let shared = object.shared.clone();
        let mut mix = shared.mix.lock();
        mix.kernel = EffectKernel::Passthrough {
            gain: 0.5,
            slot_gain: 1.0,
        };
        assert!(shared.consume_update(&mut mix, &free));
        assert!(matches!(mix.kernel, EffectKernel::Null));
    }
}
