//! Property-update channel between API threads and the mixer.
//!
//! Every mixer-side consumer owns an [`UpdateSlot`] holding at most one
//! pending record. Records are recycled through a [`PropsFreeList`] so the
//! mixer never allocates or frees one.

use crate::error::{AlError, Result};
use parking_lot::Mutex;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

pub(crate) struct PropsNode<T> {
    pub(crate) props: T,
    next: *mut PropsNode<T>,
}

/// Lock-free stack of spare property records.
///
/// Pushes may come from any thread. Pops are serialised by an internal lock,
/// which rules out ABA on the head.
pub(crate) struct PropsFreeList<T> {
    head: AtomicPtr<PropsNode<T>>,
    pop_lock: Mutex<()>,
    allocated: AtomicUsize,
    max_nodes: Option<usize>,
}

// SAFETY: nodes are owned exclusively by whichever structure currently links
// them, and are only handed between threads through atomic exchanges.
unsafe impl<T: Send> Send for PropsFreeList<T> {}
unsafe impl<T: Send> Sync for PropsFreeList<T> {}

impl<T: Default + Send> PropsFreeList<T> {
    pub(crate) fn new(max_nodes: Option<usize>) -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            pop_lock: Mutex::new(()),
            allocated: AtomicUsize::new(0),
            max_nodes,
        }
    }

    fn push_raw(&self, node: *mut PropsNode<T>) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: the caller hands over exclusive ownership of `node`.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    fn pop(&self) -> Option<Box<PropsNode<T>>> {
        let _guard = self.pop_lock.lock();
        let mut head = self.head.load(Ordering::Acquire);
        while !head.is_null() {
            // SAFETY: `head` stays linked until this (the only) popper unlinks it.
            let next = unsafe { (*head).next };
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Acquire, Ordering::Acquire)
            {
                // SAFETY: the node was created by `Box::into_raw` and is now unlinked.
                Ok(_) => return Some(unsafe { Box::from_raw(head) }),
                Err(current) => head = current,
            }
        }
        None
    }

    /// Takes a spare record or allocates a new one within the node cap.
    pub(crate) fn acquire(&self) -> Result<Box<PropsNode<T>>> {
        if let Some(node) = self.pop() {
            return Ok(node);
        }
        let count = self.allocated.load(Ordering::Relaxed);
        if self.max_nodes.is_some_and(|max| count >= max) {
            return Err(AlError::OutOfMemory(format!(
                "property record limit of {} reached",
                count
            )));
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(PropsNode {
            props: T::default(),
            next: ptr::null_mut(),
        }))
    }

    /// Fills a record and hands it to `slot`, recycling any record it displaces.
    pub(crate) fn publish(&self, slot: &UpdateSlot<T>, fill: impl FnOnce(&mut T)) -> Result<()> {
        self.publish_carrying(slot, fill, |_, _| {})
    }

    /// Like [`publish`](Self::publish), but a record the mixer has not taken
    /// yet is first pulled back and passed to `carry` along with the new one,
    /// so one-shot payloads in it are not lost. Callers must serialise
    /// publishers of the same slot.
    pub(crate) fn publish_carrying(
        &self,
        slot: &UpdateSlot<T>,
        fill: impl FnOnce(&mut T),
        carry: impl FnOnce(&mut T, &mut T),
    ) -> Result<()> {
        let mut node = self.acquire()?;
        fill(&mut node.props);
        let pending = slot.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if !pending.is_null() {
            // SAFETY: the swap took the unconsumed record back from the mixer.
            carry(unsafe { &mut (*pending).props }, &mut node.props);
            self.push_raw(pending);
        }
        let old = slot.ptr.swap(Box::into_raw(node), Ordering::AcqRel);
        if !old.is_null() {
            self.push_raw(old);
        }
        Ok(())
    }

    /// Number of records sitting in the list.
    #[cfg(test)]
    pub(crate) fn free_count(&self) -> usize {
        let _guard = self.pop_lock.lock();
        let mut count = 0;
        let mut node = self.head.load(Ordering::Acquire);
        while !node.is_null() {
            count += 1;
            // SAFETY: no node can be unlinked while the pop lock is held.
            node = unsafe { (*node).next };
        }
        count
    }

    /// Number of records ever allocated by this list.
    #[cfg(test)]
    pub(crate) fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl<T> Drop for PropsFreeList<T> {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        while !node.is_null() {
            // SAFETY: `&mut self` means nobody else can touch the list.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
        }
    }
}

/// Single pending-update pointer owned by a mixer-side object.
pub(crate) struct UpdateSlot<T> {
    ptr: AtomicPtr<PropsNode<T>>,
}

unsafe impl<T: Send> Send for UpdateSlot<T> {}
unsafe impl<T: Send> Sync for UpdateSlot<T> {}

impl<T: Default + Send> UpdateSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Mixer side: applies the pending record, if any, and recycles it.
    ///
    /// `apply` should swap values out of the record rather than clone them so
    /// that nothing is dropped on the mixing thread.
    pub(crate) fn consume(&self, free: &PropsFreeList<T>, apply: impl FnOnce(&mut T)) -> bool {
        let node = self.ptr.swap(ptr::null_mut(), Ordering::Acquire);
        if node.is_null() {
            return false;
        }
        // SAFETY: the swap transferred exclusive ownership of the record to us.
        apply(unsafe { &mut (*node).props });
        free.push_raw(node);
        true
    }

    /// Drops any pending record back onto the freelist.
    pub(crate) fn clear(&self, free: &PropsFreeList<T>) {
        let node = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if !node.is_null() {
            free.push_raw(node);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self) -> bool {
        !self.ptr.load(Ordering::Acquire).is_null()
    }
}

impl<T> Drop for UpdateSlot<T> {
    fn drop(&mut self) {
        let node = *self.ptr.get_mut();
        if !node.is_null() {
            // SAFETY: a pending record is owned by the slot.
            drop(unsafe { Box::from_raw(node) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_latest_update_wins() {
        let free = PropsFreeList::<u32>::new(None);
        let slot = UpdateSlot::new();
        for value in 1..=5 {
            free.publish(&slot, |p| *p = value).unwrap();
        }
        // Each displaced record is reused by the next publish.
        assert_eq!(free.allocated(), 2);
        assert_eq!(free.free_count(), 1);

        let mut seen = 0;
        assert!(slot.consume(&free, |p| seen = *p));
        assert_eq!(seen, 5);
        assert!(!slot.consume(&free, |_| unreachable!()));
        assert_eq!(free.free_count(), free.allocated());
    }

    #[test]
    fn test_unconsumed_payload_carries_forward() {
        let free = PropsFreeList::<(u32, Option<u32>)>::new(None);
        let slot = UpdateSlot::new();
        let carry = |old: &mut (u32, Option<u32>), new: &mut (u32, Option<u32>)| {
            if new.1.is_none() {
                new.1 = old.1.take();
            }
        };
        free.publish_carrying(&slot, |p| *p = (1, Some(7)), carry).unwrap();
        free.publish_carrying(&slot, |p| *p = (2, None), carry).unwrap();
        free.publish_carrying(&slot, |p| *p = (3, None), carry).unwrap();

        let mut seen = (0, None);
        assert!(slot.consume(&free, |p| seen = std::mem::take(p)));
        assert_eq!(seen, (3, Some(7)));

        // Once consumed, nothing is carried into the next record.
        free.publish_carrying(&slot, |p| *p = (4, None), carry).unwrap();
        assert!(slot.consume(&free, |p| seen = std::mem::take(p)));
        assert_eq!(seen, (4, None));
    }

    #[test]
    fn test_records_are_recycled() {
        let free = PropsFreeList::<u32>::new(None);
        let slot = UpdateSlot::new();
        for round in 0..100 {
            free.publish(&slot, |p| *p = round).unwrap();
            slot.consume(&free, |_| {});
        }
        assert_eq!(free.allocated(), 1);
    }

    #[test]
    fn test_node_cap() {
        let free = PropsFreeList::<u32>::new(Some(1));
        let a = UpdateSlot::new();
        let b = UpdateSlot::new();
        free.publish(&a, |p| *p = 1).unwrap();
        assert!(matches!(
            free.publish(&b, |p| *p = 2),
            Err(AlError::OutOfMemory(_))
        ));
        assert!(!b.is_pending());
        a.clear(&free);
        free.publish(&b, |p| *p = 2).unwrap();
    }

    #[test]
    fn test_concurrent_publish_and_consume() {
        let free = Arc::new(PropsFreeList::<Vec<u8>>::new(None));
        let slot = Arc::new(UpdateSlot::new());
        let producer = {
            let free = free.clone();
            let slot = slot.clone();
            std::thread::spawn(move || {
                for i in 0..2000u32 {
                    free.publish(&slot, |p| {
                        p.clear();
                        p.extend_from_slice(&i.to_le_bytes());
                    })
                    .unwrap();
                }
            })
        };
        let mut last = 0u32;
        let mut current = Vec::new();
        while !producer.is_finished() || slot.is_pending() {
            slot.consume(&free, |p| std::mem::swap(p, &mut current));
            if current.len() == 4 {
                let value = u32::from_le_bytes([current[0], current[1], current[2], current[3]]);
                assert!(value >= last);
                last = value;
            }
        }
        producer.join().unwrap();
        assert_eq!(last, 1999);
        assert_eq!(free.free_count(), free.allocated());
    }
}
