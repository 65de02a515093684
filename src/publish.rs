//! The device mix counter and immutable snapshots shared with the mixer.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

/// Counter bumped on entry to and exit from every mix pass.
///
/// An odd value means a pass is in progress.
#[derive(Debug, Default)]
pub(crate) struct MixCounter(AtomicU32);

impl MixCounter {
    /// Opens a mix pass. Only the holder of the device mix lock may call this.
    pub(crate) fn begin(&self) -> MixGuard<'_> {
        self.0.fetch_add(1, Ordering::SeqCst);
        MixGuard { counter: self }
    }

    pub(crate) fn load(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    /// Spins until no mix pass is in progress and returns the counter value.
    pub(crate) fn wait_for_mix(&self) -> u32 {
        loop {
            let count = self.load();
            if count & 1 == 0 {
                return count;
            }
            std::hint::spin_loop();
        }
    }

    /// Runs `read` until it observes a state not torn by a mix pass.
    pub(crate) fn read_consistent<R>(&self, mut read: impl FnMut() -> R) -> R {
        loop {
            let before = self.wait_for_mix();
            let value = read();
            if self.load() == before {
                return value;
            }
        }
    }
}

/// Proof that a mix pass is in progress; closes the pass on drop.
pub(crate) struct MixGuard<'a> {
    counter: &'a MixCounter,
}

impl Drop for MixGuard<'_> {
    fn drop(&mut self) {
        self.counter.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// An immutable value the mixer reads without locking.
///
/// Writers swap in a new value and wait for the mix counter before the old
/// one is released, so a reader holding a [`MixGuard`] never sees it freed.
pub(crate) struct Published<T> {
    ptr: AtomicPtr<T>,
}

unsafe impl<T: Send + Sync> Send for Published<T> {}
unsafe impl<T: Send + Sync> Sync for Published<T> {}

impl<T> Published<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            ptr: AtomicPtr::new(Box::into_raw(Box::new(value))),
        }
    }

    /// Mixer-side read, valid for the length of the pass.
    pub(crate) fn load<'g>(&'g self, _pass: &'g MixGuard<'_>) -> &'g T {
        // SAFETY: replaced values are only freed after `wait_for_mix` observes
        // every pass that could have loaded them as finished.
        unsafe { &*self.ptr.load(Ordering::SeqCst) }
    }

    /// Publishes `value` and returns the previous one once no pass can hold it.
    ///
    /// Writers must be serialised by the caller.
    pub(crate) fn replace(&self, value: T, counter: &MixCounter) -> Box<T> {
        let old = self.ptr.swap(Box::into_raw(Box::new(value)), Ordering::SeqCst);
        counter.wait_for_mix();
        // SAFETY: `old` came from `Box::into_raw` and no reader can still see it.
        unsafe { Box::from_raw(old) }
    }

    /// Writer-side read. Callers must hold the lock that serialises writers.
    pub(crate) fn current(&self) -> &T {
        // SAFETY: only writers free values, and they are serialised with us.
        unsafe { &*self.ptr.load(Ordering::Acquire) }
    }
}

impl<T> Drop for Published<T> {
    fn drop(&mut self) {
        let value = std::mem::replace(self.ptr.get_mut(), ptr::null_mut());
        if !value.is_null() {
            // SAFETY: exclusive access; the value came from `Box::into_raw`.
            drop(unsafe { Box::from_raw(value) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_parity() {
        let counter = MixCounter::default();
        assert_eq!(counter.wait_for_mix(), 0);
        {
            let _pass = counter.begin();
            assert_eq!(counter.load() & 1, 1);
        }
        assert_eq!(counter.wait_for_mix(), 2);
    }

    #[test]
    fn test_replace_returns_old_snapshot() {
        let counter = MixCounter::default();
        let published = Published::new(vec![1, 2]);
        {
            let pass = counter.begin();
            assert_eq!(published.load(&pass), &vec![1, 2]);
        }
        let old = published.replace(vec![3], &counter);
        assert_eq!(*old, vec![1, 2]);
        assert_eq!(published.current(), &vec![3]);
    }

    #[test]
    fn test_replace_waits_for_running_pass() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicBool;

        let counter = Arc::new(MixCounter::default());
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let mixer = {
            let counter = counter.clone();
            let started = started.clone();
            let finished = finished.clone();
            std::thread::spawn(move || {
                let _pass = counter.begin();
                started.store(true, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(20));
                finished.store(true, Ordering::SeqCst);
            })
        };
        while !started.load(Ordering::SeqCst) {
            std::hint::spin_loop();
        }
        let published = Published::new(0u8);
        let _old = published.replace(1, &counter);
        assert!(finished.load(Ordering::SeqCst));
        mixer.join().unwrap();
    }
}
