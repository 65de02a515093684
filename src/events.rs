//! Asynchronous events and the thread that delivers them.

use crate::error::{AlError, Result};
use crate::source::SourceState;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum AlEvent {
    SourceStateChanged { source_id: u32, state: SourceState },
    BufferCompleted { source_id: u32, count: u32 },
    Disconnected { message: String },
}

impl AlEvent {
    pub fn source_id(&self) -> Option<u32> {
        match self {
            Self::SourceStateChanged { source_id, .. } | Self::BufferCompleted { source_id, .. } => {
                Some(*source_id)
            }
            Self::Disconnected { .. } => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Self::SourceStateChanged { .. } => EventType::SOURCE_STATE,
            Self::BufferCompleted { .. } => EventType::BUFFER_COMPLETED,
            Self::Disconnected { .. } => EventType::DISCONNECTED,
        }
    }
}

/// Bit set of event kinds a context delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventType(u32);

impl EventType {
    pub const NONE: Self = Self(0);
    pub const SOURCE_STATE: Self = Self(1);
    pub const BUFFER_COMPLETED: Self = Self(2);
    pub const DISCONNECTED: Self = Self(4);
    pub const ALL: Self = Self(7);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for EventType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

pub type EventCallback = dyn Fn(&AlEvent) + Send + Sync;

pub(crate) enum AsyncEvent {
    Event(AlEvent),
    KillThread,
}

/// Mixer-to-user event channel owned by a context.
pub(crate) struct EventQueue {
    producer: Mutex<HeapProd<AsyncEvent>>,
    wake: Sender<()>,
    enabled: Arc<AtomicU32>,
    callback: Arc<Mutex<Option<Arc<EventCallback>>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventQueue {
    pub(crate) fn new(capacity: usize) -> Result<Self> {
        let (producer, consumer) = HeapRb::<AsyncEvent>::new(capacity.max(1)).split();
        let (wake, woken) = crossbeam_channel::bounded(1);
        let enabled = Arc::new(AtomicU32::new(0));
        let callback: Arc<Mutex<Option<Arc<EventCallback>>>> = Arc::new(Mutex::new(None));

        let thread = {
            let enabled = enabled.clone();
            let callback = callback.clone();
            std::thread::Builder::new()
                .name("alsonic-events".into())
                .spawn(move || event_thread(consumer, woken, enabled, callback))
                .map_err(|e| AlError::OutOfMemory(format!("failed to start event thread: {}", e)))?
        };

        Ok(Self {
            producer: Mutex::new(producer),
            wake,
            enabled,
            callback,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn enabled(&self) -> EventType {
        EventType(self.enabled.load(Ordering::Acquire))
    }

    pub(crate) fn set_enabled(&self, types: EventType, enable: bool) {
        if enable {
            self.enabled.fetch_or(types.0, Ordering::AcqRel);
        } else {
            self.enabled.fetch_and(!types.0, Ordering::AcqRel);
        }
    }

    pub(crate) fn set_callback(&self, callback: Option<Arc<EventCallback>>) {
        *self.callback.lock() = callback;
    }

    /// Queues an event if its kind is enabled. Never blocks on the consumer.
    pub(crate) fn post(&self, event: AlEvent) {
        if !self.enabled().contains(event.event_type()) {
            return;
        }
        self.push(AsyncEvent::Event(event));
    }

    fn push(&self, event: AsyncEvent) {
        if self.producer.lock().try_push(event).is_err() {
            log::warn!("event queue full, dropping event");
            return;
        }
        let _ = self.wake.try_send(());
    }

    /// Delivers an event on the calling thread, bypassing the queue.
    pub(crate) fn dispatch_now(&self, event: &AlEvent) {
        if !self.enabled().contains(event.event_type()) {
            return;
        }
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    pub(crate) fn shutdown(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        // A full queue still has to see the kill request.
        while self.producer.lock().try_push(AsyncEvent::KillThread).is_err() {
            let _ = self.wake.try_send(());
            std::thread::yield_now();
        }
        let _ = self.wake.try_send(());
        if thread.join().is_err() {
            log::error!("event thread panicked");
        }
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn event_thread(
    mut events: HeapCons<AsyncEvent>,
    woken: Receiver<()>,
    enabled: Arc<AtomicU32>,
    callback: Arc<Mutex<Option<Arc<EventCallback>>>>,
) {
    log::debug!("event thread started");
    loop {
        if woken.recv().is_err() {
            break;
        }
        while let Some(event) = events.try_pop() {
            let event = match event {
                AsyncEvent::KillThread => {
                    log::debug!("event thread exiting");
                    return;
                }
                AsyncEvent::Event(event) => event,
            };
            if !EventType(enabled.load(Ordering::Acquire)).contains(event.event_type()) {
                continue;
            }
            let current = callback.lock().clone();
            if let Some(current) = current {
                current(&event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_event_accessors() {
        let event = AlEvent::BufferCompleted {
            source_id: 3,
            count: 2,
        };
        assert_eq!(event.source_id(), Some(3));
        assert!(!event.is_error());
        assert!(
            AlEvent::Disconnected {
                message: "gone".into()
            }
            .is_error()
        );
    }

    #[test]
    fn test_delivers_enabled_events_only() {
        let queue = EventQueue::new(16).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        queue.set_callback(Some(Arc::new(move |e: &AlEvent| {
            let _ = tx.send(e.clone());
        })));
        queue.set_enabled(EventType::SOURCE_STATE, true);

        queue.post(AlEvent::BufferCompleted {
            source_id: 1,
            count: 1,
        });
        queue.post(AlEvent::SourceStateChanged {
            source_id: 1,
            state: SourceState::Stopped,
        });

        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(
            got,
            AlEvent::SourceStateChanged {
                source_id: 1,
                state: SourceState::Stopped
            }
        );
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        queue.shutdown();
    }
}
