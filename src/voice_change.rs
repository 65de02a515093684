//! FIFO of play-state changes from API threads to the mixer.
//!
//! Nodes form one singly-linked chain: `tail -> spare nodes -> current ->
//! pending nodes`. API threads take spare nodes from `tail` and append filled
//! ones after the last pending node; the mixer walks forward from `current`
//! and leaves `current` on the last node it applied. Nodes the mixer has
//! passed become spare again. Nodes are allocated in clusters and never freed
//! before the queue itself.

use parking_lot::Mutex;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, AtomicUsize, Ordering};

const CLUSTER_SIZE: usize = 128;
const NO_VOICE: usize = usize::MAX;

/// The transition a queued change requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VoiceChangeState {
    Reset,
    Stop,
    Play,
    Pause,
    Restart,
}

impl VoiceChangeState {
    fn to_u8(self) -> u8 {
        match self {
            Self::Reset => 0,
            Self::Stop => 1,
            Self::Play => 2,
            Self::Pause => 3,
            Self::Restart => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Reset,
            1 => Self::Stop,
            2 => Self::Play,
            3 => Self::Pause,
            _ => Self::Restart,
        }
    }
}

/// One change as submitted by the API and seen by the mixer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VoiceChange {
    pub(crate) old_voice: Option<usize>,
    pub(crate) voice: Option<usize>,
    pub(crate) source_id: u32,
    pub(crate) state: VoiceChangeState,
}

struct Node {
    old_voice: AtomicUsize,
    voice: AtomicUsize,
    source_id: AtomicU32,
    state: AtomicU8,
    next: AtomicPtr<Node>,
}

impl Node {
    fn new() -> Self {
        Self {
            old_voice: AtomicUsize::new(NO_VOICE),
            voice: AtomicUsize::new(NO_VOICE),
            source_id: AtomicU32::new(0),
            state: AtomicU8::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn store(&self, change: &VoiceChange) {
        self.old_voice
            .store(change.old_voice.unwrap_or(NO_VOICE), Ordering::Relaxed);
        self.voice
            .store(change.voice.unwrap_or(NO_VOICE), Ordering::Relaxed);
        self.source_id.store(change.source_id, Ordering::Relaxed);
        self.state.store(change.state.to_u8(), Ordering::Relaxed);
    }

    fn load(&self) -> VoiceChange {
        let index = |value: usize| (value != NO_VOICE).then_some(value);
        VoiceChange {
            old_voice: index(self.old_voice.load(Ordering::Relaxed)),
            voice: index(self.voice.load(Ordering::Relaxed)),
            source_id: self.source_id.load(Ordering::Relaxed),
            state: VoiceChangeState::from_u8(self.state.load(Ordering::Relaxed)),
        }
    }
}

struct Producer {
    tail: *mut Node,
    clusters: Vec<Box<[Node]>>,
}

// SAFETY: `tail` points into `clusters`, which the producer owns.
unsafe impl Send for Producer {}

pub(crate) struct VoiceChangeQueue {
    producer: Mutex<Producer>,
    current: AtomicPtr<Node>,
}

impl VoiceChangeQueue {
    pub(crate) fn new() -> Self {
        let mut producer = Producer {
            tail: ptr::null_mut(),
            clusters: Vec::new(),
        };
        Self::grow(&mut producer);
        // The last node of the chain starts out as the already-applied one.
        let last = &producer.clusters[0][CLUSTER_SIZE - 1] as *const Node as *mut Node;
        Self {
            producer: Mutex::new(producer),
            current: AtomicPtr::new(last),
        }
    }

    /// Links a new cluster in front of the spare chain.
    fn grow(producer: &mut Producer) {
        let cluster: Box<[Node]> = (0..CLUSTER_SIZE).map(|_| Node::new()).collect();
        for pair in cluster.windows(2) {
            pair[0]
                .next
                .store(&pair[1] as *const Node as *mut Node, Ordering::Relaxed);
        }
        cluster[CLUSTER_SIZE - 1]
            .next
            .store(producer.tail, Ordering::Relaxed);
        producer.tail = &cluster[0] as *const Node as *mut Node;
        producer.clusters.push(cluster);
        log::debug!(
            "voice change queue grown to {} nodes",
            producer.clusters.len() * CLUSTER_SIZE
        );
    }

    /// Appends `changes` as one batch visible to the mixer at once.
    pub(crate) fn submit(&self, changes: &[VoiceChange]) {
        if changes.is_empty() {
            return;
        }
        let mut producer = self.producer.lock();

        let mut first: *mut Node = ptr::null_mut();
        let mut last: *mut Node = ptr::null_mut();
        for change in changes {
            if producer.tail == self.current.load(Ordering::Acquire) {
                Self::grow(&mut producer);
            }
            let node = producer.tail;
            // SAFETY: spare nodes between `tail` and `current` belong to the producer.
            unsafe {
                producer.tail = (*node).next.swap(ptr::null_mut(), Ordering::Relaxed);
                (*node).store(change);
                if last.is_null() {
                    first = node;
                } else {
                    (*last).next.store(node, Ordering::Relaxed);
                }
            }
            last = node;
        }

        let mut end = self.current.load(Ordering::Acquire);
        // SAFETY: nodes from `current` onwards are never recycled while the
        // producer lock is held, and they live as long as the queue.
        unsafe {
            loop {
                let next = (*end).next.load(Ordering::Relaxed);
                if next.is_null() {
                    break;
                }
                end = next;
            }
            (*end).next.store(first, Ordering::Release);
        }
    }

    /// Mixer side: applies every submitted change in order.
    ///
    /// Calls must be serialised with each other, which the device mix lock
    /// provides.
    pub(crate) fn drain(&self, mut apply: impl FnMut(VoiceChange)) -> usize {
        let mut cur = self.current.load(Ordering::Acquire);
        let mut count = 0;
        // SAFETY: nodes are never freed while the queue is alive.
        unsafe {
            loop {
                let next = (*cur).next.load(Ordering::Acquire);
                if next.is_null() {
                    break;
                }
                cur = next;
                apply((*cur).load());
                count += 1;
            }
        }
        if count > 0 {
            self.current.store(cur, Ordering::Release);
        }
        count
    }

    /// Total nodes allocated so far.
    pub(crate) fn capacity(&self) -> usize {
        self.producer.lock().clusters.len() * CLUSTER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn play(voice: usize, source_id: u32) -> VoiceChange {
        VoiceChange {
            old_voice: None,
            voice: Some(voice),
            source_id,
            state: VoiceChangeState::Play,
        }
    }

    #[test]
    fn test_drain_in_submission_order() {
        let queue = VoiceChangeQueue::new();
        queue.submit(&[play(0, 1), play(1, 2)]);
        queue.submit(&[VoiceChange {
            old_voice: Some(0),
            voice: None,
            source_id: 1,
            state: VoiceChangeState::Stop,
        }]);

        let mut seen = Vec::new();
        assert_eq!(queue.drain(|c| seen.push(c)), 3);
        assert_eq!(seen[0], play(0, 1));
        assert_eq!(seen[1].source_id, 2);
        assert_eq!(seen[2].state, VoiceChangeState::Stop);
        assert_eq!(seen[2].old_voice, Some(0));
        assert_eq!(queue.drain(|_| panic!("queue should be empty")), 0);
    }

    #[test]
    fn test_nodes_are_recycled() {
        let queue = VoiceChangeQueue::new();
        for round in 0..50 {
            let batch: Vec<_> = (0..20).map(|i| play(i, round)).collect();
            queue.submit(&batch);
            assert_eq!(queue.drain(|_| {}), 20);
        }
        assert_eq!(queue.capacity(), CLUSTER_SIZE);
    }

    #[test]
    fn test_grows_when_mixer_lags() {
        let queue = VoiceChangeQueue::new();
        let batch: Vec<_> = (0..300).map(|i| play(i, 1)).collect();
        queue.submit(&batch);
        assert!(queue.capacity() >= 300);
        let mut voices = Vec::new();
        queue.drain(|c| voices.push(c.voice.unwrap()));
        assert_eq!(voices, (0..300).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_submit_and_drain() {
        let queue = Arc::new(VoiceChangeQueue::new());
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..5000u32 {
                    queue.submit(&[play(i as usize, i + 1)]);
                }
            })
        };
        let mut expected = 1;
        while expected <= 5000 {
            queue.drain(|c| {
                assert_eq!(c.source_id, expected);
                expected += 1;
            });
        }
        producer.join().unwrap();
    }
}
