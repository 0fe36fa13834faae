//! Console fan-out.
//!
//! An optional side channel: formatted messages are queued into a bounded
//! lock-free ring and handed to registered callbacks by an explicit drain
//! call. Intended for test harnesses and UI echoes; completely orthogonal
//! to sinks. Drop-if-full with a counter.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use parking_lot::RwLock;

use crate::entry::Level;

/// One formatted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleEntry {
    pub category: u32,
    pub level: Level,
    pub text: String,
}

type Callback = Box<dyn Fn(&ConsoleEntry) + Send + Sync>;

/// Bounded fan-out queue with registered callbacks.
pub struct ConsoleBuffer {
    queue: ArrayQueue<ConsoleEntry>,
    callbacks: RwLock<Vec<(u64, Callback)>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl ConsoleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queues a formatted message. Returns `false` (and counts) when full.
    pub fn enqueue(&self, entry: ConsoleEntry) -> bool {
        if self.queue.push(entry).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Registers a callback; the returned id unregisters it.
    pub fn register_callback(&self, cb: impl Fn(&ConsoleEntry) + Send + Sync + 'static) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.write().push((id, Box::new(cb)));
        id
    }

    pub fn unregister_callback(&self, id: u64) {
        self.callbacks.write().retain(|(cb_id, _)| *cb_id != id);
    }

    /// Drains queued messages through every registered callback. Returns
    /// the number of messages removed.
    pub fn fetch_and_remove(&self) -> usize {
        let callbacks = self.callbacks.read();
        let mut n = 0;
        while let Some(entry) = self.queue.pop() {
            for (_, cb) in callbacks.iter() {
                cb(&entry);
            }
            n += 1;
        }
        n
    }

    /// Messages dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
