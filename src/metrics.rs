//! Operation counters.
//!
//! Dropped or invalidated entries are never silently obscured; every
//! failure path increments one of these counters, observable through
//! [`LogBuffer::metrics`](crate::LogBuffer::metrics).

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters updated by producers, the consumer and the GC.
#[derive(Debug, Default)]
pub struct Metrics {
    alloc_success: AtomicU64,
    alloc_not_enough_space: AtomicU64,
    alloc_wait_retry: AtomicU64,
    alloc_size_invalid: AtomicU64,
    entries_committed: AtomicU64,
    entries_read: AtomicU64,
    entries_dropped: AtomicU64,
    invalid_chunks: AtomicU64,
    leaked_blocks: AtomicU64,
    snapshot_dropped: AtomicU64,
    console_dropped: AtomicU64,
    recovery_dropped_groups: AtomicU64,
    oversize_allocs: AtomicU64,
    oversize_reused: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        #[inline]
        pub(crate) fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl Metrics {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    counter!(add_alloc_success, alloc_success);
    counter!(add_alloc_not_enough_space, alloc_not_enough_space);
    counter!(add_alloc_wait_retry, alloc_wait_retry);
    counter!(add_alloc_size_invalid, alloc_size_invalid);
    counter!(add_entries_committed, entries_committed);
    counter!(add_entries_read, entries_read);
    counter!(add_entries_dropped, entries_dropped);
    counter!(add_invalid_chunks, invalid_chunks);
    counter!(add_snapshot_dropped, snapshot_dropped);
    counter!(add_console_dropped, console_dropped);
    counter!(add_recovery_dropped_groups, recovery_dropped_groups);
    counter!(add_oversize_allocs, oversize_allocs);
    counter!(add_oversize_reused, oversize_reused);

    #[inline]
    pub(crate) fn add_leaked_blocks(&self, n: u64) {
        self.leaked_blocks.fetch_add(n, Ordering::Relaxed);
    }

    /// Takes a point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            alloc_success: self.alloc_success.load(Ordering::Relaxed),
            alloc_not_enough_space: self.alloc_not_enough_space.load(Ordering::Relaxed),
            alloc_wait_retry: self.alloc_wait_retry.load(Ordering::Relaxed),
            alloc_size_invalid: self.alloc_size_invalid.load(Ordering::Relaxed),
            entries_committed: self.entries_committed.load(Ordering::Relaxed),
            entries_read: self.entries_read.load(Ordering::Relaxed),
            entries_dropped: self.entries_dropped.load(Ordering::Relaxed),
            invalid_chunks: self.invalid_chunks.load(Ordering::Relaxed),
            leaked_blocks: self.leaked_blocks.load(Ordering::Relaxed),
            snapshot_dropped: self.snapshot_dropped.load(Ordering::Relaxed),
            console_dropped: self.console_dropped.load(Ordering::Relaxed),
            recovery_dropped_groups: self.recovery_dropped_groups.load(Ordering::Relaxed),
            oversize_allocs: self.oversize_allocs.load(Ordering::Relaxed),
            oversize_reused: self.oversize_reused.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub alloc_success: u64,
    pub alloc_not_enough_space: u64,
    pub alloc_wait_retry: u64,
    pub alloc_size_invalid: u64,
    pub entries_committed: u64,
    pub entries_read: u64,
    pub entries_dropped: u64,
    pub invalid_chunks: u64,
    pub leaked_blocks: u64,
    pub snapshot_dropped: u64,
    pub console_dropped: u64,
    pub recovery_dropped_groups: u64,
    pub oversize_allocs: u64,
    pub oversize_reused: u64,
}
