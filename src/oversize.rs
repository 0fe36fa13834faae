//! Detached runs for oversize chunks.
//!
//! Entries too large for the main free list (and, under the auto-expand
//! policy, overflow during saturation) are carved from detached 64-aligned
//! heap runs so a rare multi-megabyte entry never wedges the block array.
//! Returned runs park in a LIFO pool and are handed out again to later
//! oversize allocations; the GC frees runs whose release deadline has
//! passed, so a burst's memory drains back to the allocator instead of
//! lingering.
//!
//! A detached chunk uses the same 32-byte head layout as an in-array chunk
//! with `block_num == 0`; the run's total allocation size is recorded in
//! the head's reserved word so release can rebuild the layout.

use std::alloc::{alloc, dealloc, Layout};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::block::{BlockStatus, ChunkHead, BLOCK_HEAD_SIZE, CACHE_LINE_SIZE};
use crate::sync::SpinLock;

const OFF_ALLOC_SIZE: usize = 20; // reserved word of the chunk head

pub(crate) fn set_alloc_size(head: ChunkHead, size: u32) {
    // SAFETY: offset 20 is inside the head and 4-aligned.
    unsafe { head.as_ptr().add(OFF_ALLOC_SIZE).cast::<u32>().write(size) }
}

pub(crate) fn alloc_size(head: ChunkHead) -> u32 {
    // SAFETY: as in set_alloc_size.
    unsafe { head.as_ptr().add(OFF_ALLOC_SIZE).cast::<u32>().read() }
}

struct PooledRun {
    ptr: *mut u8,
    size: u32,
    deadline_ms: u64,
}

unsafe impl Send for PooledRun {}

/// LIFO pool of detached runs with deadline-based eviction.
pub(crate) struct OversizePool {
    pooled: SpinLock<Vec<PooledRun>>,
    outstanding_bytes: AtomicU64,
    pooled_bytes: AtomicU64,
}

impl OversizePool {
    pub(crate) fn new() -> Self {
        Self {
            pooled: SpinLock::new(Vec::new()),
            outstanding_bytes: AtomicU64::new(0),
            pooled_bytes: AtomicU64::new(0),
        }
    }

    /// Allocates a detached run with ≥ `payload` bytes of capacity,
    /// preferring a pooled run. Returns the initialized chunk head.
    ///
    /// `reused` reports whether the run came from the pool.
    pub(crate) fn alloc(&self, payload: u32) -> Option<(ChunkHead, bool)> {
        let need = run_size(payload);
        let mut reused = false;
        let ptr = {
            let mut pooled = self.pooled.lock();
            // LIFO scan from the most recently returned run.
            let found = pooled
                .iter()
                .rposition(|r| r.size >= need && r.size <= need.saturating_mul(4));
            match found {
                Some(i) => {
                    let run = pooled.remove(i);
                    self.pooled_bytes
                        .fetch_sub(u64::from(run.size), Ordering::Relaxed);
                    reused = true;
                    self.outstanding_bytes
                        .fetch_add(u64::from(run.size), Ordering::Relaxed);
                    // Hand back the run's true size so release re-pools all of it.
                    let head = ChunkHead::from_ptr(run.ptr);
                    init_head(head, run.size);
                    return Some((head, reused));
                }
                None => {
                    drop(pooled);
                    let layout = run_layout(need);
                    // SAFETY: layout has non-zero size and valid alignment.
                    let ptr = unsafe { alloc(layout) };
                    if ptr.is_null() {
                        return None;
                    }
                    ptr
                }
            }
        };
        self.outstanding_bytes
            .fetch_add(u64::from(need), Ordering::Relaxed);
        let head = ChunkHead::from_ptr(ptr);
        init_head(head, need);
        Some((head, reused))
    }

    /// Returns a detached run to the pool with a release deadline.
    pub(crate) fn release(&self, head: ChunkHead, deadline_ms: u64) {
        let size = alloc_size(head);
        self.outstanding_bytes
            .fetch_sub(u64::from(size), Ordering::Relaxed);
        self.pooled_bytes.fetch_add(u64::from(size), Ordering::Relaxed);
        self.pooled.lock().push(PooledRun {
            ptr: head.as_ptr(),
            size,
            deadline_ms,
        });
    }

    /// Frees pooled runs whose deadline has passed. Returns how many were
    /// freed.
    pub(crate) fn evict_expired(&self, now_ms: u64) -> usize {
        let mut expired = Vec::new();
        {
            let mut pooled = self.pooled.lock();
            let mut i = 0;
            while i < pooled.len() {
                if pooled[i].deadline_ms <= now_ms {
                    expired.push(pooled.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        let n = expired.len();
        for run in expired {
            self.pooled_bytes
                .fetch_sub(u64::from(run.size), Ordering::Relaxed);
            // SAFETY: run.ptr was allocated with run_layout(run.size) and
            // is owned exclusively by the pool here.
            unsafe { dealloc(run.ptr, run_layout(run.size)) };
        }
        n
    }

    /// Bytes currently handed out to in-flight detached chunks.
    pub(crate) fn outstanding_bytes(&self) -> u64 {
        self.outstanding_bytes.load(Ordering::Relaxed)
    }

    /// Bytes currently parked awaiting their deadline.
    pub(crate) fn pooled_bytes(&self) -> u64 {
        self.pooled_bytes.load(Ordering::Relaxed)
    }

    /// Number of runs currently parked.
    pub(crate) fn pooled_runs(&self) -> usize {
        self.pooled.lock().len()
    }
}

impl Drop for OversizePool {
    fn drop(&mut self) {
        for run in self.pooled.get_mut().drain(..) {
            // SAFETY: as in evict_expired.
            unsafe { dealloc(run.ptr, run_layout(run.size)) };
        }
    }
}

fn run_size(payload: u32) -> u32 {
    let raw = payload as usize + BLOCK_HEAD_SIZE;
    ((raw + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)) as u32
}

fn run_layout(size: u32) -> Layout {
    // Size is a cache-line multiple ≥ 64, so this cannot fail.
    Layout::from_size_align(size as usize, CACHE_LINE_SIZE).expect("valid oversize layout")
}

fn init_head(head: ChunkHead, size: u32) {
    head.store_status(BlockStatus::Unused, Ordering::Relaxed);
    head.set_block_num(0); // detached marker
    head.set_data_size(0);
    set_alloc_size(head, size);
}
