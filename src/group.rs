//! Per-(thread, buffer) write groups.
//!
//! Each producer thread owns one group per buffer it writes to. The group
//! holds the thread's staged run (a span of blocks taken from the free
//! list), its carve cursor, and its per-group sequence counter, so the hot
//! allocation path touches no shared state at all until the run drains.
//!
//! Groups are found through a thread-local index keyed by buffer instance.
//! A group with no writes for the configured TTL, or whose thread has
//! exited, is reclaimed by the GC sweep: the uncarved tail of its run
//! returns to the free list and its persistent slot clears. Reclamation
//! races the owner through a SeqCst flag handshake (`writing`/`retired`):
//! whichever side loses its Dekker round backs off, so the GC never pulls
//! a run out from under a thread between alloc and commit, and an owner
//! whose group was reclaimed transparently starts a fresh one.
//!
//! Thread exit rolls the run back eagerly through the same handshake; the
//! cleanup never depends on destructor order across threads.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::buffer::BufferCore;
use crate::mmap::SLOT_NONE;

/// Write context of one (thread, buffer) pair.
pub(crate) struct WriteGroup {
    gid: u32,
    slot: usize,
    /// Current staged run; `SLOT_NONE` start means no run.
    run_start: AtomicU32,
    run_len: AtomicU32,
    /// Carve offset within the run, in blocks.
    run_cursor: AtomicU32,
    next_seq: AtomicU32,
    /// Set between alloc and commit; blocks GC reclamation.
    writing: AtomicBool,
    /// Set once by the reclaiming side; the owner abandons the group.
    retired: AtomicBool,
    last_active_ms: AtomicU64,
    // Write-rate estimation for adaptive run sizing.
    window_start_ms: AtomicU64,
    window_count: AtomicU32,
    last_rate: AtomicU32,
}

impl WriteGroup {
    pub(crate) fn new(gid: u32, slot: usize, now_ms: u64) -> Self {
        Self {
            gid,
            slot,
            run_start: AtomicU32::new(SLOT_NONE),
            run_len: AtomicU32::new(0),
            run_cursor: AtomicU32::new(0),
            next_seq: AtomicU32::new(0),
            writing: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            last_active_ms: AtomicU64::new(now_ms),
            window_start_ms: AtomicU64::new(now_ms),
            window_count: AtomicU32::new(0),
            last_rate: AtomicU32::new(0),
        }
    }

    #[inline]
    pub(crate) fn gid(&self) -> u32 {
        self.gid
    }

    #[inline]
    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    /// Enters the writing window. Fails if the group was retired, in which
    /// case the caller must fetch a fresh group.
    ///
    /// SeqCst pairs with [`try_retire`](Self::try_retire): of the two
    /// racing stores, at least one side observes the other and backs off.
    #[inline]
    pub(crate) fn try_begin_write(&self) -> bool {
        self.writing.store(true, Ordering::SeqCst);
        if self.retired.load(Ordering::SeqCst) {
            self.writing.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Leaves the writing window, releasing the run-field writes made
    /// inside it to a later reclaimer.
    #[inline]
    pub(crate) fn end_write(&self) {
        self.writing.store(false, Ordering::Release);
    }

    /// Claims the group for reclamation. Fails while the owner is inside
    /// the writing window.
    pub(crate) fn try_retire(&self) -> bool {
        self.retired.store(true, Ordering::SeqCst);
        if self.writing.load(Ordering::SeqCst) {
            self.retired.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    #[inline]
    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    // Run fields: written by the owner inside the writing window, read by
    // the reclaimer after a successful retire (which synchronizes via the
    // owner's `end_write` release store).

    #[inline]
    pub(crate) fn run(&self) -> (u32, u32, u32) {
        (
            self.run_start.load(Ordering::Relaxed),
            self.run_len.load(Ordering::Relaxed),
            self.run_cursor.load(Ordering::Relaxed),
        )
    }

    #[inline]
    pub(crate) fn set_run(&self, start: u32, len: u32) {
        self.run_start.store(start, Ordering::Relaxed);
        self.run_len.store(len, Ordering::Relaxed);
        self.run_cursor.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn advance_cursor(&self, blocks: u32) {
        self.run_cursor.fetch_add(blocks, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn clear_run(&self) {
        self.run_start.store(SLOT_NONE, Ordering::Relaxed);
        self.run_len.store(0, Ordering::Relaxed);
        self.run_cursor.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn next_seq(&self) -> u32 {
        self.next_seq.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn bump_seq(&self) -> u32 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn last_active_ms(&self) -> u64 {
        self.last_active_ms.load(Ordering::Relaxed)
    }

    /// Records a write and refreshes the rate estimate once per second.
    pub(crate) fn touch(&self, now_ms: u64) {
        self.last_active_ms.store(now_ms, Ordering::Relaxed);
        let start = self.window_start_ms.load(Ordering::Relaxed);
        let count = self.window_count.load(Ordering::Relaxed) + 1;
        if now_ms.saturating_sub(start) >= 1000 {
            self.last_rate.store(count, Ordering::Relaxed);
            self.window_start_ms.store(now_ms, Ordering::Relaxed);
            self.window_count.store(0, Ordering::Relaxed);
        } else {
            self.window_count.store(count, Ordering::Relaxed);
        }
    }

    /// Most recent writes-per-second estimate.
    #[inline]
    pub(crate) fn rate(&self) -> u32 {
        self.last_rate.load(Ordering::Relaxed)
    }
}

struct TlsEntry {
    buffer_id: u64,
    core: Weak<BufferCore>,
    group: Arc<WriteGroup>,
}

/// Thread-local group index. The most common case is a single buffer per
/// thread, so a small vector with a linear scan beats a map.
struct TlsGroups {
    entries: Vec<TlsEntry>,
}

impl Drop for TlsGroups {
    fn drop(&mut self) {
        // Thread exit: roll uncommitted runs back through the owning
        // buffer, if it is still alive. Buffers that died first already
        // reclaimed everything.
        for entry in &self.entries {
            if let Some(core) = entry.core.upgrade() {
                core.retire_group(&entry.group);
            }
        }
    }
}

thread_local! {
    static TLS_GROUPS: RefCell<TlsGroups> = RefCell::new(TlsGroups { entries: Vec::new() });
}

/// Returns this thread's group for `core`, creating one lazily. `None`
/// when the buffer's group table is exhausted (transient: the GC frees
/// slots as groups quiesce).
pub(crate) fn thread_group(core: &Arc<BufferCore>, now_ms: u64) -> Option<Arc<WriteGroup>> {
    TLS_GROUPS.with(|tls| {
        let mut tls = tls.borrow_mut();
        let id = core.instance_id();
        if let Some(entry) = tls.entries.iter_mut().find(|e| e.buffer_id == id) {
            if !entry.group.is_retired() {
                return Some(Arc::clone(&entry.group));
            }
            // Reclaimed while we were quiescent; start over.
            let group = core.create_group(now_ms)?;
            entry.core = Arc::downgrade(core);
            entry.group = Arc::clone(&group);
            return Some(group);
        }
        let group = core.create_group(now_ms)?;
        tls.entries.push(TlsEntry {
            buffer_id: id,
            core: Arc::downgrade(core),
            group: Arc::clone(&group),
        });
        Some(group)
    })
}
