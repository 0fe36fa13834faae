//! The MPSC log buffer core.
//!
//! Producers reserve exclusive chunks, write the entry body, and commit;
//! the single consumer drains committed entries in commit order and
//! returns their blocks. The only serialization points are the free-list
//! spinlock (amortized over block runs) and each chunk head's atomic
//! status word; no lock is ever held across an entry-body copy, and
//! producers and the consumer never block on each other.
//!
//! Visibility protocol: a producer initializes the chunk head and payload,
//! stores the status `Used` with release ordering, and pushes the chunk
//! onto the committed queue (the commit linearization point). The consumer
//! acquires the status before touching anything else. Entries from one
//! producer are observed in that producer's program order; entries across
//! producers are ordered by their commit linearization only; the embedded
//! timestamp is informational.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::block::{BlockArray, BlockStatus, ChunkHead, BLOCK_HEAD_SIZE};
use crate::config::{LogBufferConfig, OverflowPolicy};
use crate::console::ConsoleBuffer;
use crate::error::{BufferError, Result};
use crate::freelist::FreeList;
use crate::group::{thread_group, WriteGroup};
use crate::handle::{ReadChunk, WriteChunk};
use crate::invariants::debug_assert_conservation;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::mmap::{scan_block_array, BackingStore, RecoveredChunk, MAX_GROUPS, SLOT_NONE};
use crate::oversize::{self, OversizePool};
use crate::queue::{self, CommitQueue, Pop};
use crate::sink::Sink;
use crate::snapshot::{Snapshot, SnapshotRing};

/// Console fan-out queue depth.
const CONSOLE_CAPACITY: usize = 128;

/// Run size (blocks) a high-frequency group reserves at once.
const HIGH_FREQ_RUN_BLOCKS: u32 = 16;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Current wall clock in epoch milliseconds.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Point-in-time block accounting; meaningful at quiescent points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAccounting {
    pub total: u32,
    pub free: u32,
    /// Uncarved blocks held by live write groups.
    pub staged: u32,
    /// Carved chunks not yet returned (committed, in the consumer's hand,
    /// or uncommitted reservations).
    pub in_flight: u32,
}

pub(crate) struct BufferCore {
    config: LogBufferConfig,
    backing: BackingStore,
    arr: BlockArray,
    free: FreeList,
    queue: CommitQueue,
    groups: Mutex<Vec<Arc<WriteGroup>>>,
    next_gid: AtomicU32,
    oversize: OversizePool,
    snapshot: Option<SnapshotRing>,
    console: ConsoleBuffer,
    sinks: Mutex<Vec<Box<dyn Sink>>>,
    metrics: Metrics,
    instance_id: u64,
    inited: AtomicBool,
    oversize_threshold_blocks: u32,
    recovered_entries: u64,
    #[cfg(debug_assertions)]
    read_thread: Mutex<Option<std::thread::ThreadId>>,
}

/// High-throughput MPSC log buffer with optional crash recovery.
pub struct LogBuffer {
    core: Arc<BufferCore>,
}

impl LogBuffer {
    /// Builds a buffer from `config`. With recovery enabled and a matching
    /// image on disk, previously committed but unconsumed entries become
    /// readable again; an inconsistent image is wiped, never an error.
    pub fn new(config: LogBufferConfig) -> Result<Self> {
        let config = config.validate();
        let backing = BackingStore::open(&config)?;
        let arr = backing.block_array(&config);
        let total = arr.total_blocks();
        let free = FreeList::new(total);
        let queue = CommitQueue::new();
        let metrics = Metrics::new();

        let mut next_gid = 1u32;
        let mut recovered_entries = 0u64;
        let mut recovered = false;
        if backing.recovery_candidate() {
            if let Some(scan) = scan_block_array(&arr, backing.header()) {
                let (gid_floor, count) =
                    apply_recovery(&arr, &backing, &free, &queue, &metrics, scan);
                next_gid = gid_floor;
                recovered_entries = count;
                recovered = true;
            }
        }
        if !recovered {
            backing.header().initialize(&config);
            free.push(&arr, 0, total);
        }

        let oversize_threshold_blocks = (total / 2).max(1);
        let snapshot = if config.snapshot_buffer_size > 0 {
            Some(SnapshotRing::new(config.snapshot_buffer_size))
        } else {
            None
        };

        let core = BufferCore {
            config,
            backing,
            arr,
            free,
            queue,
            groups: Mutex::new(Vec::new()),
            next_gid: AtomicU32::new(next_gid),
            oversize: OversizePool::new(),
            snapshot,
            console: ConsoleBuffer::new(CONSOLE_CAPACITY),
            sinks: Mutex::new(Vec::new()),
            metrics,
            instance_id: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            inited: AtomicBool::new(true),
            oversize_threshold_blocks,
            recovered_entries,
            #[cfg(debug_assertions)]
            read_thread: Mutex::new(None),
        };
        Ok(Self { core: Arc::new(core) })
    }

    /// Reserves an exclusive contiguous chunk of at least `size` payload
    /// bytes. `epoch_ms` stamps group activity and the adaptive-rate
    /// window; pass [`epoch_ms()`].
    pub fn alloc_write_chunk(&self, size: u32, epoch_ms: u64) -> Result<WriteChunk<'_>> {
        self.core.alloc_chunk(&self.core, size, epoch_ms)
    }

    /// Publishes a reserved chunk. Equivalent to [`WriteChunk::commit`];
    /// provided for symmetry with the read side.
    pub fn commit_write_chunk(&self, chunk: WriteChunk<'_>) {
        chunk.commit();
    }

    /// Takes the oldest committed entry not yet consumed. Single consumer
    /// thread only.
    pub fn read_chunk(&self) -> Result<ReadChunk<'_>> {
        let (node, head) = self.core.read_node()?;
        let core: &BufferCore = &self.core;
        Ok(ReadChunk { core, node, head })
    }

    /// Returns a read chunk's blocks to the buffer. Equivalent to dropping
    /// the handle.
    pub fn return_read_chunk(&self, chunk: ReadChunk<'_>) {
        drop(chunk);
    }

    /// Visits every currently committed entry without dequeuing, oldest
    /// first. Consumer thread only.
    pub fn data_traverse(&self, mut visitor: impl FnMut(&[u8])) {
        self.core.check_consumer_thread();
        self.core.queue.traverse(&self.core.arr, |node, head| {
            if head.load_status(Ordering::Acquire) == Some(BlockStatus::Used)
                && self.core.chunk_is_sane(node, head)
            {
                // SAFETY: published chunk, observed with acquire; the
                // consumer thread owns traversal.
                let payload = unsafe {
                    std::slice::from_raw_parts(head.payload_ptr(), head.data_size() as usize)
                };
                visitor(payload);
            }
        });
    }

    /// Prunes quiescent write groups and expired oversize runs.
    pub fn garbage_collect(&self, now_ms: u64) {
        self.core.oversize.evict_expired(now_ms);
        let ttl = self.core.config.group_gc_ttl_ms;
        let mut groups = self.core.groups.lock();
        groups.retain(|g| {
            if now_ms.saturating_sub(g.last_active_ms()) < ttl {
                return true;
            }
            if g.try_retire() {
                self.core.reclaim_group_run(g);
                false
            } else {
                // Mid-write; the next sweep gets it.
                true
            }
        });
    }

    /// Registers a sink for [`drain`](Self::drain) and flush paths.
    pub fn add_sink(&self, sink: Box<dyn Sink>) {
        self.core.sinks.lock().push(sink);
    }

    /// Reads up to `max` committed entries, dispatching each to every
    /// registered sink. Returns the number of entries dispatched.
    pub fn drain(&self, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.read_chunk() {
                Ok(chunk) => {
                    let mut sinks = self.core.sinks.lock();
                    for sink in sinks.iter_mut() {
                        sink.on_entry(chunk.payload());
                    }
                    drop(sinks);
                    drop(chunk);
                    n += 1;
                }
                Err(_) => break,
            }
        }
        n
    }

    /// Drains everything to the sinks, bounded by `budget`; best effort.
    /// Returns `true` when the buffer emptied within the budget.
    pub fn force_flush(&self, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        loop {
            if self.drain(1024) == 0 && self.core.queue.is_empty() {
                let mut sinks = self.core.sinks.lock();
                for sink in sinks.iter_mut() {
                    sink.flush();
                }
                self.core.backing.flush();
                return true;
            }
            if Instant::now() >= deadline {
                self.core.backing.flush();
                return false;
            }
        }
    }

    /// Copies the snapshot ring's resident window out. Empty when the ring
    /// is disabled.
    pub fn take_snapshot(&self) -> Snapshot {
        match &self.core.snapshot {
            Some(ring) => ring.take(),
            None => Snapshot::default(),
        }
    }

    /// The console fan-out side channel.
    pub fn console(&self) -> &ConsoleBuffer {
        &self.core.console
    }

    /// Operation counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// Entries made readable again by crash recovery at construction.
    pub fn recovered_entries(&self) -> u64 {
        self.core.recovered_entries
    }

    /// Whether the buffer is file-backed (recovery active).
    pub fn is_recoverable(&self) -> bool {
        self.core.backing.file_backed()
    }

    /// Block accounting; exact only at quiescent points.
    pub fn block_accounting(&self) -> BlockAccounting {
        let total = self.core.arr.total_blocks();
        let free = self.core.free.free_blocks();
        let staged: u32 = {
            let groups = self.core.groups.lock();
            groups
                .iter()
                .map(|g| {
                    let (start, len, cursor) = g.run();
                    if start == SLOT_NONE {
                        0
                    } else {
                        len - cursor
                    }
                })
                .sum()
        };
        debug_assert_conservation!(free, staged, 0, total);
        BlockAccounting {
            total,
            free,
            staged,
            in_flight: total - free - staged,
        }
    }

    /// Bytes currently held by in-flight detached (oversize/expansion)
    /// chunks plus pooled runs awaiting their deadline.
    pub fn detached_bytes(&self) -> (u64, u64) {
        (
            self.core.oversize.outstanding_bytes(),
            self.core.oversize.pooled_bytes(),
        )
    }

    /// Effective configuration after validation.
    pub fn config(&self) -> &LogBufferConfig {
        &self.core.config
    }
}

impl Drop for LogBuffer {
    fn drop(&mut self) {
        self.core.inited.store(false, Ordering::Release);
        let mut sinks = self.core.sinks.lock();
        for sink in sinks.iter_mut() {
            sink.close();
        }
        self.core.backing.flush();
    }
}

impl BufferCore {
    #[inline]
    pub(crate) fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Registers a new write group for the calling thread. `None` when the
    /// persistent group table is exhausted (transient; GC frees slots).
    pub(crate) fn create_group(&self, now_ms: u64) -> Option<Arc<WriteGroup>> {
        let mut groups = self.groups.lock();
        let header = self.backing.header();
        let slot_idx = (0..MAX_GROUPS).find(|&i| header.slot(i).is_vacant())?;
        let gid = self.next_gid.fetch_add(1, Ordering::Relaxed);
        let slot = header.slot(slot_idx);
        slot.set_group_id(gid);
        slot.set_next_seq(0);
        slot.set_consumed_seq(0);
        slot.set_run_start(SLOT_NONE);
        slot.set_run_len(0);
        let group = Arc::new(WriteGroup::new(gid, slot_idx, now_ms));
        groups.push(Arc::clone(&group));
        Some(group)
    }

    /// Thread-exit path: rolls the group's run back and forgets the group.
    pub(crate) fn retire_group(&self, group: &Arc<WriteGroup>) {
        let mut groups = self.groups.lock();
        if group.try_retire() {
            self.reclaim_group_run(group);
        }
        groups.retain(|g| !Arc::ptr_eq(g, group));
    }

    /// Returns a retired group's uncarved run tail to the free list and
    /// clears its persistent slot. Caller holds the group-table lock or
    /// otherwise owns the retire.
    fn reclaim_group_run(&self, group: &WriteGroup) {
        let (start, len, cursor) = group.run();
        if start != SLOT_NONE && cursor < len {
            self.free.push(&self.arr, start + cursor, len - cursor);
        }
        group.clear_run();
        self.backing.header().slot(group.slot()).clear();
    }

    pub(crate) fn alloc_chunk<'a>(
        &'a self,
        self_arc: &Arc<BufferCore>,
        size: u32,
        now_ms: u64,
    ) -> Result<WriteChunk<'a>> {
        if !self.inited.load(Ordering::Acquire) {
            return Err(BufferError::NotInitialized);
        }
        if size > self.config.max_oversize_bytes {
            self.metrics.add_alloc_size_invalid();
            return Err(BufferError::AllocSizeInvalid);
        }

        // Two attempts: the first group may have been reclaimed between
        // our TLS lookup and the writing handshake.
        let mut group = None;
        for _ in 0..2 {
            let g = match thread_group(self_arc, now_ms) {
                Some(g) => g,
                None => {
                    self.metrics.add_alloc_wait_retry();
                    return Err(BufferError::WaitAndRetry);
                }
            };
            if g.try_begin_write() {
                group = Some(g);
                break;
            }
        }
        let group = match group {
            Some(g) => g,
            None => {
                self.metrics.add_alloc_wait_retry();
                return Err(BufferError::WaitAndRetry);
            }
        };
        group.touch(now_ms);

        let needed = self.arr.blocks_needed(size);
        let result = if needed > self.oversize_threshold_blocks {
            self.alloc_detached(size, &group, false)
        } else {
            self.alloc_normal(size, needed, &group)
        };
        match result {
            Ok((node, head)) => {
                self.metrics.add_alloc_success();
                Ok(WriteChunk {
                    core: self,
                    node,
                    head,
                    group,
                    size,
                    committed: false,
                })
            }
            Err(e) => {
                group.end_write();
                match e {
                    BufferError::NotEnoughSpace => self.metrics.add_alloc_not_enough_space(),
                    BufferError::WaitAndRetry => self.metrics.add_alloc_wait_retry(),
                    _ => {}
                }
                Err(e)
            }
        }
    }

    fn alloc_normal(&self, size: u32, needed: u32, group: &WriteGroup) -> Result<(u64, ChunkHead)> {
        let (start, len, cursor) = group.run();
        if start != SLOT_NONE && len - cursor >= needed {
            return Ok(self.carve(group, start + cursor, needed, size));
        }

        // Swap runs: hand the remainder back, then reserve a fresh run.
        // Low rates take exactly what is needed; high rates take a batch
        // to keep free-list traffic amortized.
        if start != SLOT_NONE {
            if cursor < len {
                self.free.push(&self.arr, start + cursor, len - cursor);
            }
            group.clear_run();
            let slot = self.backing.header().slot(group.slot());
            slot.set_run_start(SLOT_NONE);
            slot.set_run_len(0);
        }

        let total = self.arr.total_blocks();
        let high_freq = group.rate() >= self.config.high_frequency_threshold;
        let want = if high_freq {
            needed.max(HIGH_FREQ_RUN_BLOCKS).min((total / 4).max(needed))
        } else {
            needed
        };

        let (run_start, run_len) = match self.free.alloc(&self.arr, want) {
            Some(s) => (s, want),
            None if want > needed => match self.free.alloc(&self.arr, needed) {
                Some(s) => (s, needed),
                None => return self.alloc_overflow(size, group),
            },
            None => return self.alloc_overflow(size, group),
        };

        group.set_run(run_start, run_len);
        let slot = self.backing.header().slot(group.slot());
        slot.set_next_seq(group.next_seq());
        slot.set_run_len(run_len);
        slot.set_run_start(run_start);
        Ok(self.carve(group, run_start, needed, size))
    }

    /// Saturation: overflow into a detached run under the auto-expand
    /// policy, otherwise report exhaustion.
    fn alloc_overflow(&self, size: u32, group: &WriteGroup) -> Result<(u64, ChunkHead)> {
        match self.config.policy {
            OverflowPolicy::AutoExpandWhenFull => self.alloc_detached(size, group, true),
            OverflowPolicy::BlockWhenFull => Err(BufferError::NotEnoughSpace),
        }
    }

    fn alloc_detached(
        &self,
        size: u32,
        group: &WriteGroup,
        expansion: bool,
    ) -> Result<(u64, ChunkHead)> {
        if expansion {
            let projected =
                self.oversize.outstanding_bytes() + u64::from(size) + BLOCK_HEAD_SIZE as u64;
            if projected > u64::from(self.config.max_expand_bytes) {
                return Err(BufferError::NotEnoughSpace);
            }
        }
        let (head, reused) = self
            .oversize
            .alloc(size)
            .ok_or(BufferError::NotEnoughSpace)?;
        head.set_data_size(size);
        head.set_group(group.gid());
        // Detached chunks do not consume group sequence numbers: they are
        // not crash-recoverable, and ordering comes from the commit queue.
        head.set_seq(0);
        if reused {
            self.metrics.add_oversize_reused();
        } else {
            self.metrics.add_oversize_allocs();
        }
        Ok((queue::encode_detached(head.as_ptr()), head))
    }

    fn carve(&self, group: &WriteGroup, idx: u32, blocks: u32, size: u32) -> (u64, ChunkHead) {
        let head = self.arr.head(idx);
        head.store_status(BlockStatus::Unused, Ordering::Relaxed);
        head.set_block_num(blocks);
        head.set_data_size(size);
        head.set_group(group.gid());
        head.set_seq(group.bump_seq());
        group.advance_cursor(blocks);
        (queue::encode_index(idx), head)
    }

    /// Publishes a committed chunk: snapshot mirror, status release, queue
    /// push. The mirror copy precedes the push: once the chunk is in the
    /// queue the consumer may free it at any moment.
    pub(crate) fn commit_node(&self, node: u64, head: ChunkHead, group: &WriteGroup) {
        if let Some(ring) = &self.snapshot {
            // SAFETY: the producer owns the chunk until the queue push
            // below; the payload is fully written by now.
            let payload = unsafe {
                std::slice::from_raw_parts(head.payload_ptr(), head.data_size() as usize)
            };
            if !ring.publish(payload) {
                self.metrics.add_snapshot_dropped();
            }
        }
        head.store_status(BlockStatus::Used, Ordering::Release);
        self.queue.push(node, &self.arr);
        self.metrics.add_entries_committed();
        group.end_write();
    }

    /// An uncommitted reservation was dropped: mark invalid so the
    /// consumer reclaims the blocks, and count the entry as dropped.
    pub(crate) fn abandon_node(&self, node: u64, head: ChunkHead, group: &WriteGroup) {
        head.store_status(BlockStatus::Invalid, Ordering::Release);
        self.queue.push(node, &self.arr);
        self.metrics.add_entries_dropped();
        group.end_write();
    }

    pub(crate) fn read_node(&self) -> std::result::Result<(u64, ChunkHead), BufferError> {
        if !self.inited.load(Ordering::Acquire) {
            return Err(BufferError::NotInitialized);
        }
        self.check_consumer_thread();
        loop {
            match self.queue.pop(&self.arr) {
                Pop::Empty => return Err(BufferError::EmptyBuffer),
                Pop::Retry => return Err(BufferError::WaitAndRetry),
                Pop::Node(node) => {
                    let head = queue::resolve(node, &self.arr);
                    match head.load_status(Ordering::Acquire) {
                        Some(BlockStatus::Used) if self.chunk_is_sane(node, head) => {
                            self.metrics.add_entries_read();
                            return Ok((node, head));
                        }
                        Some(BlockStatus::Invalid) => {
                            // Abandoned reservation; already counted.
                            self.reclaim_node(node, head);
                        }
                        _ => {
                            // Failed sanity checks: mark, count, reclaim
                            // what can be trusted, continue.
                            head.store_status(BlockStatus::Invalid, Ordering::Relaxed);
                            self.metrics.add_invalid_chunks();
                            self.reclaim_suspect(node, head);
                        }
                    }
                }
            }
        }
    }

    /// Consumer-side sanity checks on a popped chunk.
    fn chunk_is_sane(&self, node: u64, head: ChunkHead) -> bool {
        let data_size = u64::from(head.data_size());
        if queue::is_detached(node) {
            head.block_num() == 0
                && data_size + BLOCK_HEAD_SIZE as u64 <= u64::from(oversize::alloc_size(head))
        } else {
            let idx = self.arr.index_of(head.as_ptr());
            let bn = head.block_num();
            let total = self.arr.total_blocks();
            bn >= 1
                && bn <= total - idx
                && data_size + BLOCK_HEAD_SIZE as u64
                    <= u64::from(bn) * u64::from(self.arr.block_size())
        }
    }

    /// Returns a consumed (or invalid) chunk's storage to the buffer.
    pub(crate) fn reclaim_node(&self, node: u64, head: ChunkHead) {
        if queue::is_detached(node) {
            let deadline = epoch_ms() + self.config.oversize_release_deadline_ms;
            self.oversize.release(head, deadline);
        } else {
            debug_assert!(
                self.arr.contains(head.as_ptr()),
                "returned handle does not belong to this buffer"
            );
            self.advance_watermark(head.group(), head.seq());
            let idx = self.arr.index_of(head.as_ptr());
            self.free.push(&self.arr, idx, head.block_num());
        }
    }

    /// Reclaims a chunk that failed sanity checks. The block count is only
    /// trusted when it stays in bounds; otherwise the blocks are leaked
    /// deliberately and counted, since a corrupt length would poison the
    /// free list.
    fn reclaim_suspect(&self, node: u64, head: ChunkHead) {
        if queue::is_detached(node) {
            let deadline = epoch_ms() + self.config.oversize_release_deadline_ms;
            self.oversize.release(head, deadline);
            return;
        }
        let idx = self.arr.index_of(head.as_ptr());
        let bn = head.block_num();
        if bn >= 1 && bn <= self.arr.total_blocks() - idx {
            self.free.push(&self.arr, idx, bn);
        } else {
            self.metrics.add_leaked_blocks(1);
        }
    }

    /// Records the consumed watermark for recovery pruning. Best effort:
    /// the slot may have been reassigned, in which case the group id no
    /// longer matches and the update is skipped.
    fn advance_watermark(&self, gid: u32, seq: u32) {
        let header = self.backing.header();
        for i in 0..MAX_GROUPS {
            let slot = header.slot(i);
            if slot.group_id() == gid {
                if slot.consumed_seq() <= seq {
                    slot.set_consumed_seq(seq.wrapping_add(1));
                }
                return;
            }
        }
    }

    #[cfg(debug_assertions)]
    fn check_consumer_thread(&self) {
        let mut owner = self.read_thread.lock();
        let current = std::thread::current().id();
        match *owner {
            Some(id) => debug_assert_eq!(
                id, current,
                "log buffer supports a single consumer thread"
            ),
            None => *owner = Some(current),
        }
    }

    #[cfg(not(debug_assertions))]
    fn check_consumer_thread(&self) {}
}

/// Applies a successful recovery scan: prunes consumed entries by the
/// per-group watermarks, drops groups whose surviving sequences are not
/// contiguous, re-publishes the rest in (group, seq) order, and rebuilds
/// the free list from everything else.
fn apply_recovery(
    arr: &BlockArray,
    backing: &BackingStore,
    free: &FreeList,
    commit_queue: &CommitQueue,
    metrics: &Metrics,
    scan: crate::mmap::ScanResult,
) -> (u32, u64) {
    let header = backing.header();

    let mut watermarks = BTreeMap::new();
    let mut gid_floor = 1u32;
    for i in 0..MAX_GROUPS {
        let slot = header.slot(i);
        if !slot.is_vacant() {
            watermarks.insert(slot.group_id(), slot.consumed_seq());
            gid_floor = gid_floor.max(slot.group_id() + 1);
        }
    }

    let mut by_group: BTreeMap<u32, Vec<RecoveredChunk>> = BTreeMap::new();
    for chunk in scan.chunks {
        gid_floor = gid_floor.max(chunk.group.saturating_add(1));
        by_group.entry(chunk.group).or_default().push(chunk);
    }

    let mut accepted: Vec<RecoveredChunk> = Vec::new();
    let mut reclaim: Vec<(u32, u32)> = scan.free_runs;
    for (gid, mut chunks) in by_group {
        chunks.sort_by_key(|c| c.seq);
        let watermark = watermarks.get(&gid).copied().unwrap_or(0);
        let (consumed, live): (Vec<_>, Vec<_>) =
            chunks.into_iter().partition(|c| c.seq < watermark);
        reclaim.extend(consumed.iter().map(|c| (c.start, c.blocks)));

        let contiguous = live.windows(2).all(|w| w[1].seq == w[0].seq + 1);
        if contiguous {
            accepted.extend(live);
        } else {
            // Cannot re-linearize this producer's entries; drop them all.
            metrics.add_recovery_dropped_groups();
            reclaim.extend(live.iter().map(|c| (c.start, c.blocks)));
        }
    }

    accepted.sort_by_key(|c| (c.group, c.seq));
    for chunk in &accepted {
        commit_queue.push(queue::encode_index(chunk.start), arr);
    }
    for (start, len) in reclaim {
        free.push(arr, start, len);
    }
    for i in 0..MAX_GROUPS {
        header.slot(i).clear();
    }
    (gid_floor, accepted.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CACHE_LINE_SIZE;

    fn buffer(blocks: u32) -> LogBuffer {
        LogBuffer::new(LogBufferConfig::new(
            "core_test",
            blocks * CACHE_LINE_SIZE as u32,
        ))
        .unwrap()
    }

    #[test]
    fn test_alloc_commit_read_roundtrip() {
        let buf = buffer(64);
        let mut chunk = buf.alloc_write_chunk(100, epoch_ms()).unwrap();
        chunk.payload_mut().fill(0xAB);
        chunk.commit();

        let read = buf.read_chunk().unwrap();
        assert_eq!(read.payload().len(), 100);
        assert!(read.payload().iter().all(|&b| b == 0xAB));
        drop(read);

        assert!(matches!(buf.read_chunk(), Err(BufferError::EmptyBuffer)));
        let m = buf.metrics();
        assert_eq!(m.alloc_success, 1);
        assert_eq!(m.entries_committed, 1);
        assert_eq!(m.entries_read, 1);
    }

    #[test]
    fn test_exclusive_reservations_disjoint() {
        let buf = buffer(64);
        let mut a = buf.alloc_write_chunk(64, 0).unwrap();
        let mut b = buf.alloc_write_chunk(64, 0).unwrap();
        let ra = a.payload_mut().as_ptr_range();
        let rb = b.payload_mut().as_ptr_range();
        assert!(ra.end <= rb.start || rb.end <= ra.start);
        a.commit();
        b.commit();
        // FIFO within the producer.
        let first = buf.read_chunk().unwrap();
        assert_eq!(first.seq(), 0);
        drop(first);
        let second = buf.read_chunk().unwrap();
        assert_eq!(second.seq(), 1);
    }

    #[test]
    fn test_dropped_reservation_is_skipped_and_reclaimed() {
        let buf = buffer(64);
        drop(buf.alloc_write_chunk(100, 0).unwrap());
        let mut c = buf.alloc_write_chunk(8, 0).unwrap();
        c.payload_mut().fill(7);
        c.commit();

        let read = buf.read_chunk().unwrap();
        assert_eq!(read.payload(), &[7u8; 8]);
        drop(read);
        assert_eq!(buf.metrics().entries_dropped, 1);
    }

    #[test]
    fn test_not_enough_space_then_recovers() {
        let buf = buffer(16); // 1 KiB
        // Chunks of 7 blocks stay under the oversize threshold
        // (total/2 = 8); two of them fill all but 2 blocks.
        let payload = (7 * 64 - 32) as u32;
        let a = buf.alloc_write_chunk(payload, 0).unwrap();
        let b = buf.alloc_write_chunk(payload, 0).unwrap();
        let c = buf.alloc_write_chunk(payload, 0);
        assert!(matches!(c, Err(BufferError::NotEnoughSpace)));
        assert!(buf.metrics().alloc_not_enough_space >= 1);

        a.commit();
        b.commit();
        drop(buf.read_chunk().unwrap());
        drop(buf.read_chunk().unwrap());
        // Returned chunks coalesced; space is back.
        let again = buf.alloc_write_chunk(payload, 0).unwrap();
        again.commit();
    }

    #[test]
    fn test_auto_expand_overflows_to_detached() {
        let cfg = LogBufferConfig::new("expand_test", 1024)
            .with_policy(OverflowPolicy::AutoExpandWhenFull);
        let buf = LogBuffer::new(cfg).unwrap();
        // Saturate the array with held (uncommitted) big reservations.
        let payload = 7 * 64 - 32;
        let a = buf.alloc_write_chunk(payload as u32, 0).unwrap();
        let b = buf.alloc_write_chunk(payload as u32, 0).unwrap();
        // Array exhausted; this one must come from a detached run.
        let c = buf.alloc_write_chunk(payload as u32, 0).unwrap();
        assert!(buf.detached_bytes().0 > 0);
        a.commit();
        b.commit();
        c.commit();
        for _ in 0..3 {
            let r = buf.read_chunk().unwrap();
            assert_eq!(r.payload().len(), payload);
            drop(r);
        }
        // Returned detached runs await their deadline, then the GC frees them.
        assert!(buf.detached_bytes().1 > 0);
        buf.garbage_collect(epoch_ms() + 1_000_000);
        assert_eq!(buf.detached_bytes().1, 0);
    }

    #[test]
    fn test_oversize_chunk_roundtrip() {
        let buf = buffer(16); // threshold = 8 blocks
        let payload = 4096u32; // needs 65 blocks: detached
        let mut chunk = buf.alloc_write_chunk(payload, 0).unwrap();
        chunk.payload_mut().fill(0x5A);
        chunk.commit();
        let read = buf.read_chunk().unwrap();
        assert_eq!(read.payload().len(), payload as usize);
        assert!(read.payload().iter().all(|&b| b == 0x5A));
        drop(read);
        assert_eq!(buf.metrics().oversize_allocs, 1);
    }

    #[test]
    fn test_alloc_size_invalid() {
        let buf = buffer(16);
        let too_big = buf.config().max_oversize_bytes + 1;
        assert!(matches!(
            buf.alloc_write_chunk(too_big, 0),
            Err(BufferError::AllocSizeInvalid)
        ));
        assert_eq!(buf.metrics().alloc_size_invalid, 1);
    }

    #[test]
    fn test_conservation_at_quiescence() {
        let buf = buffer(64);
        for i in 0..10u32 {
            let mut c = buf.alloc_write_chunk(40 + i, 0).unwrap();
            c.payload_mut().fill(1);
            c.commit();
        }
        while buf.read_chunk().is_ok() {}
        // The group still stages its current run; everything else is free.
        let acc = buf.block_accounting();
        assert_eq!(acc.total, 64);
        assert_eq!(acc.free + acc.staged + acc.in_flight, acc.total);
        assert_eq!(acc.in_flight, 0);
    }

    #[test]
    fn test_group_gc_returns_staged_run() {
        // Threshold 0 forces batched runs, so the group holds a staged
        // remainder after one small entry.
        let cfg = LogBufferConfig {
            high_frequency_threshold: 0,
            ..LogBufferConfig::new("gc_test", 64 * CACHE_LINE_SIZE as u32)
        };
        let buf = LogBuffer::new(cfg).unwrap();
        let c = buf.alloc_write_chunk(40, 1000).unwrap();
        c.commit();
        let before = buf.block_accounting();
        assert!(before.staged > 0);

        // Well past the TTL: the group's staged remainder returns to free.
        buf.garbage_collect(1000 + buf.config().group_gc_ttl_ms + 1);
        let after = buf.block_accounting();
        assert_eq!(after.staged, 0);
        // The committed chunk is still readable.
        let read = buf.read_chunk().unwrap();
        drop(read);
        assert_eq!(buf.block_accounting().free, 64);
    }

    #[test]
    fn test_data_traverse_is_nondestructive() {
        let buf = buffer(64);
        for i in 0..5u8 {
            let mut c = buf.alloc_write_chunk(4, 0).unwrap();
            c.payload_mut().fill(i);
            c.commit();
        }
        let mut seen = Vec::new();
        buf.data_traverse(|payload| seen.push(payload[0]));
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        // Still all readable afterwards.
        let mut count = 0;
        while buf.read_chunk().is_ok() {
            count += 1;
        }
        assert_eq!(count, 5);
    }

    #[test]
    fn test_drain_dispatches_to_sinks() {
        use crate::sink::MemorySink;
        let buf = buffer(64);
        buf.add_sink(Box::new(MemorySink::new()));
        for _ in 0..3 {
            let mut c = buf.alloc_write_chunk(16, 0).unwrap();
            c.payload_mut().fill(9);
            c.commit();
        }
        assert_eq!(buf.drain(10), 3);
        assert!(buf.force_flush(Duration::from_millis(100)));
    }

    #[test]
    fn test_snapshot_mirrors_commits() {
        let cfg = LogBufferConfig::new("snap_test", 4096).with_snapshot(1024);
        let buf = LogBuffer::new(cfg).unwrap();
        for i in 0..4u8 {
            let mut c = buf.alloc_write_chunk(8, 0).unwrap();
            c.payload_mut().fill(i);
            c.commit();
        }
        let snap = buf.take_snapshot();
        assert_eq!(snap.len(), 4);
        let last = snap.iter().last().unwrap();
        assert_eq!(last, &[3u8; 8]);
    }
}
