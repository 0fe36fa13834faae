//! Memory-map backing and crash recovery.
//!
//! When recovery is enabled the buffer's header page and block array live
//! in a shared file mapping, so the OS persists whatever a killed process
//! left behind. On reopen, a checksum-validated header admits the image to
//! a whole-array walk that recovers committed-but-unconsumed chunks; any
//! mismatch or inconsistency wipes the image and starts fresh; recovery
//! failure is never an error.
//!
//! Unsupported platforms or I/O failures fall back silently to an
//! anonymous mapping, turning recovery into a no-op.
//!
//! Persistence is best effort: nothing is flushed synchronously, the
//! mapping simply survives process death in the page cache. Power loss can
//! tear it, which is exactly what the validation pass is for.

use std::fs::{self, OpenOptions};
use std::sync::atomic::Ordering;

use memmap2::MmapMut;

use crate::block::{BlockArray, BlockStatus, BLOCK_HEAD_SIZE};
use crate::config::LogBufferConfig;

/// One page; the header never outgrows it.
pub(crate) const HEADER_BYTES: usize = 4096;

/// Fixed capacity of the persistent group table.
pub(crate) const MAX_GROUPS: usize = 64;

pub(crate) const MAGIC: u64 = 0x4c4f_4752_494e_4731; // "LOGRING1"
pub(crate) const FORMAT_VERSION: u32 = 1;

pub(crate) const SLOT_NONE: u32 = u32::MAX;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_BLOCK_SIZE: usize = 12;
const OFF_TOTAL_BLOCKS: usize = 16;
const OFF_CHECKSUM: usize = 24;
const OFF_SLOTS: usize = 32;
const SLOT_BYTES: usize = 20;

/// Checksum over the configured geometry and category-name table. A
/// mismatch on reopen means the file was written by a different
/// configuration and must be treated as fresh.
pub(crate) fn geometry_checksum(config: &LogBufferConfig) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&config.block_size.to_le_bytes());
    hasher.update(&config.total_blocks().to_le_bytes());
    hasher.update(&(config.categories.len() as u32).to_le_bytes());
    for name in &config.categories {
        hasher.update(&(name.len() as u32).to_le_bytes());
        hasher.update(name.as_bytes());
    }
    u64::from(hasher.finalize())
}

/// Raw view of the persistent header page.
#[derive(Clone, Copy)]
pub(crate) struct HeaderRef {
    ptr: *mut u8,
}

unsafe impl Send for HeaderRef {}
unsafe impl Sync for HeaderRef {}

impl HeaderRef {
    fn from_ptr(ptr: *mut u8) -> Self {
        Self { ptr }
    }

    #[inline]
    fn read_u64(&self, off: usize) -> u64 {
        // SAFETY: all offsets are inside the header page; 8-byte fields are
        // 8-aligned within a page-aligned mapping.
        unsafe { self.ptr.add(off).cast::<u64>().read() }
    }

    #[inline]
    fn write_u64(&self, off: usize, v: u64) {
        // SAFETY: as in read_u64.
        unsafe { self.ptr.add(off).cast::<u64>().write(v) }
    }

    #[inline]
    fn read_u32(&self, off: usize) -> u32 {
        // SAFETY: as in read_u64; 4-aligned offsets.
        unsafe { self.ptr.add(off).cast::<u32>().read() }
    }

    #[inline]
    fn write_u32(&self, off: usize, v: u32) {
        // SAFETY: as in read_u64.
        unsafe { self.ptr.add(off).cast::<u32>().write(v) }
    }

    pub(crate) fn magic(&self) -> u64 {
        self.read_u64(OFF_MAGIC)
    }

    pub(crate) fn version(&self) -> u32 {
        self.read_u32(OFF_VERSION)
    }

    pub(crate) fn block_size(&self) -> u32 {
        self.read_u32(OFF_BLOCK_SIZE)
    }

    pub(crate) fn total_blocks(&self) -> u32 {
        self.read_u32(OFF_TOTAL_BLOCKS)
    }

    pub(crate) fn checksum(&self) -> u64 {
        self.read_u64(OFF_CHECKSUM)
    }

    /// Writes the identity fields and clears the group table.
    pub(crate) fn initialize(&self, config: &LogBufferConfig) {
        self.write_u64(OFF_MAGIC, MAGIC);
        self.write_u32(OFF_VERSION, FORMAT_VERSION);
        self.write_u32(OFF_BLOCK_SIZE, config.block_size);
        self.write_u32(OFF_TOTAL_BLOCKS, config.total_blocks());
        self.write_u64(OFF_CHECKSUM, geometry_checksum(config));
        for i in 0..MAX_GROUPS {
            self.slot(i).clear();
        }
    }

    /// Whether the stored identity matches `config`.
    pub(crate) fn matches(&self, config: &LogBufferConfig) -> bool {
        self.magic() == MAGIC
            && self.version() == FORMAT_VERSION
            && self.block_size() == config.block_size
            && self.total_blocks() == config.total_blocks()
            && self.checksum() == geometry_checksum(config)
    }

    pub(crate) fn slot(&self, i: usize) -> SlotRef {
        debug_assert!(i < MAX_GROUPS);
        SlotRef {
            // SAFETY: slot i lies inside the header page.
            ptr: unsafe { self.ptr.add(OFF_SLOTS + i * SLOT_BYTES) },
        }
    }
}

/// One persistent group-table slot: `{group_id, next_seq, consumed_seq,
/// run_start, run_len}`. `group_id == SLOT_NONE` marks a vacant slot;
/// `run_start == SLOT_NONE` a live group with no staged run.
#[derive(Clone, Copy)]
pub(crate) struct SlotRef {
    ptr: *mut u8,
}

unsafe impl Send for SlotRef {}
unsafe impl Sync for SlotRef {}

macro_rules! slot_field {
    ($get:ident, $set:ident, $off:expr) => {
        #[inline]
        pub(crate) fn $get(&self) -> u32 {
            // SAFETY: the field lies inside the slot's 20 bytes.
            unsafe { self.ptr.add($off).cast::<u32>().read() }
        }

        #[inline]
        pub(crate) fn $set(&self, v: u32) {
            // SAFETY: as in the getter.
            unsafe { self.ptr.add($off).cast::<u32>().write(v) }
        }
    };
}

impl SlotRef {
    slot_field!(group_id, set_group_id, 0);
    slot_field!(next_seq, set_next_seq, 4);
    slot_field!(consumed_seq, set_consumed_seq, 8);
    slot_field!(run_start, set_run_start, 12);
    slot_field!(run_len, set_run_len, 16);

    pub(crate) fn clear(&self) {
        self.set_group_id(SLOT_NONE);
        self.set_next_seq(0);
        self.set_consumed_seq(0);
        self.set_run_start(SLOT_NONE);
        self.set_run_len(0);
    }

    pub(crate) fn is_vacant(&self) -> bool {
        self.group_id() == SLOT_NONE
    }
}

/// Owner of the mapped region (file-backed or anonymous).
pub(crate) struct BackingStore {
    map: MmapMut,
    file_backed: bool,
    recovery_candidate: bool,
}

impl BackingStore {
    /// Opens the backing for `config`.
    ///
    /// With `need_recovery` set this creates (or reopens) the mapping file
    /// under the configured base directory; any failure along the way falls
    /// back to anonymous memory without reporting an error. Only an
    /// anonymous-mapping failure (address-space exhaustion) is fatal to
    /// construction, reported as `NotInitialized`.
    pub(crate) fn open(config: &LogBufferConfig) -> crate::error::Result<Self> {
        let map_len = Self::map_len(config);
        if config.need_recovery {
            if let Some(store) = Self::open_file(config, map_len) {
                return Ok(store);
            }
        }
        Self::open_anon(config, map_len)
    }

    fn map_len(config: &LogBufferConfig) -> usize {
        let raw = HEADER_BYTES + config.default_buffer_size as usize;
        (raw + 4095) & !4095
    }

    fn open_anon(config: &LogBufferConfig, map_len: usize) -> crate::error::Result<Self> {
        let map =
            MmapMut::map_anon(map_len).map_err(|_| crate::error::BufferError::NotInitialized)?;
        let store = Self {
            map,
            file_backed: false,
            recovery_candidate: false,
        };
        store.header().initialize(config);
        Ok(store)
    }

    fn open_file(config: &LogBufferConfig, map_len: usize) -> Option<Self> {
        let path = config.mmap_path();
        fs::create_dir_all(path.parent()?).ok()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .ok()?;
        let existing = file.metadata().ok()?.len() == map_len as u64;
        if !existing {
            file.set_len(map_len as u64).ok()?;
        }
        // SAFETY: the fd stays open for the mapping's lifetime; the file is
        // private to this log name by path construction.
        let map = unsafe { MmapMut::map_mut(&file).ok()? };
        let store = Self {
            map,
            file_backed: true,
            recovery_candidate: false,
        };
        if existing && store.header().matches(config) {
            return Some(Self {
                recovery_candidate: true,
                ..store
            });
        }
        store.header().initialize(config);
        Some(store)
    }

    pub(crate) fn header(&self) -> HeaderRef {
        HeaderRef::from_ptr(self.map.as_ptr().cast_mut())
    }

    /// Block array over the mapped region past the header page.
    pub(crate) fn block_array(&self, config: &LogBufferConfig) -> BlockArray {
        // SAFETY: the mapping holds HEADER_BYTES + buffer_size valid bytes
        // and outlives the array (both owned by the buffer core); page
        // alignment implies cache-line alignment.
        unsafe {
            BlockArray::new(
                self.map.as_ptr().cast_mut().add(HEADER_BYTES),
                config.block_size,
                config.total_blocks(),
            )
        }
    }

    /// Whether an existing, checksum-matching image was found.
    pub(crate) fn recovery_candidate(&self) -> bool {
        self.recovery_candidate
    }

    pub(crate) fn file_backed(&self) -> bool {
        self.file_backed
    }

    /// Best-effort flush of dirty pages; errors are ignored.
    pub(crate) fn flush(&self) {
        if self.file_backed {
            let _ = self.map.flush();
        }
    }
}

/// A committed chunk found by the recovery walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecoveredChunk {
    pub start: u32,
    pub blocks: u32,
    pub group: u32,
    pub seq: u32,
}

/// Outcome of a successful recovery walk.
#[derive(Debug, Default)]
pub(crate) struct ScanResult {
    pub chunks: Vec<RecoveredChunk>,
    pub free_runs: Vec<(u32, u32)>,
}

/// Whole-array recovery walk.
///
/// The array tiles into partitions: free runs (stamped heads), committed
/// or invalid chunks, and the staged runs recorded in the group table. The
/// walk classifies each partition from block 0 upward; a staged run's
/// carved prefix is admitted only while its chunks carry the owning group
/// and consecutive sequence numbers, which rejects stale images at the
/// carve frontier. Any bounds or tiling inconsistency returns `None` and
/// the caller reinitializes.
pub(crate) fn scan_block_array(arr: &BlockArray, header: HeaderRef) -> Option<ScanResult> {
    let total = arr.total_blocks();
    let block_size = arr.block_size();

    // Staged runs by start block.
    let mut staged: Vec<(u32, u32, u32, u32)> = Vec::new(); // (start, len, gid, seq_base)
    for i in 0..MAX_GROUPS {
        let slot = header.slot(i);
        if slot.is_vacant() || slot.run_start() == SLOT_NONE {
            continue;
        }
        let (start, len) = (slot.run_start(), slot.run_len());
        if len == 0 || start >= total || total - start < len {
            return None;
        }
        staged.push((start, len, slot.group_id(), slot.next_seq()));
    }

    let chunk_fits = |pos: u32, n: u32, limit: u32| n > 0 && pos < limit && limit - pos >= n;
    let payload_fits = |n: u32, data_size: u32| {
        u64::from(data_size) + BLOCK_HEAD_SIZE as u64 <= u64::from(n) * u64::from(block_size)
    };

    let mut out = ScanResult::default();
    let mut p = 0u32;
    while p < total {
        if let Some(&(start, len, gid, seq_base)) =
            staged.iter().find(|&&(start, _, _, _)| start == p)
        {
            // Carved prefix of a staged run.
            let end = start + len;
            let mut q = start;
            let mut expect = seq_base;
            while q < end {
                let head = arr.head(q);
                match head.load_status(Ordering::Relaxed) {
                    Some(BlockStatus::Used) => {
                        let n = head.block_num();
                        if !chunk_fits(q, n, end)
                            || !payload_fits(n, head.data_size())
                            || head.group() != gid
                            || head.seq() != expect
                        {
                            break;
                        }
                        out.chunks.push(RecoveredChunk {
                            start: q,
                            blocks: n,
                            group: gid,
                            seq: expect,
                        });
                        expect = expect.wrapping_add(1);
                        q += n;
                    }
                    Some(BlockStatus::Invalid) => {
                        let n = head.block_num();
                        if !chunk_fits(q, n, end) {
                            break;
                        }
                        out.free_runs.push((q, n));
                        q += n;
                    }
                    _ => break,
                }
            }
            // Everything past the carve frontier is reclaimable.
            if q < end {
                out.free_runs.push((q, end - q));
            }
            p = end;
            continue;
        }

        let head = arr.head(p);
        match head.load_status(Ordering::Relaxed) {
            Some(BlockStatus::FreeHead) => {
                let n = head.block_num();
                if !chunk_fits(p, n, total) {
                    return None;
                }
                out.free_runs.push((p, n));
                p += n;
            }
            Some(BlockStatus::Used) => {
                let n = head.block_num();
                if !chunk_fits(p, n, total) || !payload_fits(n, head.data_size()) {
                    return None;
                }
                out.chunks.push(RecoveredChunk {
                    start: p,
                    blocks: n,
                    group: head.group(),
                    seq: head.seq(),
                });
                p += n;
            }
            Some(BlockStatus::Invalid) => {
                let n = head.block_num();
                if !chunk_fits(p, n, total) {
                    return None;
                }
                out.free_runs.push((p, n));
                p += n;
            }
            _ => return None,
        }
    }
    debug_assert_eq!(p, total);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CACHE_LINE_SIZE;

    fn test_config() -> LogBufferConfig {
        LogBufferConfig::new("mmap_test", 16 * CACHE_LINE_SIZE as u32).validate()
    }

    #[test]
    fn test_anon_backing_initializes_header() {
        let cfg = test_config();
        let store = BackingStore::open(&cfg).unwrap();
        assert!(!store.file_backed());
        assert!(!store.recovery_candidate());
        let h = store.header();
        assert_eq!(h.magic(), MAGIC);
        assert_eq!(h.version(), FORMAT_VERSION);
        assert_eq!(h.total_blocks(), 16);
        assert!(h.matches(&cfg));
        assert!(h.slot(0).is_vacant());
    }

    #[test]
    fn test_checksum_covers_categories() {
        let a = test_config();
        let mut b = test_config();
        b.categories = vec![String::from("net"), String::from("gfx")];
        assert_ne!(geometry_checksum(&a), geometry_checksum(&b));
    }

    #[test]
    fn test_file_backing_fresh_then_existing() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config().with_recovery(dir.path());
        cfg.log_name = String::from("reopen");

        let store = BackingStore::open(&cfg).unwrap();
        assert!(store.file_backed());
        assert!(!store.recovery_candidate());
        drop(store);

        let store2 = BackingStore::open(&cfg).unwrap();
        assert!(store2.file_backed());
        assert!(store2.recovery_candidate());
    }

    #[test]
    fn test_checksum_mismatch_reinitializes() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config().with_recovery(dir.path());
        cfg.log_name = String::from("wipe");
        drop(BackingStore::open(&cfg).unwrap());

        // Same file, different category table: must be treated as fresh.
        let cfg2 = cfg.clone().with_categories(vec![String::from("other")]);
        let store = BackingStore::open(&cfg2).unwrap();
        assert!(!store.recovery_candidate());
        assert!(store.header().matches(&cfg2));
    }

    #[test]
    fn test_scan_fresh_free_image() {
        let cfg = test_config();
        let store = BackingStore::open(&cfg).unwrap();
        let arr = store.block_array(&cfg);
        // Stamp the whole array as one free run, as buffer init does.
        let head = arr.head(0);
        head.set_block_num(16);
        head.store_status(BlockStatus::FreeHead, Ordering::Relaxed);
        let tail = arr.head(15);
        tail.set_block_num(16);
        tail.store_status(BlockStatus::FreeTail, Ordering::Relaxed);

        let scan = scan_block_array(&arr, store.header()).unwrap();
        assert!(scan.chunks.is_empty());
        assert_eq!(scan.free_runs, vec![(0, 16)]);
    }

    #[test]
    fn test_scan_mixed_partitions() {
        let cfg = test_config();
        let store = BackingStore::open(&cfg).unwrap();
        let arr = store.block_array(&cfg);

        // [0,2) committed chunk, [2,6) free, [6,16) staged run of group 3
        // with one carved+committed chunk of 2 blocks (seq 7).
        let c = arr.head(0);
        c.set_block_num(2);
        c.set_data_size(40);
        c.set_group(1);
        c.set_seq(0);
        c.store_status(BlockStatus::Used, Ordering::Relaxed);

        let f = arr.head(2);
        f.set_block_num(4);
        f.store_status(BlockStatus::FreeHead, Ordering::Relaxed);

        let slot = store.header().slot(0);
        slot.set_group_id(3);
        slot.set_next_seq(7);
        slot.set_run_start(6);
        slot.set_run_len(10);

        let s = arr.head(6);
        s.set_block_num(2);
        s.set_data_size(50);
        s.set_group(3);
        s.set_seq(7);
        s.store_status(BlockStatus::Used, Ordering::Relaxed);
        // Carve frontier at 8: leave unused.
        arr.head(8).store_status(BlockStatus::Unused, Ordering::Relaxed);

        let scan = scan_block_array(&arr, store.header()).unwrap();
        assert_eq!(
            scan.chunks,
            vec![
                RecoveredChunk { start: 0, blocks: 2, group: 1, seq: 0 },
                RecoveredChunk { start: 6, blocks: 2, group: 3, seq: 7 },
            ]
        );
        assert_eq!(scan.free_runs, vec![(2, 4), (8, 8)]);
    }

    #[test]
    fn test_scan_rejects_stale_frontier_seq() {
        let cfg = test_config();
        let store = BackingStore::open(&cfg).unwrap();
        let arr = store.block_array(&cfg);

        let slot = store.header().slot(0);
        slot.set_group_id(3);
        slot.set_next_seq(7);
        slot.set_run_start(0);
        slot.set_run_len(16);

        // A stale image at the carve frontier: right group, wrong seq.
        let s = arr.head(0);
        s.set_block_num(2);
        s.set_data_size(10);
        s.set_group(3);
        s.set_seq(99);
        s.store_status(BlockStatus::Used, Ordering::Relaxed);

        let scan = scan_block_array(&arr, store.header()).unwrap();
        assert!(scan.chunks.is_empty());
        assert_eq!(scan.free_runs, vec![(0, 16)]);
    }

    #[test]
    fn test_scan_inconsistent_image_fails() {
        let cfg = test_config();
        let store = BackingStore::open(&cfg).unwrap();
        let arr = store.block_array(&cfg);
        // Garbage at block 0: neither free, used, invalid, nor staged.
        arr.head(0).status().store(17, Ordering::Relaxed);
        assert!(scan_block_array(&arr, store.header()).is_none());
    }
}
