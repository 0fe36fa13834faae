//! Block geometry and chunk-head access.
//!
//! The buffer is an array of fixed-size blocks (cache-line multiples). A
//! *chunk* is a contiguous run of blocks holding one log entry. Only the
//! first block of a chunk carries a head; the rest are payload end to end.
//!
//! Chunk-head layout (little-endian, 32 bytes):
//!
//! | off | field | |
//! |-----|-------------|----------------------------------------------|
//! | 0   | status      | atomic; the only publish/consume sync point  |
//! | 4   | block_num   | blocks in this chunk (0 = detached run)      |
//! | 8   | data_size   | payload bytes                                |
//! | 12  | group       | owning write-group id                        |
//! | 16  | seq         | per-group sequence number                    |
//! | 20  | reserved    |                                              |
//! | 24  | qnext       | atomic; committed-queue link                 |
//!
//! Payload starts at offset 32 (8-byte aligned). All non-atomic fields are
//! initialized before the status transitions to `Used` with release
//! ordering, so a consumer that observes `Used` with acquire ordering sees
//! them fully written.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Cache line size assumed by the block geometry.
pub const CACHE_LINE_SIZE: usize = 64;

/// Bytes reserved for the chunk head in the first block of a chunk.
pub const BLOCK_HEAD_SIZE: usize = 32;

/// Payload offset inside a chunk; fixed and 8-byte aligned.
pub const PAYLOAD_OFFSET: usize = BLOCK_HEAD_SIZE;

/// Block states observed through the head's atomic status word.
///
/// `FreeHead`/`FreeTail` are in-memory sub-states of `Unused` marking free
/// runs for the recovery walk; recovery treats them as unconsumed space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockStatus {
    /// Not readable: never written, or carved but not yet committed.
    Unused = 0,
    /// Fully written; the consumer may read the chunk.
    Used = 1,
    /// Skipped by the consumer without consuming payload.
    Invalid = 2,
    /// First block of a run sitting in the free list.
    FreeHead = 3,
    /// Last block of a multi-block free run (stores the run length).
    FreeTail = 4,
}

impl BlockStatus {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Unused),
            1 => Some(Self::Used),
            2 => Some(Self::Invalid),
            3 => Some(Self::FreeHead),
            4 => Some(Self::FreeTail),
            _ => None,
        }
    }
}

const OFF_STATUS: usize = 0;
const OFF_BLOCK_NUM: usize = 4;
const OFF_DATA_SIZE: usize = 8;
const OFF_GROUP: usize = 12;
const OFF_SEQ: usize = 16;
const OFF_QNEXT: usize = 24;

// Free-run list links live in the dead payload area of a free run's head
// block. They are only meaningful while the run is in the free list.
const OFF_FREE_NEXT: usize = PAYLOAD_OFFSET;
const OFF_FREE_PREV: usize = PAYLOAD_OFFSET + 4;

/// Raw view of a chunk head, in the block array or in a detached run.
///
/// All accessors are `unsafe`-free at the call site; the type itself is the
/// unsafe boundary. Callers guarantee the pointer addresses at least
/// [`BLOCK_HEAD_SIZE`] valid bytes, 64-byte aligned.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChunkHead {
    ptr: *mut u8,
}

unsafe impl Send for ChunkHead {}
unsafe impl Sync for ChunkHead {}

impl ChunkHead {
    #[inline]
    pub(crate) fn from_ptr(ptr: *mut u8) -> Self {
        debug_assert!(!ptr.is_null());
        debug_assert_eq!(ptr as usize % 8, 0);
        Self { ptr }
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub(crate) fn status(&self) -> &AtomicU32 {
        // SAFETY: offset 0 is in bounds and 4-aligned; atomics provide the
        // cross-thread synchronization for this field.
        unsafe { &*self.ptr.add(OFF_STATUS).cast::<AtomicU32>() }
    }

    #[inline]
    pub(crate) fn load_status(&self, order: Ordering) -> Option<BlockStatus> {
        BlockStatus::from_raw(self.status().load(order))
    }

    #[inline]
    pub(crate) fn store_status(&self, status: BlockStatus, order: Ordering) {
        self.status().store(status as u32, order);
    }

    #[inline]
    pub(crate) fn qnext(&self) -> &AtomicU64 {
        // SAFETY: offset 24 is in bounds and 8-aligned.
        unsafe { &*self.ptr.add(OFF_QNEXT).cast::<AtomicU64>() }
    }

    #[inline]
    fn read_u32(&self, off: usize) -> u32 {
        // SAFETY: all field offsets are within the head and 4-aligned.
        unsafe { self.ptr.add(off).cast::<u32>().read() }
    }

    #[inline]
    fn write_u32(&self, off: usize, v: u32) {
        // SAFETY: as in read_u32; single-writer protocol per field.
        unsafe { self.ptr.add(off).cast::<u32>().write(v) }
    }

    #[inline]
    pub(crate) fn block_num(&self) -> u32 {
        self.read_u32(OFF_BLOCK_NUM)
    }

    #[inline]
    pub(crate) fn set_block_num(&self, v: u32) {
        self.write_u32(OFF_BLOCK_NUM, v);
    }

    #[inline]
    pub(crate) fn data_size(&self) -> u32 {
        self.read_u32(OFF_DATA_SIZE)
    }

    #[inline]
    pub(crate) fn set_data_size(&self, v: u32) {
        self.write_u32(OFF_DATA_SIZE, v);
    }

    #[inline]
    pub(crate) fn group(&self) -> u32 {
        self.read_u32(OFF_GROUP)
    }

    #[inline]
    pub(crate) fn set_group(&self, v: u32) {
        self.write_u32(OFF_GROUP, v);
    }

    #[inline]
    pub(crate) fn seq(&self) -> u32 {
        self.read_u32(OFF_SEQ)
    }

    #[inline]
    pub(crate) fn set_seq(&self, v: u32) {
        self.write_u32(OFF_SEQ, v);
    }

    #[inline]
    pub(crate) fn free_next(&self) -> u32 {
        self.read_u32(OFF_FREE_NEXT)
    }

    #[inline]
    pub(crate) fn set_free_next(&self, v: u32) {
        self.write_u32(OFF_FREE_NEXT, v);
    }

    #[inline]
    pub(crate) fn free_prev(&self) -> u32 {
        self.read_u32(OFF_FREE_PREV)
    }

    #[inline]
    pub(crate) fn set_free_prev(&self, v: u32) {
        self.write_u32(OFF_FREE_PREV, v);
    }

    #[inline]
    pub(crate) fn payload_ptr(&self) -> *mut u8 {
        // SAFETY: payload begins immediately after the head.
        unsafe { self.ptr.add(PAYLOAD_OFFSET) }
    }
}

/// The buffer's block array: raw accessors over a mapped (or anonymous)
/// region owned by the backing store, which outlives every user.
#[derive(Debug)]
pub(crate) struct BlockArray {
    base: *mut u8,
    block_size: u32,
    block_shift: u32,
    total_blocks: u32,
}

unsafe impl Send for BlockArray {}
unsafe impl Sync for BlockArray {}

impl BlockArray {
    /// # Safety
    ///
    /// `base` must point to `total_blocks * block_size` valid bytes,
    /// 64-byte aligned, that stay valid for the array's lifetime.
    pub(crate) unsafe fn new(base: *mut u8, block_size: u32, total_blocks: u32) -> Self {
        debug_assert!(block_size.is_power_of_two());
        debug_assert!(block_size as usize >= CACHE_LINE_SIZE);
        debug_assert_eq!(base as usize % CACHE_LINE_SIZE, 0);
        Self {
            base,
            block_size,
            block_shift: block_size.trailing_zeros(),
            total_blocks,
        }
    }

    #[inline]
    pub(crate) fn block_size(&self) -> u32 {
        self.block_size
    }

    #[inline]
    pub(crate) fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Head view of the block at `idx`.
    #[inline]
    pub(crate) fn head(&self, idx: u32) -> ChunkHead {
        debug_assert!(idx < self.total_blocks);
        // SAFETY: idx is in bounds, so the head bytes are inside the array.
        unsafe { ChunkHead::from_ptr(self.base.add((idx as usize) << self.block_shift)) }
    }

    /// Block index owning `ptr`, which must point into the array.
    #[inline]
    pub(crate) fn index_of(&self, ptr: *const u8) -> u32 {
        let off = ptr as usize - self.base as usize;
        debug_assert!(off < (self.total_blocks as usize) << self.block_shift);
        (off >> self.block_shift) as u32
    }

    /// Whether `ptr` points inside the array.
    #[inline]
    pub(crate) fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.base as usize;
        addr >= base && addr < base + ((self.total_blocks as usize) << self.block_shift)
    }

    /// Payload capacity of a chunk spanning `blocks` blocks.
    #[inline]
    pub(crate) fn chunk_capacity(&self, blocks: u32) -> u32 {
        blocks * self.block_size - BLOCK_HEAD_SIZE as u32
    }

    /// Blocks needed for `payload` bytes plus the chunk head.
    #[inline]
    pub(crate) fn blocks_needed(&self, payload: u32) -> u32 {
        let total = payload as u64 + BLOCK_HEAD_SIZE as u64;
        ((total + u64::from(self.block_size) - 1) >> self.block_shift) as u32
    }
}
