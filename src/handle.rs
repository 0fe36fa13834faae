//! Zero-copy chunk handles.
//!
//! `WriteChunk` is a producer's exclusive reservation: write the entry
//! into [`payload_mut`](WriteChunk::payload_mut), then [`commit`]
//! (WriteChunk::commit). Dropping an uncommitted handle marks the chunk
//! invalid so the consumer reclaims it; the entry counts as dropped.
//!
//! `ReadChunk` is the consumer's borrow of one committed entry; dropping
//! it (or [`LogBuffer::return_read_chunk`](crate::LogBuffer::return_read_chunk))
//! hands the blocks back to the buffer.

use std::sync::Arc;

use crate::block::ChunkHead;
use crate::buffer::BufferCore;
use crate::group::WriteGroup;

/// Exclusive write reservation inside the buffer.
///
/// Two live reservations never overlap: each is carved from its group's
/// private run (or a detached region), so producers copy entry bodies
/// without any lock.
pub struct WriteChunk<'a> {
    pub(crate) core: &'a BufferCore,
    pub(crate) node: u64,
    pub(crate) head: ChunkHead,
    pub(crate) group: Arc<WriteGroup>,
    pub(crate) size: u32,
    pub(crate) committed: bool,
}

impl WriteChunk<'_> {
    /// The reserved payload region, exactly the requested size.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: the chunk spans enough blocks for `size` payload bytes
        // past the head, and the reservation is exclusive until commit.
        unsafe { std::slice::from_raw_parts_mut(self.head.payload_ptr(), self.size as usize) }
    }

    /// Requested payload size in bytes.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Publishes the entry to the consumer. This is the linearization
    /// point of the write.
    pub fn commit(mut self) {
        self.committed = true;
        self.core.commit_node(self.node, self.head, &self.group);
    }
}

impl Drop for WriteChunk<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.core.abandon_node(self.node, self.head, &self.group);
        }
    }
}

/// The consumer's borrow of one committed entry.
pub struct ReadChunk<'a> {
    pub(crate) core: &'a BufferCore,
    pub(crate) node: u64,
    pub(crate) head: ChunkHead,
}

impl ReadChunk<'_> {
    /// The committed entry's bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        // SAFETY: the chunk was published with release ordering and is
        // borrowed by the single consumer until returned.
        unsafe {
            std::slice::from_raw_parts(self.head.payload_ptr(), self.head.data_size() as usize)
        }
    }

    /// Owning write group of the entry (diagnostics).
    #[inline]
    pub fn group(&self) -> u32 {
        self.head.group()
    }

    /// Per-group sequence number of the entry.
    #[inline]
    pub fn seq(&self) -> u32 {
        self.head.seq()
    }
}

impl Drop for ReadChunk<'_> {
    fn drop(&mut self) {
        self.core.reclaim_node(self.node, self.head);
    }
}
