//! Intrusive lock-free MPSC queue of committed chunks.
//!
//! Producers push at commit time; the single consumer pops in push order,
//! which is the commit linearization order the read side promises. Links
//! are threaded through the chunk heads' `qnext` field, so the queue
//! allocates nothing.
//!
//! Node encoding (u64): an in-array chunk is `block_index << 1`; a
//! detached oversize chunk is its 64-aligned pointer with bit 0 set;
//! `u64::MAX` is the null link.
//!
//! Protocol (Vyukov-style intrusive MPSC):
//! - push: clear the node's link, swap the tail to the node (AcqRel, the
//!   linearization point), then either link the predecessor to the node or,
//!   when the queue was empty, publish the node as head.
//! - pop: read head; follow the link. A popped last node retires the tail
//!   by CAS; a failed CAS means a producer is mid-push and the link will
//!   appear momentarily.
//!
//! The consumer can observe a transient gap (tail swapped, link not yet
//! stored). Pops spin briefly and then report the gap as `Retry`; nothing
//! is lost, the next pop sees the link.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::block::{BlockArray, ChunkHead};

pub(crate) const NONE_NODE: u64 = u64::MAX;

/// Encodes an in-array chunk by block index.
#[inline]
pub(crate) fn encode_index(idx: u32) -> u64 {
    u64::from(idx) << 1
}

/// Encodes a detached chunk by its (64-aligned) head pointer.
#[inline]
pub(crate) fn encode_detached(ptr: *mut u8) -> u64 {
    debug_assert_eq!(ptr as usize % 64, 0);
    ptr as u64 | 1
}

/// Whether a node refers to a detached run.
#[inline]
pub(crate) fn is_detached(node: u64) -> bool {
    debug_assert_ne!(node, NONE_NODE);
    node & 1 == 1
}

/// Resolves a node to its chunk head.
#[inline]
pub(crate) fn resolve(node: u64, arr: &BlockArray) -> ChunkHead {
    if is_detached(node) {
        ChunkHead::from_ptr((node & !1) as *mut u8)
    } else {
        arr.head((node >> 1) as u32)
    }
}

/// Result of a pop attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pop {
    Node(u64),
    Empty,
    /// A producer is mid-push; retry shortly.
    Retry,
}

pub(crate) struct CommitQueue {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
}

impl CommitQueue {
    const LINK_SPIN: u32 = 128;

    pub(crate) fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicU64::new(NONE_NODE)),
            tail: CachePadded::new(AtomicU64::new(NONE_NODE)),
        }
    }

    /// Publishes a committed chunk. Callable from any producer thread.
    pub(crate) fn push(&self, node: u64, arr: &BlockArray) {
        debug_assert_ne!(node, NONE_NODE);
        let chunk = resolve(node, arr);
        chunk.qnext().store(NONE_NODE, Ordering::Relaxed);

        let prev = self.tail.swap(node, Ordering::AcqRel);
        if prev == NONE_NODE {
            self.head.store(node, Ordering::Release);
        } else {
            resolve(prev, arr).qnext().store(node, Ordering::Release);
        }
    }

    /// Pops the oldest committed chunk. Single-consumer only.
    pub(crate) fn pop(&self, arr: &BlockArray) -> Pop {
        let mut h = self.head.load(Ordering::Acquire);
        if h == NONE_NODE {
            if self.tail.load(Ordering::Acquire) == NONE_NODE {
                return Pop::Empty;
            }
            // First push mid-flight: the head store follows the tail swap.
            for _ in 0..Self::LINK_SPIN {
                std::hint::spin_loop();
                h = self.head.load(Ordering::Acquire);
                if h != NONE_NODE {
                    break;
                }
            }
            if h == NONE_NODE {
                return Pop::Retry;
            }
        }

        let chunk = resolve(h, arr);
        let next = chunk.qnext().load(Ordering::Acquire);
        if next != NONE_NODE {
            self.head.store(next, Ordering::Relaxed);
            return Pop::Node(h);
        }

        // h looks like the last node. Retire the tail; publish the empty
        // head before the CAS so a racing first-push cannot be overwritten.
        self.head.store(NONE_NODE, Ordering::Relaxed);
        if self
            .tail
            .compare_exchange(h, NONE_NODE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Pop::Node(h);
        }

        // A producer swapped the tail and is about to link h → node.
        for _ in 0..Self::LINK_SPIN {
            let next = chunk.qnext().load(Ordering::Acquire);
            if next != NONE_NODE {
                self.head.store(next, Ordering::Relaxed);
                return Pop::Node(h);
            }
            std::hint::spin_loop();
        }
        // Link still not visible; restore the head and let the caller retry.
        self.head.store(h, Ordering::Relaxed);
        Pop::Retry
    }

    /// Whether the queue has no published chunks.
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == NONE_NODE
            && self.tail.load(Ordering::Acquire) == NONE_NODE
    }

    /// Non-destructive walk of the published chunks, oldest first.
    ///
    /// Consumer-thread only (it must not race `pop`). Concurrent pushes may
    /// or may not be observed; the walk stops at the first missing link.
    pub(crate) fn traverse(&self, arr: &BlockArray, mut f: impl FnMut(u64, ChunkHead)) {
        let mut node = self.head.load(Ordering::Acquire);
        while node != NONE_NODE {
            let chunk = resolve(node, arr);
            f(node, chunk);
            node = chunk.qnext().load(Ordering::Acquire);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CACHE_LINE_SIZE;
    use std::sync::Arc;
    use std::thread;

    struct TestArena {
        _mem: Vec<u8>,
        arr: BlockArray,
    }

    unsafe impl Send for TestArena {}
    unsafe impl Sync for TestArena {}

    fn arena(blocks: u32) -> TestArena {
        let mut mem = vec![0u8; (blocks as usize + 1) * CACHE_LINE_SIZE];
        let base = mem.as_mut_ptr();
        let aligned = ((base as usize + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)) as *mut u8;
        let arr = unsafe { BlockArray::new(aligned, CACHE_LINE_SIZE as u32, blocks) };
        TestArena { _mem: mem, arr }
    }

    #[test]
    fn test_fifo_single_thread() {
        let a = arena(8);
        let q = CommitQueue::new();
        assert_eq!(q.pop(&a.arr), Pop::Empty);

        for i in 0..8u32 {
            q.push(encode_index(i), &a.arr);
        }
        for i in 0..8u32 {
            match q.pop(&a.arr) {
                Pop::Node(n) => assert_eq!(n, encode_index(i)),
                other => panic!("expected node, got {other:?}"),
            }
        }
        assert_eq!(q.pop(&a.arr), Pop::Empty);
        assert!(q.is_empty());
    }

    #[test]
    fn test_traverse_preserves_queue() {
        let a = arena(4);
        let q = CommitQueue::new();
        for i in 0..4u32 {
            q.push(encode_index(i), &a.arr);
        }
        let mut seen = vec![];
        q.traverse(&a.arr, |n, _| seen.push(n));
        assert_eq!(seen, (0..4).map(encode_index).collect::<Vec<_>>());
        // Still all poppable.
        for i in 0..4u32 {
            assert_eq!(q.pop(&a.arr), Pop::Node(encode_index(i)));
        }
    }

    #[test]
    fn test_multi_producer_drain() {
        const PRODUCERS: u32 = 4;
        const PER: u32 = 64;
        let a = Arc::new(arena(PRODUCERS * PER));
        let q = Arc::new(CommitQueue::new());

        let mut handles = vec![];
        for p in 0..PRODUCERS {
            let a = Arc::clone(&a);
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || {
                for i in 0..PER {
                    q.push(encode_index(p * PER + i), &a.arr);
                }
            }));
        }

        let mut seen = vec![false; (PRODUCERS * PER) as usize];
        let mut count = 0;
        while count < PRODUCERS * PER {
            match q.pop(&a.arr) {
                Pop::Node(n) => {
                    let idx = (n >> 1) as usize;
                    assert!(!seen[idx], "duplicate node {idx}");
                    seen[idx] = true;
                    count += 1;
                }
                Pop::Empty | Pop::Retry => std::hint::spin_loop(),
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(seen.iter().all(|&s| s));
        assert_eq!(q.pop(&a.arr), Pop::Empty);
    }

    #[test]
    fn test_detached_node_encoding() {
        let mem = vec![0u8; 128];
        let ptr = ((mem.as_ptr() as usize + 63) & !63) as *mut u8;
        let node = encode_detached(ptr);
        assert!(is_detached(node));
        assert!(!is_detached(encode_index(5)));
        assert_eq!((node & !1) as *mut u8, ptr);
    }
}
