//! logring: a high-throughput MPSC log buffer.
//!
//! Multiple producer threads reserve exclusive chunks in a shared block
//! array, serialize one log entry each (head, format string, tagged
//! argument stream), and commit; a single consumer drains committed
//! entries in commit order and hands their bytes to sinks. Optionally the
//! whole buffer is backed by a memory-mapped file, so entries that were
//! committed but never consumed survive an abrupt process kill and are
//! replayed on the next start.
//!
//! # Key pieces
//!
//! - Per-thread write groups reserve block *runs* from a spinlocked free
//!   list, so the hot path is wait-free-ish: carve, write, release-store.
//! - Oversize entries go to detached heap runs with deadline-based
//!   release, keeping rare multi-megabyte entries out of the array.
//! - A bounded snapshot ring mirrors commits for on-demand retrospective
//!   dumps.
//! - An optional console fan-out queues formatted messages to callbacks.
//!
//! # Example
//!
//! ```
//! use logring::{epoch_ms, Arg, LogBuffer, LogBufferConfig};
//!
//! let buffer = LogBuffer::new(LogBufferConfig::new("example", 64 * 1024)).unwrap();
//!
//! // Producer: reserve, encode, commit.
//! let fmt = "answer: {}";
//! let args = [Arg::I32(42)];
//! let size = logring::entry_size(fmt.len(), logring::args_size(&args));
//! let mut chunk = buffer.alloc_write_chunk(size as u32, epoch_ms()).unwrap();
//! {
//!     let payload = chunk.payload_mut();
//!     logring::write_head(
//!         payload,
//!         &logring::EntryHead {
//!             category: 0,
//!             level: logring::Level::Info,
//!             fmt_kind: logring::FmtKind::Utf8,
//!             thread_id: 1,
//!             timestamp_ms: epoch_ms(),
//!             fmt_len: fmt.len() as u32,
//!         },
//!     );
//!     payload[32..32 + fmt.len()].copy_from_slice(fmt.as_bytes());
//!     logring::encode_args(&mut payload[32 + round4(fmt.len())..], &args);
//! }
//! chunk.commit();
//!
//! // Consumer: read, decode, return.
//! let read = buffer.read_chunk().unwrap();
//! let head = logring::parse_head(read.payload()).unwrap();
//! assert_eq!(head.category, 0);
//! # fn round4(n: usize) -> usize { (n + 3) & !3 }
//! ```

mod backoff;
mod block;
mod buffer;
mod config;
mod console;
mod encoder;
mod entry;
mod error;
mod freelist;
mod group;
mod handle;
mod invariants;
mod metrics;
mod mmap;
mod oversize;
mod queue;
mod registry;
mod sink;
mod snapshot;
mod sync;
mod utf;

pub use backoff::Backoff;
pub use buffer::{epoch_ms, BlockAccounting, LogBuffer};
pub use config::{LogBufferConfig, OverflowPolicy};
pub use console::{ConsoleBuffer, ConsoleEntry};
pub use encoder::{
    args_size, copy_with_hash, decode_args, encode_args, hash_only, Arg, ArgReader, ArgValue,
    ArgWriter, DecodeError, TypeTag,
};
pub use entry::{
    arg_bytes, entry_size, format_bytes, parse_head, write_head, EntryHead, FmtKind, Level,
    ENTRY_HEAD_SIZE,
};
pub use error::{BufferError, Result};
pub use handle::{ReadChunk, WriteChunk};
pub use metrics::{Metrics, MetricsSnapshot};
pub use registry::{create_log, force_flush_all_logs, get_log, release_log};
pub use sink::{MemorySink, Sink};
pub use snapshot::{Snapshot, SnapshotRing};
pub use utf::{
    decode_mixed, encode_mixed, mixed_len, utf16_to_utf8, utf16_to_utf8_lossy, utf8_to_utf16,
    verify_mixed_roundtrip,
};
