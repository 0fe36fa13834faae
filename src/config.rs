//! Configuration for the log buffer.

use std::path::PathBuf;

use crate::block::{BLOCK_HEAD_SIZE, CACHE_LINE_SIZE};

/// Behavior when the buffer is saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Sustained pressure overflows into detached block runs, up to
    /// [`LogBufferConfig::max_expand_bytes`]. Expansion is in-memory only;
    /// a mapped recovery file is never resized live.
    AutoExpandWhenFull,
    /// Allocation simply reports `NotEnoughSpace`; the caller drops or
    /// backs off.
    BlockWhenFull,
}

/// Configuration for [`LogBuffer`](crate::LogBuffer).
///
/// Geometry fields are normalized by [`validate`](Self::validate):
/// `block_size` rounds up to a power of two ≥ one cache line, and
/// `default_buffer_size` rounds up to a power of two ≥ 16 blocks.
#[derive(Debug, Clone)]
pub struct LogBufferConfig {
    /// Base of the recovery file path (also the registry key).
    pub log_name: String,
    /// Main buffer capacity in bytes.
    pub default_buffer_size: u32,
    /// Allocation granularity in bytes (multiple of the cache line).
    pub block_size: u32,
    /// Saturation behavior.
    pub policy: OverflowPolicy,
    /// Writes per second above which groups reserve larger runs to reduce
    /// free-list contention.
    pub high_frequency_threshold: u32,
    /// Enable the memory-mapped recovery backing.
    pub need_recovery: bool,
    /// Directory under which the recovery file tree is created.
    pub base_dir: PathBuf,
    /// Snapshot ring capacity in bytes; zero disables the ring.
    pub snapshot_buffer_size: u32,
    /// How long a returned oversize run stays pooled before the GC frees it.
    pub oversize_release_deadline_ms: u64,
    /// Idle time after which a write group is reclaimed.
    pub group_gc_ttl_ms: u64,
    /// Hard cap on any single chunk payload.
    pub max_oversize_bytes: u32,
    /// Cap on detached expansion bytes under `AutoExpandWhenFull`.
    pub max_expand_bytes: u32,
    /// Category names; part of the persistent-header checksum.
    pub categories: Vec<String>,
}

impl Default for LogBufferConfig {
    fn default() -> Self {
        Self {
            log_name: String::from("default"),
            default_buffer_size: 64 * 1024,
            block_size: CACHE_LINE_SIZE as u32,
            policy: OverflowPolicy::BlockWhenFull,
            high_frequency_threshold: 8192,
            need_recovery: false,
            base_dir: PathBuf::from("."),
            snapshot_buffer_size: 0,
            oversize_release_deadline_ms: 1500,
            group_gc_ttl_ms: 5000,
            max_oversize_bytes: 8 * 1024 * 1024,
            max_expand_bytes: 0,
            categories: vec![String::from("default")],
        }
    }
}

impl LogBufferConfig {
    /// Creates a configuration with the given name and capacity.
    pub fn new(log_name: impl Into<String>, default_buffer_size: u32) -> Self {
        Self {
            log_name: log_name.into(),
            default_buffer_size,
            ..Self::default()
        }
    }

    /// Sets the saturation policy.
    pub fn with_policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        if policy == OverflowPolicy::AutoExpandWhenFull && self.max_expand_bytes == 0 {
            self.max_expand_bytes = self.default_buffer_size.saturating_mul(4);
        }
        self
    }

    /// Enables the memory-mapped recovery backing rooted at `base_dir`.
    pub fn with_recovery(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.need_recovery = true;
        self.base_dir = base_dir.into();
        self
    }

    /// Sets the snapshot ring capacity (zero disables).
    pub fn with_snapshot(mut self, bytes: u32) -> Self {
        self.snapshot_buffer_size = bytes;
        self
    }

    /// Sets the category-name table.
    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = categories;
        self
    }

    /// Normalizes geometry in place and returns the validated config.
    ///
    /// Rounding is the same scheme the buffer applies at construction, so a
    /// caller can inspect the effective geometry up front.
    pub fn validate(mut self) -> Self {
        self.block_size = self
            .block_size
            .max(CACHE_LINE_SIZE as u32)
            .next_power_of_two();
        let floor = 16 * self.block_size;
        self.default_buffer_size = self.default_buffer_size.max(floor).next_power_of_two();
        // The smallest useful chunk needs head room inside a single block.
        debug_assert!(self.block_size as usize > BLOCK_HEAD_SIZE);
        self
    }

    /// Effective number of blocks after validation.
    #[inline]
    pub fn total_blocks(&self) -> u32 {
        self.default_buffer_size / self.block_size
    }

    /// Path of the recovery file for this configuration.
    pub fn mmap_path(&self) -> PathBuf {
        self.base_dir
            .join("bqlog_mmap")
            .join(format!("mmap_{}", self.log_name))
            .join(format!("{}.mmap", self.log_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_rounding() {
        let cfg = LogBufferConfig {
            default_buffer_size: 1000,
            block_size: 100,
            ..LogBufferConfig::default()
        }
        .validate();
        assert_eq!(cfg.block_size, 128);
        // floor is 16 blocks, rounded up to a power of two
        assert_eq!(cfg.default_buffer_size, 2048);
        assert_eq!(cfg.total_blocks(), 16);
    }

    #[test]
    fn test_auto_expand_default_cap() {
        let cfg =
            LogBufferConfig::new("t", 1 << 20).with_policy(OverflowPolicy::AutoExpandWhenFull);
        assert_eq!(cfg.max_expand_bytes, 4 << 20);
    }

    #[test]
    fn test_mmap_path_scheme() {
        let cfg = LogBufferConfig::new("game", 1 << 16).with_recovery("/tmp/base");
        assert_eq!(
            cfg.mmap_path(),
            PathBuf::from("/tmp/base/bqlog_mmap/mmap_game/game.mmap")
        );
    }
}
