//! Process-wide log registry.
//!
//! Buffers are created once by name and shared as handles; shutdown is a
//! best-effort flush of every registered buffer. The registry initializes
//! on first use and owns nothing beyond the handle map; consumers and
//! sinks are wired per buffer.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;

use crate::buffer::LogBuffer;
use crate::config::LogBufferConfig;
use crate::error::Result;

struct Registry {
    logs: RwLock<HashMap<String, Arc<LogBuffer>>>,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        logs: RwLock::new(HashMap::new()),
    })
}

/// Creates (or returns the existing) named log buffer.
///
/// The config's `log_name` is overridden by `name` so the registry key and
/// the recovery path always agree.
pub fn create_log(name: &str, mut config: LogBufferConfig) -> Result<Arc<LogBuffer>> {
    let reg = registry();
    if let Some(existing) = reg.logs.read().get(name) {
        return Ok(Arc::clone(existing));
    }
    let mut logs = reg.logs.write();
    if let Some(existing) = logs.get(name) {
        return Ok(Arc::clone(existing));
    }
    config.log_name = name.to_string();
    let buffer = Arc::new(LogBuffer::new(config)?);
    logs.insert(name.to_string(), Arc::clone(&buffer));
    Ok(buffer)
}

/// Looks up a registered log buffer.
pub fn get_log(name: &str) -> Option<Arc<LogBuffer>> {
    registry().logs.read().get(name).cloned()
}

/// Removes a buffer from the registry. Outstanding handles keep it alive;
/// the name becomes available for a fresh `create_log`.
pub fn release_log(name: &str) -> bool {
    registry().logs.write().remove(name).is_some()
}

/// Best-effort shutdown flush: drains every registered buffer to its sinks
/// within the shared time budget. Returns `true` when every buffer
/// emptied.
pub fn force_flush_all_logs(budget: Duration) -> bool {
    let logs: Vec<Arc<LogBuffer>> = registry().logs.read().values().cloned().collect();
    if logs.is_empty() {
        return true;
    }
    let per_log = budget / logs.len() as u32;
    let mut all_empty = true;
    for log in logs {
        all_empty &= log.force_flush(per_log);
    }
    all_empty
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_get_by_name() {
        let cfg = LogBufferConfig::new("ignored", 4096);
        let a = create_log("registry_a", cfg.clone()).unwrap();
        assert_eq!(a.config().log_name, "registry_a");
        let b = create_log("registry_a", cfg).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(get_log("registry_a").is_some());
        assert!(get_log("registry_missing").is_none());
        assert!(release_log("registry_a"));
        assert!(!release_log("registry_a"));
    }

    #[test]
    fn test_force_flush_all_drains() {
        let cfg = LogBufferConfig::new("ignored", 4096);
        let log = create_log("registry_flush", cfg).unwrap();
        let mut c = log.alloc_write_chunk(16, 0).unwrap();
        c.payload_mut().fill(1);
        c.commit();
        assert!(force_flush_all_logs(Duration::from_millis(250)));
        assert!(matches!(
            log.read_chunk(),
            Err(crate::error::BufferError::EmptyBuffer)
        ));
        release_log("registry_flush");
    }
}
