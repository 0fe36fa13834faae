//! Result codes for buffer operations.

use thiserror::Error;

/// Errors returned by [`LogBuffer`](crate::LogBuffer) operations.
///
/// The buffer never panics on an expected failure; every fallible path
/// reports one of these codes. Programmer errors (returning a foreign
/// handle, double-returning a chunk) are debug assertions instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    /// The buffer has no contiguous region large enough for the request.
    /// The caller decides: drop the entry, back off and retry, or rely on
    /// the auto-expand policy.
    #[error("not enough space in log buffer")]
    NotEnoughSpace,

    /// A transient condition (another thread mid-publish). Back off
    /// briefly and retry.
    #[error("transient contention, retry after backoff")]
    WaitAndRetry,

    /// The requested payload exceeds the configured maximum chunk size.
    /// Non-recoverable for this call.
    #[error("requested allocation size is invalid")]
    AllocSizeInvalid,

    /// The buffer is still initializing (or already torn down).
    #[error("log buffer is not initialized")]
    NotInitialized,

    /// No committed entry is available to read.
    #[error("log buffer is empty")]
    EmptyBuffer,

    /// A chunk failed consumer-side sanity checks and was skipped.
    #[error("corrupted chunk detected")]
    Corrupted,
}

impl BufferError {
    /// Returns `true` if the caller should back off and retry.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WaitAndRetry | Self::NotInitialized)
    }

    /// Returns `true` if retrying the same call can never succeed.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AllocSizeInvalid)
    }
}

/// Shorthand for results carrying a [`BufferError`].
pub type Result<T> = std::result::Result<T, BufferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BufferError::WaitAndRetry.is_transient());
        assert!(BufferError::NotInitialized.is_transient());
        assert!(!BufferError::NotEnoughSpace.is_transient());
        assert!(!BufferError::EmptyBuffer.is_transient());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(BufferError::AllocSizeInvalid.is_terminal());
        assert!(!BufferError::NotEnoughSpace.is_terminal());
        assert!(!BufferError::WaitAndRetry.is_terminal());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            BufferError::EmptyBuffer.to_string(),
            "log buffer is empty"
        );
        assert_eq!(
            BufferError::Corrupted.to_string(),
            "corrupted chunk detected"
        );
    }
}
