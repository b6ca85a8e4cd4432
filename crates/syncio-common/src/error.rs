//! Error types for SyncIO
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for SyncIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for SyncIO
#[derive(Debug, Error)]
pub enum Error {
    // Transient I/O errors - retried by the caller, never surfaced as corruption
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),

    // File-level errors
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file is in use: {0}")]
    FileBusy(String),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    // Lock errors
    #[error("permission denied creating lock {0}")]
    LockPermission(String),

    #[error("lock release failed: {0}")]
    LockReleaseFailed(String),

    #[error("lock already held: {0}")]
    LockHeld(String),

    #[error("timed out acquiring lock {name} after {waited_ms} ms")]
    LockTimeout { name: String, waited_ms: u64 },

    // Corruption - raised only when neither copy is trustworthy and
    // creating a fresh index is disallowed
    #[error("store is corrupt: {0}")]
    Corrupt(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// True for errors a caller should retry rather than treat as data loss.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::RemoteUnavailable(_) | Error::FileBusy(_)
        )
    }

    /// True when the error is the fatal lock-primitive permission case.
    #[must_use]
    pub fn is_fatal_lock_error(&self) -> bool {
        matches!(self, Error::LockPermission(_))
    }
}
