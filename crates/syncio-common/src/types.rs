//! Core type definitions for SyncIO
//!
//! This module defines the fundamental types used throughout the system:
//! store identities, per-file metadata records, and the open-result flags.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

/// Identifies "the same logical index" across processes.
///
/// A synced store derives its identity by concatenating the master's and the
/// cache's own identities, so identical (master, cache) pairs always yield
/// the same value. Used to scope locks and cross-process mutexes so that
/// unrelated indices never contend.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct StoreIdentity(String);

impl StoreIdentity {
    /// Create an identity from a backing-specific string (path, URL, ...)
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the identity of a (master, cache) composition.
    ///
    /// Deterministic: the same pair always produces the same identity.
    #[must_use]
    pub fn compose(master: &StoreIdentity, cache: &StoreIdentity) -> Self {
        Self(format!("{}&{}", master.0, cache.0))
    }

    /// Get the identity as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A short, filesystem-safe token for this identity.
    ///
    /// Identities contain paths and URLs, so lock directories and similar
    /// on-disk artifacts are keyed by this hash instead of the raw string.
    #[must_use]
    pub fn fs_token(&self) -> String {
        format!("{:016x}", xxhash_rust::xxh64::xxh64(self.0.as_bytes(), 0))
    }
}

impl fmt::Debug for StoreIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreIdentity({:?})", self.0)
    }
}

/// Metadata for one file as seen by one store.
///
/// A master copy and a cache copy are *in sync* when their lengths match and
/// their modification times agree within the configured skew tolerance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRecord {
    /// File name (flat, no path components)
    pub name: String,
    /// Length in bytes
    pub length: u64,
    /// Last modification time
    pub modified: SystemTime,
}

impl FileRecord {
    /// Check whether another record describes the same logical content.
    ///
    /// Lengths must match exactly; modification times may differ by up to
    /// `tolerance` in either direction (remote stores assign their own
    /// timestamps, so some skew is expected).
    #[must_use]
    pub fn in_sync_with(&self, other: &FileRecord, tolerance: Duration) -> bool {
        if self.length != other.length {
            return false;
        }
        let skew = match self.modified.duration_since(other.modified) {
            Ok(d) => d,
            Err(e) => e.duration(),
        };
        skew <= tolerance
    }
}

bitflags::bitflags! {
    /// Outcome of opening a synced store, reported by the health check.
    ///
    /// A bitmask rather than an enum so callers and tests can assert exactly
    /// which recovery path executed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// Both copies were healthy and in sync; nothing was touched.
        const OPENED_SUCCESSFULLY = 1 << 0;
        /// Something abnormal was observed (missing files, out-of-sync copies).
        const NOT_CLEAN = 1 << 1;
        /// The mandatory structural file was missing from one or both copies.
        const MISSING_SEGMENTS = 1 << 2;
        /// The cache was rebuilt from a healthy master.
        const FIXED = 1 << 3;
        /// The master was restored from a healthy cache copy.
        const SYNCED_FROM_LOCAL = 1 << 4;
        /// Neither copy was trustworthy; both were discarded and a fresh
        /// empty index was initialized. Always explicit, never silent.
        const CORRUPT_CREATED_NEW = 1 << 5;
    }
}
