//! Configuration types for SyncIO
//!
//! Plain data structures with defaults; loading and merging is the
//! embedding application's concern.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning for a synced file store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Clock skew tolerated when comparing cache and master timestamps.
    ///
    /// Remote object stores assign their own modification times, so the
    /// remote default tolerates 1 second of skew; same-filesystem masters
    /// default to exact agreement. Correctness depends on the backing
    /// store's clock guarantees, which is why this is configuration rather
    /// than a constant.
    pub skew_tolerance: Duration,
    /// Upper bound on cross-process mutex acquisition.
    ///
    /// `None` blocks forever, preserving historical behavior: a wedged
    /// writer can starve readers of that one file.
    pub lock_timeout: Option<Duration>,
    /// Gzip payloads at the remote transfer boundary.
    ///
    /// Applies to uploaded/downloaded bytes only; lengths and times exposed
    /// through the store contract are always the uncompressed logical ones.
    pub compress_transfers: bool,
    /// Buffer size for master<->cache streaming copies.
    pub copy_buffer_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            skew_tolerance: Duration::ZERO,
            lock_timeout: None,
            compress_transfers: false,
            copy_buffer_size: 64 * 1024,
        }
    }
}

impl SyncConfig {
    /// Defaults for stores backed by a remote object store.
    #[must_use]
    pub fn remote() -> Self {
        Self {
            skew_tolerance: Duration::from_secs(1),
            ..Self::default()
        }
    }
}

/// Tuning for the open-time health check and cache rebuild.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Name of the mandatory structural file.
    ///
    /// A copy is considered healthy when this file exists and is fully
    /// readable. The layer understands nothing else about index-file
    /// semantics.
    pub required_file: String,
    /// Allow repairing one side from the other's healthy copy
    /// (cache-from-master rebuild, master-from-cache push).
    pub allow_repair: bool,
    /// Allow discarding both copies and initializing a fresh empty index
    /// when neither is trustworthy. When false, that situation fails the
    /// open instead - the only corruption case that does.
    pub create_on_corrupt: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            required_file: "segments".to_string(),
            allow_repair: true,
            create_on_corrupt: true,
        }
    }
}
