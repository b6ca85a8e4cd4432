//! SyncIO Store - Synchronized file-store core
//!
//! This crate implements the storage core of SyncIO:
//! - The blocking `FileStore` contract (enumerate, metadata, random-access
//!   read, append-only write, delete, rename, lock factory)
//! - A local-filesystem store used as the cache in every variant
//! - Cross-process named mutexes guarding fetch-then-cache and
//!   write-then-publish sections
//! - The synced store composing a master and a cache
//! - The open-time health check and atomic cache rebuild

pub mod health;
pub mod local;
pub mod mutex;
pub mod store;
pub mod synced;

// Re-exports
pub use health::{CacheRebuilder, current_generation};
pub use local::LocalFileStore;
pub use mutex::{CrossProcessGuard, CrossProcessMutex, CrossProcessMutexRegistry};
pub use store::{FileStore, InProcessLock, LockRegistry, NamedLock, ReadHandle, WriteHandle};
pub use synced::{SyncedFileStore, WriteSession};
