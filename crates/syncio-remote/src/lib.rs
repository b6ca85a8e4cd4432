//! SyncIO Remote - Remote object-store backend
//!
//! This crate lets a synced store use a remote blob-style store as its
//! master:
//! - A capability trait over the remote SDK (list / get-properties /
//!   upload / download / delete), injected rather than depended upon
//! - A FileStore bridge over that capability, with optional gzip at the
//!   byte-transfer boundary
//! - The remote-backed synced store with staleness tolerance
//! - A marker-object lock for index-level coordination

pub mod adapter;
pub mod compress;
pub mod lock;
pub mod store;

// Re-exports
pub use adapter::{MemoryObjectStore, ObjectProperties, RemoteObjectAdapter};
pub use lock::RemoteSimpleLock;
pub use store::{AdapterStore, RemoteSyncedFileStore};
