//! The file-store contract and lock primitives
//!
//! Every backing (local filesystem, shared filesystem, remote object store)
//! presents the same blocking contract, so the index engine above never
//! learns where its bytes live.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Seek, Write};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use syncio_common::{Error, FileRecord, Result, StoreIdentity};
use tracing::warn;

/// Random-access read handle.
///
/// Reads past EOF return fewer bytes rather than an error (short reads at
/// EOF are part of the contract).
pub trait ReadHandle: Read + Seek + Send {
    /// Total length of the file in bytes
    fn len(&self) -> u64;

    /// True when the file is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Duplicate this handle with an independent position.
    ///
    /// Used for concurrent scan cursors over the same file. Cloning is
    /// allowed to fail intermittently under contention; callers must treat
    /// the clone as optional. Failures are logged, never raised.
    fn try_clone(&self) -> Option<Box<dyn ReadHandle>>;
}

/// Append-only write handle.
///
/// Bytes become visible to readers only once `finish` completes.
pub trait WriteHandle: Write + Send {
    /// Name the handle writes to
    fn name(&self) -> &str;

    /// Flush, close and publish the written bytes.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// A named lock scoped to one store.
///
/// Obtaining blocks the calling thread; none of the primitives are
/// cancellable. `release` raises when the lock is still observable
/// afterwards.
pub trait NamedLock: Send + Sync {
    /// Name of the lock
    fn name(&self) -> &str;

    /// Attempt to obtain the lock without waiting. Returns whether it was
    /// obtained.
    fn try_obtain(&self) -> Result<bool>;

    /// Obtain the lock, waiting up to `timeout` (`None` waits forever).
    fn obtain(&self, timeout: Option<Duration>) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.try_obtain()? {
                return Ok(());
            }
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    return Err(Error::LockTimeout {
                        name: self.name().to_string(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    /// Release the lock.
    fn release(&self) -> Result<()>;

    /// Whether the lock is currently held by anyone.
    fn is_locked(&self) -> Result<bool>;
}

/// Poll interval for lock acquisition loops.
pub(crate) const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Uniform contract over a file store.
///
/// All operations are blocking. Names are flat: no path separators, no
/// parent references.
pub trait FileStore: Send + Sync {
    /// Identity of this store, used to scope locks and mutexes
    fn identity(&self) -> StoreIdentity;

    /// Enumerate all file names in the store
    fn list_all(&self) -> Result<Vec<String>>;

    /// Whether a file exists
    fn exists(&self, name: &str) -> Result<bool>;

    /// Length of a file in bytes
    fn length(&self, name: &str) -> Result<u64>;

    /// Last modification time of a file
    fn modified(&self, name: &str) -> Result<SystemTime>;

    /// Set the modification time of a file.
    ///
    /// Stores whose timestamps are assigned by the backing (remote object
    /// stores) may treat this as a no-op.
    fn set_modified(&self, name: &str, when: SystemTime) -> Result<()>;

    /// Open a file for random-access reading
    fn open_read(&self, name: &str) -> Result<Box<dyn ReadHandle>>;

    /// Open a file for append-only writing
    fn open_write(&self, name: &str) -> Result<Box<dyn WriteHandle>>;

    /// Delete a file. Deleting a missing file is not an error.
    fn delete(&self, name: &str) -> Result<()>;

    /// Rename a file
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Create a named lock scoped to this store
    fn make_lock(&self, name: &str) -> Box<dyn NamedLock>;

    /// Metadata record for one file
    fn record(&self, name: &str) -> Result<FileRecord> {
        Ok(FileRecord {
            name: name.to_string(),
            length: self.length(name)?,
            modified: self.modified(name)?,
        })
    }
}

/// Copy one file between stores through a streaming buffer.
///
/// Copies, never moves: the source file is untouched. Timestamp
/// reconciliation is the caller's concern since it differs by direction.
pub(crate) fn copy_file(
    src: &dyn FileStore,
    dst: &dyn FileStore,
    name: &str,
    buffer_size: usize,
) -> Result<u64> {
    let mut reader = src.open_read(name)?;
    let mut writer = dst.open_write(name)?;
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut copied = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        copied += n as u64;
    }
    writer.finish()?;
    Ok(copied)
}

/// Validate a store file name: flat, non-empty, no path components.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidFileName("empty name".to_string()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(Error::InvalidFileName(name.to_string()));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidFileName(name.to_string()));
    }
    Ok(())
}

/// In-process named lock handed out by [`LockRegistry`].
///
/// Serializes threads of one process; cross-process exclusion is the mutex
/// registry's job.
pub struct InProcessLock {
    name: String,
    held: Mutex<bool>,
}

impl InProcessLock {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            held: Mutex::new(false),
        }
    }
}

impl NamedLock for InProcessLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_obtain(&self) -> Result<bool> {
        let mut held = self.held.lock();
        if *held {
            Ok(false)
        } else {
            *held = true;
            Ok(true)
        }
    }

    fn release(&self) -> Result<()> {
        let mut held = self.held.lock();
        if !*held {
            warn!(lock = %self.name, "releasing a lock that was not held");
        }
        *held = false;
        Ok(())
    }

    fn is_locked(&self) -> Result<bool> {
        Ok(*self.held.lock())
    }
}

/// Per-store registry of in-process named locks.
///
/// Keys are (store identity, lock name): the same pair always resolves to
/// the same lock instance, so unrelated indices never contend. An injected
/// instance with an explicit lifetime - deliberately not a process-wide
/// global, to avoid cross-tenant and cross-test leakage.
pub struct LockRegistry {
    locks: Mutex<HashMap<(StoreIdentity, String), Arc<InProcessLock>>>,
}

impl LockRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the lock for (identity, name), creating it on first use
    pub fn lock(&self, identity: &StoreIdentity, name: &str) -> Arc<InProcessLock> {
        let mut locks = self.locks.lock();
        locks
            .entry((identity.clone(), name.to_string()))
            .or_insert_with(|| Arc::new(InProcessLock::new(name)))
            .clone()
    }

    /// Number of registered locks
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// True when no lock has been handed out yet
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }

    /// Drop all registered locks
    pub fn clear(&self) {
        self.locks.lock().clear();
    }
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("_0.cfs").is_ok());
        assert!(validate_name("segments").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name(".").is_err());
    }

    #[test]
    fn test_in_process_lock_exclusion() {
        let lock = InProcessLock::new("write.lock");
        assert!(lock.try_obtain().unwrap());
        assert!(!lock.try_obtain().unwrap());
        assert!(lock.is_locked().unwrap());
        lock.release().unwrap();
        assert!(!lock.is_locked().unwrap());
        assert!(lock.try_obtain().unwrap());
    }

    #[test]
    fn test_obtain_times_out() {
        let lock = InProcessLock::new("write.lock");
        lock.try_obtain().unwrap();
        let err = lock.obtain(Some(Duration::from_millis(50))).unwrap_err();
        match err {
            Error::LockTimeout { name, .. } => assert_eq!(name, "write.lock"),
            other => panic!("expected LockTimeout, got {other:?}"),
        }
    }

    #[test]
    fn test_registry_hands_out_same_instance() {
        let registry = LockRegistry::new();
        let id = StoreIdentity::new("file:///idx");
        let a = registry.lock(&id, "write.lock");
        let b = registry.lock(&id, "write.lock");
        assert!(Arc::ptr_eq(&a, &b));

        let other = registry.lock(&StoreIdentity::new("file:///other"), "write.lock");
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_scopes_by_identity() {
        let registry = LockRegistry::new();
        let a = registry.lock(&StoreIdentity::new("file:///a"), "write.lock");
        let b = registry.lock(&StoreIdentity::new("file:///b"), "write.lock");
        a.try_obtain().unwrap();
        // Unrelated indices never contend
        assert!(b.try_obtain().unwrap());
    }
}
