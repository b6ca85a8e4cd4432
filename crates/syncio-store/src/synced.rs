//! Synced file store
//!
//! Composes a `master` store (authoritative, possibly remote or shared) and
//! a `cache` store (local, fast). All reads and writes pass through the
//! cache; the master is the sole source of truth for existence and
//! metadata. Cross-process mutexes guard the fetch-then-cache and
//! write-then-publish sections per file name.

use std::io::Write;
use std::sync::Arc;
use std::time::SystemTime;
use syncio_common::{Error, Result, StoreIdentity, SyncConfig};
use tracing::{debug, warn};

use crate::mutex::{CrossProcessGuard, CrossProcessMutexRegistry};
use crate::store::{FileStore, NamedLock, ReadHandle, WriteHandle, copy_file};

/// A file store that reads and writes through a local cache while a master
/// store stays authoritative.
pub struct SyncedFileStore {
    master: Arc<dyn FileStore>,
    cache: Arc<dyn FileStore>,
    mutexes: Arc<CrossProcessMutexRegistry>,
    identity: StoreIdentity,
    config: SyncConfig,
}

impl SyncedFileStore {
    /// Compose `master` and `cache` into one synced store.
    ///
    /// The store's identity derives deterministically from the two
    /// identities, so every process composing the same pair agrees on lock
    /// scope.
    pub fn new(
        master: Arc<dyn FileStore>,
        cache: Arc<dyn FileStore>,
        mutexes: Arc<CrossProcessMutexRegistry>,
        config: SyncConfig,
    ) -> Self {
        let identity = StoreIdentity::compose(&master.identity(), &cache.identity());
        Self {
            master,
            cache,
            mutexes,
            identity,
            config,
        }
    }

    /// Identity scoping index-level locks; unrelated indices never contend.
    pub fn lock_id(&self) -> &StoreIdentity {
        &self.identity
    }

    /// The authoritative store
    pub fn master(&self) -> &Arc<dyn FileStore> {
        &self.master
    }

    /// The local cache store
    pub fn cache(&self) -> &Arc<dyn FileStore> {
        &self.cache
    }

    /// Configuration in effect
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Start a write session for `name`.
    ///
    /// The session holds the per-name cross-process mutex for its whole
    /// life; bytes buffer into the cache and reach the master only on
    /// [`WriteSession::commit`].
    pub fn open_session(&self, name: &str) -> Result<WriteSession> {
        let guard = self
            .mutexes
            .lock(&self.identity, name, self.config.lock_timeout)?;
        let writer = self.cache.open_write(name)?;
        Ok(WriteSession {
            name: name.to_string(),
            master: self.master.clone(),
            cache: self.cache.clone(),
            copy_buffer_size: self.config.copy_buffer_size,
            writer: Some(writer),
            committed: false,
            _guard: guard,
        })
    }

    /// Bring the cache copy of `name` in sync with the master, if needed.
    ///
    /// Must run under the per-name mutex. The decision is three-way: cache
    /// copy absent, length mismatch, or modification times apart beyond the
    /// skew tolerance all trigger a fresh copy. Content is never hashed.
    fn ensure_synced(&self, name: &str) -> Result<()> {
        let master_rec = match self.master.record(name) {
            Ok(rec) => rec,
            Err(Error::FileNotFound(_)) => {
                // Master is authoritative for existence: a cached leftover
                // must not resurrect a deleted file.
                return Err(Error::FileNotFound(name.to_string()));
            }
            Err(err) if err.is_transient() => {
                // Master unreachable. Serve the cached copy when there is
                // one; staleness cannot be verified, availability wins.
                if self.cache.exists(name)? {
                    warn!(file = name, %err, "master unreachable, serving cached copy");
                    return Ok(());
                }
                return Err(Error::FileNotFound(name.to_string()));
            }
            Err(err) => return Err(err),
        };

        let in_sync = match self.cache.record(name) {
            Ok(cached) => cached.in_sync_with(&master_rec, self.config.skew_tolerance),
            Err(Error::FileNotFound(_)) => false,
            Err(err) => return Err(err),
        };
        if in_sync {
            return Ok(());
        }

        debug!(file = name, length = master_rec.length, "syncing master copy into cache");
        copy_file(
            self.master.as_ref(),
            self.cache.as_ref(),
            name,
            self.config.copy_buffer_size,
        )?;
        // Adopt the master's timestamp so the next staleness check agrees.
        if let Err(err) = self.cache.set_modified(name, master_rec.modified) {
            warn!(file = name, %err, "could not reconcile cache timestamp");
        }
        Ok(())
    }
}

impl FileStore for SyncedFileStore {
    fn identity(&self) -> StoreIdentity {
        self.identity.clone()
    }

    /// Enumeration delegates to the master; an unreachable master degrades
    /// to an empty listing, never a failure.
    fn list_all(&self) -> Result<Vec<String>> {
        match self.master.list_all() {
            Ok(names) => Ok(names),
            Err(err) => {
                warn!(%err, "master enumeration failed, degrading to empty listing");
                Ok(Vec::new())
            }
        }
    }

    fn exists(&self, name: &str) -> Result<bool> {
        match self.master.exists(name) {
            Ok(found) => Ok(found),
            Err(err) => {
                warn!(file = name, %err, "master existence check failed, degrading to absent");
                Ok(false)
            }
        }
    }

    fn length(&self, name: &str) -> Result<u64> {
        match self.master.length(name) {
            Ok(len) => Ok(len),
            Err(Error::FileNotFound(_)) => Err(Error::FileNotFound(name.to_string())),
            Err(err) => {
                warn!(file = name, %err, "master length check failed, degrading to absent");
                Err(Error::FileNotFound(name.to_string()))
            }
        }
    }

    fn modified(&self, name: &str) -> Result<SystemTime> {
        match self.master.modified(name) {
            Ok(when) => Ok(when),
            Err(Error::FileNotFound(_)) => Err(Error::FileNotFound(name.to_string())),
            Err(err) => {
                warn!(file = name, %err, "master time check failed, degrading to absent");
                Err(Error::FileNotFound(name.to_string()))
            }
        }
    }

    fn set_modified(&self, name: &str, when: SystemTime) -> Result<()> {
        self.master.set_modified(name, when)?;
        if let Err(err) = self.cache.set_modified(name, when) {
            if !matches!(err, Error::FileNotFound(_)) {
                warn!(file = name, %err, "could not mirror timestamp onto cache copy");
            }
        }
        Ok(())
    }

    fn open_read(&self, name: &str) -> Result<Box<dyn ReadHandle>> {
        let guard = self
            .mutexes
            .lock(&self.identity, name, self.config.lock_timeout)?;
        self.ensure_synced(name)?;
        drop(guard);
        self.cache.open_read(name)
    }

    fn open_write(&self, name: &str) -> Result<Box<dyn WriteHandle>> {
        Ok(Box::new(self.open_session(name)?))
    }

    /// Delete the cache copy before the master copy.
    ///
    /// If the master went first and the cache deletion then failed, nothing
    /// would ever revisit the orphaned cache entry: existence checks
    /// delegate to the master and would report the file gone forever. A
    /// cache-side failure therefore aborts the whole operation with the
    /// master untouched.
    fn delete(&self, name: &str) -> Result<()> {
        let _guard = self
            .mutexes
            .lock(&self.identity, name, self.config.lock_timeout)?;
        self.cache.delete(name)?;
        self.master.delete(name)?;
        Ok(())
    }

    /// Best-effort rename on each copy independently.
    ///
    /// A master failure propagates (it is the authoritative copy). A cache
    /// failure is logged and swallowed; the stale cache entry under the old
    /// name is then invalidated so it can never shadow a future read.
    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let _guard = self
            .mutexes
            .lock(&self.identity, from, self.config.lock_timeout)?;
        self.master.rename(from, to)?;
        if let Err(err) = self.cache.rename(from, to) {
            warn!(%err, from, to, "cache rename failed, invalidating stale cache copy");
            if let Err(err) = self.cache.delete(from) {
                warn!(%err, from, "could not invalidate stale cache copy");
            }
        }
        Ok(())
    }

    /// Index-level locks compose the master's and the cache's own lock
    /// factories: both sides must be held for the composite to be held.
    fn make_lock(&self, name: &str) -> Box<dyn NamedLock> {
        Box::new(CompositeLock {
            name: name.to_string(),
            cache: self.cache.make_lock(name),
            master: self.master.make_lock(name),
        })
    }
}

/// One in-flight append-only write.
///
/// Holds the per-name cross-process mutex from creation to drop. Bytes land
/// fully in the cache; `commit` pushes the complete file to the master and
/// reconciles timestamps. A failed push keeps the session retryable: the
/// cache copy persists, so bytes are never regenerated.
pub struct WriteSession {
    name: String,
    master: Arc<dyn FileStore>,
    cache: Arc<dyn FileStore>,
    copy_buffer_size: usize,
    writer: Option<Box<dyn WriteHandle>>,
    committed: bool,
    _guard: CrossProcessGuard,
}

impl WriteSession {
    /// Name this session writes to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the push to master has completed
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Publish the written bytes.
    ///
    /// Closes the cache writer (first call only), then copies - never moves
    /// - the complete file to the master and adopts the master's post-push
    /// timestamp on the cache copy. Calling again after a failed push
    /// retries the push alone.
    pub fn commit(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        if let Some(writer) = self.writer.take() {
            writer.finish()?;
        }
        copy_file(
            self.cache.as_ref(),
            self.master.as_ref(),
            &self.name,
            self.copy_buffer_size,
        )?;
        match self.master.modified(&self.name) {
            Ok(when) => {
                if let Err(err) = self.cache.set_modified(&self.name, when) {
                    warn!(file = %self.name, %err, "could not reconcile cache timestamp");
                }
            }
            Err(err) => {
                warn!(file = %self.name, %err, "could not read master timestamp after push");
            }
        }
        self.committed = true;
        Ok(())
    }
}

impl Write for WriteSession {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "write session already closed",
            )),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl WriteHandle for WriteSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.commit()
    }
}

impl Drop for WriteSession {
    fn drop(&mut self) {
        if !self.committed {
            warn!(file = %self.name, "write session dropped without commit");
        }
    }
}

/// Two-sided lock over the master's and the cache's lock factories.
///
/// Obtains the cache side first, the master side second; releases in
/// reverse order. Held only when both sides are held.
struct CompositeLock {
    name: String,
    cache: Box<dyn NamedLock>,
    master: Box<dyn NamedLock>,
}

impl NamedLock for CompositeLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_obtain(&self) -> Result<bool> {
        if !self.cache.try_obtain()? {
            return Ok(false);
        }
        match self.master.try_obtain() {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.cache.release()?;
                Ok(false)
            }
            Err(err) => {
                if let Err(release_err) = self.cache.release() {
                    warn!(lock = %self.name, %release_err, "could not back out cache-side lock");
                }
                Err(err)
            }
        }
    }

    fn release(&self) -> Result<()> {
        let master = self.master.release();
        let cache = self.cache.release();
        master.and(cache)
    }

    fn is_locked(&self) -> Result<bool> {
        Ok(self.cache.is_locked()? || self.master.is_locked()?)
    }
}
