//! Remote-backed stores
//!
//! [`AdapterStore`] bridges a [`RemoteObjectAdapter`] to the FileStore
//! contract; [`RemoteSyncedFileStore`] composes it with a local cache the
//! same way every other synced store is composed.

use bytes::Bytes;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use syncio_common::{Error, HealthConfig, OpenFlags, Result, StoreIdentity, SyncConfig};
use syncio_store::{
    CacheRebuilder, CrossProcessMutexRegistry, FileStore, NamedLock, ReadHandle, SyncedFileStore,
    WriteHandle, WriteSession,
};
use tracing::debug;

use crate::adapter::RemoteObjectAdapter;
use crate::compress;
use crate::lock::RemoteSimpleLock;

/// FileStore view of a remote object store.
///
/// Reads buffer the downloaded payload; writes buffer locally and upload on
/// finish. With compression enabled, gzip applies to the transferred bytes
/// only - every length and time exposed here is the logical one.
pub struct AdapterStore {
    adapter: Arc<dyn RemoteObjectAdapter>,
    compress_transfers: bool,
}

impl AdapterStore {
    /// Wrap an adapter, optionally gzipping transfers
    pub fn new(adapter: Arc<dyn RemoteObjectAdapter>, compress_transfers: bool) -> Self {
        Self {
            adapter,
            compress_transfers,
        }
    }

    /// The underlying adapter
    pub fn adapter(&self) -> &Arc<dyn RemoteObjectAdapter> {
        &self.adapter
    }

    fn properties_or_not_found(
        &self,
        name: &str,
    ) -> Result<crate::adapter::ObjectProperties> {
        self.adapter
            .get_properties(name)?
            .ok_or_else(|| Error::FileNotFound(name.to_string()))
    }
}

impl FileStore for AdapterStore {
    fn identity(&self) -> StoreIdentity {
        self.adapter.identity()
    }

    fn list_all(&self) -> Result<Vec<String>> {
        self.adapter.list_all()
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.adapter.get_properties(name)?.is_some())
    }

    fn length(&self, name: &str) -> Result<u64> {
        Ok(self.properties_or_not_found(name)?.length)
    }

    fn modified(&self, name: &str) -> Result<SystemTime> {
        Ok(self.properties_or_not_found(name)?.modified)
    }

    /// Remote modification times are server-assigned; reconciliation runs
    /// the other way around (the cache adopts the remote time).
    fn set_modified(&self, name: &str, _when: SystemTime) -> Result<()> {
        debug!(file = name, "remote timestamps are server-assigned, ignoring");
        Ok(())
    }

    fn open_read(&self, name: &str) -> Result<Box<dyn ReadHandle>> {
        let payload = self.adapter.download(name)?;
        let bytes = if self.compress_transfers && compress::is_compressed(&payload) {
            compress::decompress(&payload)?
        } else {
            payload
        };
        Ok(Box::new(BytesReadHandle { bytes, position: 0 }))
    }

    fn open_write(&self, name: &str) -> Result<Box<dyn WriteHandle>> {
        Ok(Box::new(RemoteWriteHandle {
            name: name.to_string(),
            adapter: self.adapter.clone(),
            compress_transfers: self.compress_transfers,
            buffer: Vec::new(),
        }))
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.adapter.delete(name)
    }

    /// Blob stores have no rename primitive: copy under the new name, then
    /// delete the old object. The stored payload moves verbatim, so a
    /// compressed object stays compressed.
    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let props = self.properties_or_not_found(from)?;
        let payload = self.adapter.download(from)?;
        self.adapter.upload(to, payload, props.length)?;
        self.adapter.delete(from)
    }

    fn make_lock(&self, name: &str) -> Box<dyn NamedLock> {
        Box::new(RemoteSimpleLock::new(self.adapter.clone(), name))
    }
}

/// Read handle over a fully buffered download.
struct BytesReadHandle {
    bytes: Bytes,
    position: u64,
}

impl Read for BytesReadHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let available = (self.bytes.len() as u64).saturating_sub(self.position);
        let n = (buf.len() as u64).min(available) as usize;
        if n == 0 {
            return Ok(0);
        }
        let start = self.position as usize;
        buf[..n].copy_from_slice(&self.bytes[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for BytesReadHandle {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(delta) => self.bytes.len() as i128 + delta as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

impl ReadHandle for BytesReadHandle {
    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn try_clone(&self) -> Option<Box<dyn ReadHandle>> {
        Some(Box::new(BytesReadHandle {
            bytes: self.bytes.clone(),
            position: self.position,
        }))
    }
}

/// Write handle buffering locally, uploaded in one piece on finish.
struct RemoteWriteHandle {
    name: String,
    adapter: Arc<dyn RemoteObjectAdapter>,
    compress_transfers: bool,
    buffer: Vec<u8>,
}

impl Write for RemoteWriteHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl WriteHandle for RemoteWriteHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let logical_length = self.buffer.len() as u64;
        let payload = if self.compress_transfers {
            compress::compress(&self.buffer)?
        } else {
            Bytes::from(self.buffer)
        };
        self.adapter.upload(&self.name, payload, logical_length)
    }
}

/// A synced store whose master is a remote object store.
///
/// Identical contract to every other synced store; the remote-specific
/// defaults are a 1-second staleness skew tolerance and optional transfer
/// compression, both carried in [`SyncConfig`].
pub struct RemoteSyncedFileStore {
    inner: SyncedFileStore,
}

impl RemoteSyncedFileStore {
    /// Compose a remote master with a local cache store.
    ///
    /// Use [`SyncConfig::remote`] unless the backing store's clock
    /// guarantees justify something tighter.
    pub fn new(
        adapter: Arc<dyn RemoteObjectAdapter>,
        cache: Arc<dyn FileStore>,
        mutexes: Arc<CrossProcessMutexRegistry>,
        config: SyncConfig,
    ) -> Self {
        let master: Arc<dyn FileStore> =
            Arc::new(AdapterStore::new(adapter, config.compress_transfers));
        Self {
            inner: SyncedFileStore::new(master, cache, mutexes, config),
        }
    }

    /// Open with the full health check, rebuilding the cache as needed.
    ///
    /// Returns the store plus the flags describing which recovery path ran.
    pub fn open_checked(
        adapter: Arc<dyn RemoteObjectAdapter>,
        cache_root: &Path,
        mutexes: Arc<CrossProcessMutexRegistry>,
        config: SyncConfig,
        health: HealthConfig,
    ) -> Result<(Self, OpenFlags)> {
        let master: Arc<dyn FileStore> =
            Arc::new(AdapterStore::new(adapter, config.compress_transfers));
        let rebuilder = CacheRebuilder::new(config.clone(), health);
        let (flags, cache) = rebuilder.open(&master, cache_root)?;
        let store = Self {
            inner: SyncedFileStore::new(master, Arc::new(cache), mutexes, config),
        };
        Ok((store, flags))
    }

    /// Identity scoping index-level locks
    pub fn lock_id(&self) -> &StoreIdentity {
        self.inner.lock_id()
    }

    /// Start a write session holding its name's mutex for its whole life
    pub fn open_session(&self, name: &str) -> Result<WriteSession> {
        self.inner.open_session(name)
    }

    /// The local cache store
    pub fn cache(&self) -> &Arc<dyn FileStore> {
        self.inner.cache()
    }

    /// The adapter-backed master store
    pub fn master(&self) -> &Arc<dyn FileStore> {
        self.inner.master()
    }
}

impl FileStore for RemoteSyncedFileStore {
    fn identity(&self) -> StoreIdentity {
        self.inner.identity()
    }

    fn list_all(&self) -> Result<Vec<String>> {
        self.inner.list_all()
    }

    fn exists(&self, name: &str) -> Result<bool> {
        self.inner.exists(name)
    }

    fn length(&self, name: &str) -> Result<u64> {
        self.inner.length(name)
    }

    fn modified(&self, name: &str) -> Result<SystemTime> {
        self.inner.modified(name)
    }

    fn set_modified(&self, name: &str, when: SystemTime) -> Result<()> {
        self.inner.set_modified(name, when)
    }

    fn open_read(&self, name: &str) -> Result<Box<dyn ReadHandle>> {
        self.inner.open_read(name)
    }

    fn open_write(&self, name: &str) -> Result<Box<dyn WriteHandle>> {
        self.inner.open_write(name)
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.inner.delete(name)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.inner.rename(from, to)
    }

    fn make_lock(&self, name: &str) -> Box<dyn NamedLock> {
        self.inner.make_lock(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryObjectStore;
    use std::time::Duration;
    use syncio_store::LocalFileStore;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        adapter: Arc<MemoryObjectStore>,
        store: RemoteSyncedFileStore,
    }

    fn fixture(config: SyncConfig) -> Fixture {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MemoryObjectStore::new("idx"));
        let cache = Arc::new(LocalFileStore::open(dir.path().join("cache")).unwrap());
        let mutexes =
            Arc::new(CrossProcessMutexRegistry::new(dir.path().join("mutexes")).unwrap());
        let store = RemoteSyncedFileStore::new(adapter.clone(), cache, mutexes, config);
        Fixture {
            _dir: dir,
            adapter,
            store,
        }
    }

    fn read_all(store: &RemoteSyncedFileStore, name: &str) -> Vec<u8> {
        let mut reader = store.open_read(name).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_read_through_cache() {
        let fx = fixture(SyncConfig::remote());
        fx.adapter
            .upload("_0.cfs", Bytes::from_static(b"AAAA"), 4)
            .unwrap();

        assert_eq!(read_all(&fx.store, "_0.cfs"), b"AAAA");
        assert_eq!(fx.adapter.download_count(), 1);

        // In sync: the second read never goes back to the remote store.
        assert_eq!(read_all(&fx.store, "_0.cfs"), b"AAAA");
        assert_eq!(fx.adapter.download_count(), 1);
    }

    #[test]
    fn test_staleness_tolerance() {
        let fx = fixture(SyncConfig::remote());
        fx.adapter
            .upload("_0.cfs", Bytes::from_static(b"AAAA"), 4)
            .unwrap();
        assert_eq!(read_all(&fx.store, "_0.cfs"), b"AAAA");
        let cached_at = fx.store.cache().modified("_0.cfs").unwrap();

        // Same length, different content, 500ms of skew: tolerated, the
        // cached copy is served and no download happens.
        fx.adapter
            .upload("_0.cfs", Bytes::from_static(b"BBBB"), 4)
            .unwrap();
        fx.adapter
            .touch("_0.cfs", cached_at + Duration::from_millis(500));
        assert_eq!(read_all(&fx.store, "_0.cfs"), b"AAAA");
        assert_eq!(fx.adapter.download_count(), 1);

        // Skew beyond tolerance: re-downloaded.
        fx.adapter.touch("_0.cfs", cached_at + Duration::from_secs(5));
        assert_eq!(read_all(&fx.store, "_0.cfs"), b"BBBB");
        assert_eq!(fx.adapter.download_count(), 2);
    }

    #[test]
    fn test_length_mismatch_redownloads() {
        let fx = fixture(SyncConfig::remote());
        fx.adapter
            .upload("_0.cfs", Bytes::from_static(b"AAAA"), 4)
            .unwrap();
        assert_eq!(read_all(&fx.store, "_0.cfs"), b"AAAA");
        let cached_at = fx.store.cache().modified("_0.cfs").unwrap();

        // Identical timestamp but a different length always re-syncs.
        fx.adapter
            .upload("_0.cfs", Bytes::from_static(b"AAAAAA"), 6)
            .unwrap();
        fx.adapter.touch("_0.cfs", cached_at);
        assert_eq!(read_all(&fx.store, "_0.cfs"), b"AAAAAA");
    }

    #[test]
    fn test_clone_skips_staleness_check() {
        let fx = fixture(SyncConfig::remote());
        fx.adapter
            .upload("_0.cfs", Bytes::from_static(b"0123456789"), 10)
            .unwrap();

        let mut original = fx.store.open_read("_0.cfs").unwrap();
        let mut buf = [0u8; 4];
        original.read_exact(&mut buf).unwrap();
        let downloads_before = fx.adapter.download_count();

        // The remote copy changes; a clone of the open handle keeps
        // serving the already-synced bytes without another round trip.
        fx.adapter
            .upload("_0.cfs", Bytes::from_static(b"XXXXXXXXXX"), 10)
            .unwrap();
        let mut cloned = original.try_clone().expect("clone");
        cloned.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"4567");
        assert_eq!(fx.adapter.download_count(), downloads_before);
    }

    #[test]
    fn test_unreachable_master_serves_cached_copy() {
        let fx = fixture(SyncConfig::remote());
        fx.adapter
            .upload("_0.cfs", Bytes::from_static(b"bytes"), 5)
            .unwrap();
        assert_eq!(read_all(&fx.store, "_0.cfs"), b"bytes");

        // The staleness check cannot reach the master: availability wins.
        fx.adapter.fail_next_properties(1);
        assert_eq!(read_all(&fx.store, "_0.cfs"), b"bytes");

        // A cold file under the same failure is simply absent.
        fx.adapter.fail_next_properties(1);
        assert!(matches!(
            fx.store.open_read("missing"),
            Err(Error::FileNotFound(_))
        ));
    }

    #[test]
    fn test_commit_retries_after_failed_push() {
        let fx = fixture(SyncConfig::remote());
        let mut session = fx.store.open_session("_0.cfs").unwrap();
        session.write_all(b"precious bytes").unwrap();

        fx.adapter.fail_next_uploads(1);
        let err = session.commit().unwrap_err();
        assert!(err.is_transient());
        assert!(!session.is_committed());

        // The cache copy persisted; the retry pushes without regenerating.
        session.commit().unwrap();
        assert!(session.is_committed());
        drop(session);
        assert_eq!(fx.adapter.download("_0.cfs").unwrap(), "precious bytes");
        assert_eq!(read_all(&fx.store, "_0.cfs"), b"precious bytes");
    }

    #[test]
    fn test_compressed_transfers_keep_logical_metadata() {
        let mut config = SyncConfig::remote();
        config.compress_transfers = true;
        let fx = fixture(config);

        let payload = b"searchable searchable searchable searchable ".repeat(64);
        let mut session = fx.store.open_session("_0.cfs").unwrap();
        session.write_all(&payload).unwrap();
        session.commit().unwrap();
        drop(session);

        // The wire payload is gzip; the contract reports logical values.
        let stored = fx.adapter.stored_payload("_0.cfs").unwrap();
        assert!(crate::compress::is_compressed(&stored));
        assert!(stored.len() < payload.len());
        assert_eq!(fx.store.length("_0.cfs").unwrap(), payload.len() as u64);

        // Round trip restores the logical bytes, and the pushed copy is in
        // sync with the cache (no immediate re-download).
        let downloads = fx.adapter.download_count();
        assert_eq!(read_all(&fx.store, "_0.cfs"), payload);
        assert_eq!(fx.adapter.download_count(), downloads);
    }

    #[test]
    fn test_plain_objects_readable_with_compression_on() {
        let mut config = SyncConfig::remote();
        config.compress_transfers = true;
        let fx = fixture(config);

        // Uploaded before compression was switched on.
        fx.adapter
            .upload("legacy", Bytes::from_static(b"plain bytes"), 11)
            .unwrap();
        assert_eq!(read_all(&fx.store, "legacy"), b"plain bytes");
    }

    #[test]
    fn test_delete_removes_both_copies() {
        let fx = fixture(SyncConfig::remote());
        fx.adapter
            .upload("_0.cfs", Bytes::from_static(b"bytes"), 5)
            .unwrap();
        assert_eq!(read_all(&fx.store, "_0.cfs"), b"bytes");

        fx.store.delete("_0.cfs").unwrap();
        assert!(!fx.store.exists("_0.cfs").unwrap());
        assert!(fx.adapter.get_properties("_0.cfs").unwrap().is_none());
        assert!(!fx.store.cache().exists("_0.cfs").unwrap());
    }

    #[test]
    fn test_rename_copies_then_deletes() {
        let fx = fixture(SyncConfig::remote());
        fx.adapter
            .upload("old", Bytes::from_static(b"bytes"), 5)
            .unwrap();
        assert_eq!(read_all(&fx.store, "old"), b"bytes");

        fx.store.rename("old", "new").unwrap();
        assert!(!fx.store.exists("old").unwrap());
        assert_eq!(read_all(&fx.store, "new"), b"bytes");
    }

    #[test]
    fn test_open_checked_rebuilds_cold_cache() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MemoryObjectStore::new("idx"));
        adapter
            .upload("segments", Bytes::from_static(b"gen 1"), 5)
            .unwrap();
        adapter
            .upload("_0.cfs", Bytes::from_static(b"segment bytes"), 13)
            .unwrap();
        let mutexes =
            Arc::new(CrossProcessMutexRegistry::new(dir.path().join("mutexes")).unwrap());

        let (store, flags) = RemoteSyncedFileStore::open_checked(
            adapter.clone(),
            &dir.path().join("cache"),
            mutexes.clone(),
            SyncConfig::remote(),
            HealthConfig::default(),
        )
        .unwrap();
        assert!(flags.contains(OpenFlags::FIXED));
        assert_eq!(read_all(&store, "_0.cfs"), b"segment bytes");
        drop(store);

        // A warm, in-sync cache opens clean.
        let (_, flags) = RemoteSyncedFileStore::open_checked(
            adapter,
            &dir.path().join("cache"),
            mutexes,
            SyncConfig::remote(),
            HealthConfig::default(),
        )
        .unwrap();
        assert_eq!(flags, OpenFlags::OPENED_SUCCESSFULLY);
    }
}
