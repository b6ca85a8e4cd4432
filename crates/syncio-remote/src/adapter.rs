//! Remote object adapter
//!
//! The remote SDK is an injected capability, not a dependency: anything
//! that can list, stat, upload, download and delete named blobs can serve
//! as a master store.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::SystemTime;
use syncio_common::{Error, Result, StoreIdentity};

/// Metadata the remote store reports for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectProperties {
    /// Logical (uncompressed) length in bytes.
    ///
    /// Adapters storing compressed payloads record the logical length at
    /// upload time and report it here; staleness decisions always compare
    /// logical lengths.
    pub length: u64,
    /// Remote-assigned modification time
    pub modified: SystemTime,
}

/// Capability interface over a remote blob-style store.
///
/// All calls are blocking. Transport failures surface as
/// [`Error::RemoteUnavailable`] or [`Error::Io`] - transient, retried by
/// callers, never treated as corruption.
pub trait RemoteObjectAdapter: Send + Sync {
    /// Identity of the remote container (URL or similar)
    fn identity(&self) -> StoreIdentity;

    /// Enumerate all object names
    fn list_all(&self) -> Result<Vec<String>>;

    /// Properties of one object, `None` when it does not exist
    fn get_properties(&self, name: &str) -> Result<Option<ObjectProperties>>;

    /// Download the stored payload of one object
    fn download(&self, name: &str) -> Result<Bytes>;

    /// Upload a payload, recording `logical_length` for `get_properties`
    fn upload(&self, name: &str, payload: Bytes, logical_length: u64) -> Result<()>;

    /// Upload only when the object does not exist yet; returns whether the
    /// upload happened.
    ///
    /// The default is an exists-check followed by an upload, which is
    /// inherently racy between processes. Backing stores that support
    /// conditional (if-not-exists) writes must override this with the real
    /// primitive.
    fn upload_if_absent(&self, name: &str, payload: Bytes, logical_length: u64) -> Result<bool> {
        if self.get_properties(name)?.is_some() {
            return Ok(false);
        }
        self.upload(name, payload, logical_length)?;
        Ok(true)
    }

    /// Delete an object. Deleting a missing object is not an error.
    fn delete(&self, name: &str) -> Result<()>;
}

struct StoredObject {
    payload: Bytes,
    logical_length: u64,
    modified: SystemTime,
}

/// In-memory adapter used by tests across the workspace.
///
/// Supports fault injection (fail the next N calls of an operation) and
/// call counting, so tests can assert that staleness decisions avoided a
/// round trip or that a retry actually retried.
pub struct MemoryObjectStore {
    identity: StoreIdentity,
    objects: Mutex<HashMap<String, StoredObject>>,
    downloads: AtomicU64,
    uploads: AtomicU64,
    fail_properties: AtomicU32,
    fail_downloads: AtomicU32,
    fail_uploads: AtomicU32,
    fail_deletes: AtomicU32,
}

impl MemoryObjectStore {
    /// Create an empty store identified as `mem://<name>`
    pub fn new(name: &str) -> Self {
        Self {
            identity: StoreIdentity::new(format!("mem://{name}")),
            objects: Mutex::new(HashMap::new()),
            downloads: AtomicU64::new(0),
            uploads: AtomicU64::new(0),
            fail_properties: AtomicU32::new(0),
            fail_downloads: AtomicU32::new(0),
            fail_uploads: AtomicU32::new(0),
            fail_deletes: AtomicU32::new(0),
        }
    }

    /// Number of downloads served so far
    pub fn download_count(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    /// Number of uploads accepted so far
    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }

    /// Overwrite the remote-assigned modification time of one object
    pub fn touch(&self, name: &str, when: SystemTime) -> bool {
        match self.objects.lock().get_mut(name) {
            Some(object) => {
                object.modified = when;
                true
            }
            None => false,
        }
    }

    /// The raw stored payload (compressed form when compression is on)
    pub fn stored_payload(&self, name: &str) -> Option<Bytes> {
        self.objects.lock().get(name).map(|o| o.payload.clone())
    }

    /// Fail the next `n` property lookups
    pub fn fail_next_properties(&self, n: u32) {
        self.fail_properties.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` downloads
    pub fn fail_next_downloads(&self, n: u32) {
        self.fail_downloads.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` uploads
    pub fn fail_next_uploads(&self, n: u32) {
        self.fail_uploads.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` deletes
    pub fn fail_next_deletes(&self, n: u32) {
        self.fail_deletes.store(n, Ordering::SeqCst);
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl RemoteObjectAdapter for MemoryObjectStore {
    fn identity(&self) -> StoreIdentity {
        self.identity.clone()
    }

    fn list_all(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.objects.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn get_properties(&self, name: &str) -> Result<Option<ObjectProperties>> {
        if Self::take_fault(&self.fail_properties) {
            return Err(Error::RemoteUnavailable("injected properties fault".into()));
        }
        Ok(self.objects.lock().get(name).map(|o| ObjectProperties {
            length: o.logical_length,
            modified: o.modified,
        }))
    }

    fn download(&self, name: &str) -> Result<Bytes> {
        if Self::take_fault(&self.fail_downloads) {
            return Err(Error::RemoteUnavailable("injected download fault".into()));
        }
        self.downloads.fetch_add(1, Ordering::Relaxed);
        match self.objects.lock().get(name) {
            Some(object) => Ok(object.payload.clone()),
            None => Err(Error::FileNotFound(name.to_string())),
        }
    }

    fn upload(&self, name: &str, payload: Bytes, logical_length: u64) -> Result<()> {
        if Self::take_fault(&self.fail_uploads) {
            return Err(Error::RemoteUnavailable("injected upload fault".into()));
        }
        self.uploads.fetch_add(1, Ordering::Relaxed);
        self.objects.lock().insert(
            name.to_string(),
            StoredObject {
                payload,
                logical_length,
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    /// Race-free: the check and the insert happen under one map lock, the
    /// in-memory equivalent of a conditional write.
    fn upload_if_absent(&self, name: &str, payload: Bytes, logical_length: u64) -> Result<bool> {
        if Self::take_fault(&self.fail_uploads) {
            return Err(Error::RemoteUnavailable("injected upload fault".into()));
        }
        let mut objects = self.objects.lock();
        if objects.contains_key(name) {
            return Ok(false);
        }
        self.uploads.fetch_add(1, Ordering::Relaxed);
        objects.insert(
            name.to_string(),
            StoredObject {
                payload,
                logical_length,
                modified: SystemTime::now(),
            },
        );
        Ok(true)
    }

    fn delete(&self, name: &str) -> Result<()> {
        if Self::take_fault(&self.fail_deletes) {
            return Err(Error::RemoteUnavailable("injected delete fault".into()));
        }
        self.objects.lock().remove(name);
        Ok(())
    }
}
