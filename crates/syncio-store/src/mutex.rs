//! Cross-process named mutexes
//!
//! OS-level mutual exclusion keyed by (store identity, file name), built on
//! advisory file locks. The lock file is opened per acquisition, so the OS
//! lock is held on that open file description: two threads of one process
//! exclude each other the same way two processes do.
//!
//! Lock files are created world-writable. The protected resource (one cache
//! file) is not security-sensitive, and the priority is never deadlocking a
//! different OS user out of a shared cache. Only a permission error raised
//! while creating the lock file is fatal; everything else degrades to "keep
//! retrying".

use fs4::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use syncio_common::{Error, Result, StoreIdentity};
use tracing::{debug, warn};

use crate::store::LOCK_POLL_INTERVAL;

/// Make a lock file accessible to every principal on the machine.
///
/// Best-effort: the umask may have masked the requested mode at creation,
/// and a different owner may forbid the chmod entirely.
pub(crate) fn grant_permissive_access(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)) {
            debug!(path = %path.display(), %err, "could not widen lock file permissions");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

/// Open (or create) a lock file, recovering from permission problems.
///
/// An existing file that cannot be opened gets its permissions widened and
/// is reopened; a file that cannot be *created* for permission reasons is
/// the fatal case.
pub(crate) fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let open = |create: bool| {
        OpenOptions::new()
            .create(create)
            .read(true)
            .write(true)
            .open(path)
    };
    match open(true) {
        Ok(file) => {
            grant_permissive_access(path);
            Ok(file)
        }
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            if path.exists() {
                // Existing file owned by another principal: widen and reopen.
                grant_permissive_access(path);
                match open(false) {
                    Ok(file) => Ok(file),
                    Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                        Err(Error::LockPermission(path.display().to_string()))
                    }
                    Err(err) => Err(err.into()),
                }
            } else {
                // Creation itself was denied: fatal.
                Err(Error::LockPermission(path.display().to_string()))
            }
        }
        Err(err) => Err(err.into()),
    }
}

/// One system-wide named mutex.
///
/// Obtained through [`CrossProcessMutexRegistry::grab`]; acquisition blocks
/// with no timeout unless one is supplied.
#[derive(Debug)]
pub struct CrossProcessMutex {
    key: String,
    path: PathBuf,
}

impl CrossProcessMutex {
    /// The (identity, name) key this mutex guards
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Path of the backing lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the mutex, blocking the calling thread.
    ///
    /// `timeout: None` waits forever. With a timeout, acquisition polls and
    /// fails with [`Error::LockTimeout`] once the deadline passes.
    pub fn lock(self: Arc<Self>, timeout: Option<Duration>) -> Result<CrossProcessGuard> {
        let file = open_lock_file(&self.path)?;
        match timeout {
            None => {
                file.lock_exclusive()?;
            }
            Some(limit) => {
                let started = Instant::now();
                loop {
                    match file.try_lock_exclusive() {
                        Ok(()) => break,
                        Err(err) if err.kind() == ErrorKind::WouldBlock => {
                            if started.elapsed() >= limit {
                                return Err(Error::LockTimeout {
                                    name: self.key.clone(),
                                    waited_ms: started.elapsed().as_millis() as u64,
                                });
                            }
                            std::thread::sleep(LOCK_POLL_INTERVAL);
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
        Ok(CrossProcessGuard {
            mutex: self,
            file: Some(file),
        })
    }
}

/// Holds a [`CrossProcessMutex`] until dropped.
#[derive(Debug)]
pub struct CrossProcessGuard {
    mutex: Arc<CrossProcessMutex>,
    file: Option<File>,
}

impl CrossProcessGuard {
    /// The key of the mutex this guard holds
    pub fn key(&self) -> &str {
        self.mutex.key()
    }
}

impl Drop for CrossProcessGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(err) = file.unlock() {
                warn!(key = %self.mutex.key, %err, "failed to unlock cross-process mutex");
            }
        }
    }
}

/// Registry of cross-process mutexes for one machine.
///
/// Lock files live under `<root>/<identity-token>/<name>.lock`, where the
/// token is a filesystem-safe hash of the store identity, so unrelated
/// indices never share a directory. One entry per key is cached for the
/// registry's lifetime. An injected instance with explicit create/dispose -
/// deliberately not a process-wide static.
pub struct CrossProcessMutexRegistry {
    root: PathBuf,
    entries: Mutex<HashMap<(StoreIdentity, String), Arc<CrossProcessMutex>>>,
}

impl CrossProcessMutexRegistry {
    /// Create a registry rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Root directory holding the lock files
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the mutex for (identity, name), creating its entry on first
    /// use.
    pub fn grab(&self, identity: &StoreIdentity, name: &str) -> Arc<CrossProcessMutex> {
        let mut entries = self.entries.lock();
        entries
            .entry((identity.clone(), name.to_string()))
            .or_insert_with(|| {
                let path = self
                    .root
                    .join(identity.fs_token())
                    .join(format!("{name}.lock"));
                Arc::new(CrossProcessMutex {
                    key: format!("{identity}/{name}"),
                    path,
                })
            })
            .clone()
    }

    /// Grab and immediately acquire in one step
    pub fn lock(
        &self,
        identity: &StoreIdentity,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<CrossProcessGuard> {
        self.grab(identity, name).lock(timeout)
    }

    /// Number of cached mutex entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no mutex has been grabbed yet
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
