//! Local filesystem store
//!
//! Backs the cache in every variant and serves as the master for
//! shared-filesystem deployments. Writes land in a temp file and are
//! renamed into place on finish, so other processes scanning the directory
//! never observe a partially written file.

use fs4::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use syncio_common::{Error, Result, StoreIdentity};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::mutex::open_lock_file;
use crate::store::{FileStore, NamedLock, ReadHandle, WriteHandle, validate_name};

/// Directory under the store root holding advisory lock files.
const LOCKS_DIR: &str = ".locks";

/// Suffix for in-flight write temp files.
const PARTIAL_SUFFIX: &str = ".partial";

/// A file store rooted at a local directory.
pub struct LocalFileStore {
    root: PathBuf,
    identity: StoreIdentity,
}

impl LocalFileStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    ///
    /// Identity derives from the canonical root path, so every process
    /// opening the same directory agrees on it.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let canonical = root.canonicalize()?;
        Ok(Self {
            identity: StoreIdentity::new(format!("file://{}", canonical.display())),
            root: canonical,
        })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.root.join(LOCKS_DIR).join(format!("{name}.lock"))
    }

    fn metadata(&self, name: &str) -> Result<fs::Metadata> {
        let path = self.path_for(name)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(meta),
            Ok(_) => Err(Error::FileNotFound(name.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(Error::FileNotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl FileStore for LocalFileStore {
    fn identity(&self) -> StoreIdentity {
        self.identity.clone()
    }

    fn list_all(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            // Skip infrastructure artifacts: lock dirs, temp files, dotfiles.
            if name.starts_with('.') || name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        match self.metadata(name) {
            Ok(_) => Ok(true),
            Err(Error::FileNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn length(&self, name: &str) -> Result<u64> {
        Ok(self.metadata(name)?.len())
    }

    fn modified(&self, name: &str) -> Result<SystemTime> {
        Ok(self.metadata(name)?.modified()?)
    }

    fn set_modified(&self, name: &str, when: SystemTime) -> Result<()> {
        let path = self.path_for(name)?;
        let file = match OpenOptions::new().write(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(Error::FileNotFound(name.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        file.set_modified(when)?;
        Ok(())
    }

    fn open_read(&self, name: &str) -> Result<Box<dyn ReadHandle>> {
        let path = self.path_for(name)?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(Error::FileNotFound(name.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let len = file.metadata()?.len();
        Ok(Box::new(LocalReadHandle { path, file, len }))
    }

    fn open_write(&self, name: &str) -> Result<Box<dyn WriteHandle>> {
        let final_path = self.path_for(name)?;
        let tmp_path = self
            .root
            .join(format!(".{}-{}{}", name, Uuid::new_v4(), PARTIAL_SUFFIX));
        let file = File::create(&tmp_path)?;
        Ok(Box::new(LocalWriteHandle {
            name: name.to_string(),
            final_path,
            tmp_path,
            file: Some(file),
        }))
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        // Respect our own advisory locks: a held lock means the file is in
        // use and the whole delete must be refused.
        let lock = self.make_lock(name);
        if lock.is_locked()? {
            return Err(Error::FileBusy(name.to_string()));
        }
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            // Idempotent: deleting a missing file is not an error.
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.path_for(from)?;
        let to_path = self.path_for(to)?;
        match fs::rename(&from_path, &to_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(Error::FileNotFound(from.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn make_lock(&self, name: &str) -> Box<dyn NamedLock> {
        Box::new(FsNamedLock {
            name: name.to_string(),
            path: self.lock_path(name),
            held: parking_lot::Mutex::new(None),
        })
    }
}

/// Read handle over a local file.
struct LocalReadHandle {
    path: PathBuf,
    file: File,
    len: u64,
}

impl Read for LocalReadHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for LocalReadHandle {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

impl ReadHandle for LocalReadHandle {
    fn len(&self) -> u64 {
        self.len
    }

    fn try_clone(&self) -> Option<Box<dyn ReadHandle>> {
        // Reopen for an independent cursor; sharing the fd would share the
        // file offset between scan cursors.
        let position = match (&self.file).stream_position() {
            Ok(pos) => pos,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "clone failed reading position");
                return None;
            }
        };
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "clone failed reopening file");
                return None;
            }
        };
        if let Err(err) = file.seek(SeekFrom::Start(position)) {
            warn!(path = %self.path.display(), %err, "clone failed seeking");
            return None;
        }
        Some(Box::new(LocalReadHandle {
            path: self.path.clone(),
            file,
            len: self.len,
        }))
    }
}

/// Write handle buffering into a temp file, published by rename on finish.
struct LocalWriteHandle {
    name: String,
    final_path: PathBuf,
    tmp_path: PathBuf,
    file: Option<File>,
}

impl Write for LocalWriteHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(std::io::Error::new(
                ErrorKind::Other,
                "write handle already finished",
            )),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl WriteHandle for LocalWriteHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush()?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(())
    }
}

impl Drop for LocalWriteHandle {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            debug!(name = %self.name, "discarding unfinished write");
            if let Err(err) = fs::remove_file(&self.tmp_path) {
                if err.kind() != ErrorKind::NotFound {
                    warn!(path = %self.tmp_path.display(), %err, "failed to remove temp file");
                }
            }
        }
    }
}

/// Advisory lock-file lock scoped to one local store.
struct FsNamedLock {
    name: String,
    path: PathBuf,
    held: parking_lot::Mutex<Option<File>>,
}

impl NamedLock for FsNamedLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_obtain(&self) -> Result<bool> {
        let mut held = self.held.lock();
        if held.is_some() {
            return Ok(false);
        }
        let file = open_lock_file(&self.path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                *held = Some(file);
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn release(&self) -> Result<()> {
        let Some(file) = self.held.lock().take() else {
            return Ok(());
        };
        file.unlock()
            .map_err(|_| Error::LockReleaseFailed(self.name.clone()))?;
        Ok(())
    }

    fn is_locked(&self) -> Result<bool> {
        if self.held.lock().is_some() {
            return Ok(true);
        }
        let file = open_lock_file(&self.path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = file.unlock();
                Ok(false)
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(true),
            Err(err) => Err(err.into()),
        }
    }
}
