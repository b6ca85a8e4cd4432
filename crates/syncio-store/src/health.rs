//! Open-time health check and cache rebuild
//!
//! Runs once per store-open, before any handle is issued. Inspects both the
//! master and the local cache for structural corruption and recovers along
//! the least-lossy path available. Every rebuild populates a brand-new
//! generation folder and swaps it in atomically; files of an old generation
//! are only ever deleted, never mutated, so readers holding handles into it
//! keep working.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use syncio_common::{Error, HealthConfig, OpenFlags, Result, SyncConfig};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::local::LocalFileStore;
use crate::mutex::CrossProcessMutexRegistry;
use crate::store::{FileStore, copy_file};
use crate::synced::SyncedFileStore;

/// Prefix of finished generation folders. Names sort chronologically, so
/// the newest generation is discoverable without external bookkeeping.
const GENERATION_PREFIX: &str = "gen-";

/// Prefix of in-flight rebuild folders, renamed away on completion.
const TMP_PREFIX: &str = ".tmp-";

/// Structural state of one copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    /// The mandatory structural file exists and is fully readable
    Healthy,
    /// The mandatory structural file is absent (or the copy unreachable)
    Missing,
    /// The mandatory structural file exists but cannot be read
    Unreadable,
}

impl Health {
    fn is_healthy(self) -> bool {
        self == Health::Healthy
    }
}

/// Find the current generation folder under a cache root.
///
/// The current generation is the one with the greatest finished name; a
/// root with no finished generation yet has none.
pub fn current_generation(cache_root: &Path) -> Result<Option<PathBuf>> {
    let entries = match fs::read_dir(cache_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut newest: Option<PathBuf> = None;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(GENERATION_PREFIX) {
            continue;
        }
        let path = entry.path();
        let replace = match &newest {
            Some(current) => current.file_name() < path.file_name(),
            None => true,
        };
        if replace {
            newest = Some(path);
        }
    }
    Ok(newest)
}

/// Name for the generation after `previous`, strictly greater in sort
/// order even when the clock has not advanced.
fn next_generation_name(previous: Option<&Path>) -> String {
    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let (secs, seq) = match previous
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .and_then(parse_generation_name)
    {
        Some((prev_secs, prev_seq)) if now_secs <= prev_secs => (prev_secs, prev_seq + 1),
        _ => (now_secs, 0),
    };
    format!("{GENERATION_PREFIX}{secs:016}-{seq:04}")
}

fn parse_generation_name(name: &str) -> Option<(u64, u32)> {
    let rest = name.strip_prefix(GENERATION_PREFIX)?;
    let (secs, seq) = rest.split_once('-')?;
    Some((secs.parse().ok()?, seq.parse().ok()?))
}

/// Validates master and cache at open time and rebuilds whatever is
/// recoverable.
pub struct CacheRebuilder {
    sync: SyncConfig,
    health: HealthConfig,
}

impl CacheRebuilder {
    /// Create a rebuilder with the given tuning
    pub fn new(sync: SyncConfig, health: HealthConfig) -> Self {
        Self { sync, health }
    }

    /// Validate and recover, returning what happened plus the cache store
    /// for the current generation.
    ///
    /// Never fails for recoverable situations: stale, missing or
    /// recoverably-corrupt copies degrade through the decision table and
    /// report their path in the returned flags. The only failures are
    /// transient I/O (retry) and the untrustworthy-and-creation-disallowed
    /// corruption case.
    pub fn open(
        &self,
        master: &Arc<dyn FileStore>,
        cache_root: &Path,
    ) -> Result<(OpenFlags, LocalFileStore)> {
        fs::create_dir_all(cache_root)?;
        self.cleanup_stale(cache_root);

        let current = current_generation(cache_root)?;
        let cache = match &current {
            Some(path) => Some(LocalFileStore::open(path)?),
            None => None,
        };

        let master_files = match master.list_all() {
            Ok(names) => Some(names),
            Err(err) => {
                warn!(%err, "master enumeration failed during health check");
                None
            }
        };
        let cache_files = match &cache {
            Some(store) => store.list_all()?,
            None => Vec::new(),
        };

        // Brand-new store: nothing on either side means nothing was lost.
        if master_files.as_ref().is_some_and(|f| f.is_empty()) && cache_files.is_empty() {
            let store = self.empty_generation(cache_root, current.as_deref())?;
            return Ok((OpenFlags::OPENED_SUCCESSFULLY, store));
        }

        let master_health = check_health(master.as_ref(), &self.health.required_file);
        let cache_health = match &cache {
            Some(store) => check_health(store, &self.health.required_file),
            None => Health::Missing,
        };

        if master_health.is_healthy() && cache_health.is_healthy() {
            if let Some(store) = &cache {
                if self.cache_in_sync(master.as_ref(), store)? {
                    let store = LocalFileStore::open(store.root())?;
                    return Ok((OpenFlags::OPENED_SUCCESSFULLY, store));
                }
            }
        }

        if master_health.is_healthy() {
            // Cache unhealthy, absent or out of sync: rebuild it from the
            // master.
            if self.health.allow_repair {
                info!("cache unusable, rebuilding from master");
                let store = self.rebuild(master.as_ref(), cache_root)?;
                let mut flags = OpenFlags::FIXED | OpenFlags::NOT_CLEAN;
                if cache_health != Health::Healthy {
                    flags |= OpenFlags::MISSING_SEGMENTS;
                }
                return Ok((flags, store));
            }
            return self.give_up(master.as_ref(), cache_root);
        }

        if let Some(store) = cache {
            if cache_health.is_healthy() {
                // The cache is the most recent known-good copy: push it up.
                if self.health.allow_repair {
                    info!("master unusable, restoring it from the local cache");
                    self.sync_from_local(master.as_ref(), &store)?;
                    let flags = OpenFlags::SYNCED_FROM_LOCAL
                        | OpenFlags::NOT_CLEAN
                        | OpenFlags::MISSING_SEGMENTS;
                    return Ok((flags, store));
                }
                return self.give_up(master.as_ref(), cache_root);
            }
        }

        self.give_up(master.as_ref(), cache_root)
    }

    /// One-call variant wiring the recovered cache into a synced store.
    pub fn open_synced(
        &self,
        master: Arc<dyn FileStore>,
        cache_root: &Path,
        mutexes: Arc<CrossProcessMutexRegistry>,
    ) -> Result<(SyncedFileStore, OpenFlags)> {
        let (flags, cache) = self.open(&master, cache_root)?;
        let store = SyncedFileStore::new(master, Arc::new(cache), mutexes, self.sync.clone());
        Ok((store, flags))
    }

    /// Rebuild the cache as a new generation populated from the master.
    ///
    /// The folder is populated under a temporary name and renamed to its
    /// final sortable name only once every file is in place; the rename is
    /// the swap. Older generations are then retired.
    pub fn rebuild(&self, master: &dyn FileStore, cache_root: &Path) -> Result<LocalFileStore> {
        fs::create_dir_all(cache_root)?;
        let staging_path = cache_root.join(format!("{TMP_PREFIX}{}", Uuid::new_v4()));
        let staging = LocalFileStore::open(&staging_path)?;

        for name in master.list_all()? {
            copy_file(master, &staging, &name, self.sync.copy_buffer_size)?;
            match master.record(&name) {
                Ok(rec) => {
                    if let Err(err) = staging.set_modified(&name, rec.modified) {
                        warn!(file = %name, %err, "could not reconcile rebuilt timestamp");
                    }
                }
                Err(err) => {
                    warn!(file = %name, %err, "could not read master timestamp during rebuild")
                }
            }
        }

        let previous = current_generation(cache_root)?;
        let final_path = cache_root.join(next_generation_name(previous.as_deref()));
        fs::rename(&staging_path, &final_path)?;
        debug!(generation = %final_path.display(), "cache generation swapped in");

        self.retire_generations(cache_root, &final_path);
        LocalFileStore::open(&final_path)
    }

    /// Push every cache file up into the master and drop master leftovers
    /// that the known-good cache does not have.
    fn sync_from_local(&self, master: &dyn FileStore, cache: &LocalFileStore) -> Result<()> {
        let cache_files = cache.list_all()?;
        if let Ok(master_files) = master.list_all() {
            for name in master_files {
                if !cache_files.contains(&name) {
                    master.delete(&name)?;
                }
            }
        }
        for name in &cache_files {
            copy_file(cache, master, name, self.sync.copy_buffer_size)?;
            match master.modified(name) {
                Ok(when) => {
                    if let Err(err) = cache.set_modified(name, when) {
                        warn!(file = %name, %err, "could not reconcile timestamp after push");
                    }
                }
                Err(err) => warn!(file = %name, %err, "could not read master timestamp after push"),
            }
        }
        Ok(())
    }

    /// Neither copy is trustworthy (or repair is disallowed): discard both
    /// and initialize a fresh empty index, or fail if even that is off.
    fn give_up(
        &self,
        master: &dyn FileStore,
        cache_root: &Path,
    ) -> Result<(OpenFlags, LocalFileStore)> {
        if !self.health.create_on_corrupt {
            return Err(Error::Corrupt(
                "neither master nor cache holds a usable index".to_string(),
            ));
        }
        warn!("discarding both copies and starting a fresh empty index; previous data is lost");

        match master.list_all() {
            Ok(names) => {
                for name in names {
                    if let Err(err) = master.delete(&name) {
                        warn!(file = %name, %err, "could not discard corrupt master file");
                    }
                }
            }
            Err(err) => warn!(%err, "could not enumerate corrupt master for discard"),
        }
        master
            .open_write(&self.health.required_file)
            .and_then(|writer| writer.finish())?;

        let store = self.rebuild(master, cache_root)?;
        Ok((
            OpenFlags::CORRUPT_CREATED_NEW | OpenFlags::NOT_CLEAN | OpenFlags::MISSING_SEGMENTS,
            store,
        ))
    }

    /// Create (or keep) an empty current generation for a brand-new store.
    fn empty_generation(
        &self,
        cache_root: &Path,
        current: Option<&Path>,
    ) -> Result<LocalFileStore> {
        if let Some(path) = current {
            return LocalFileStore::open(path);
        }
        let staging_path = cache_root.join(format!("{TMP_PREFIX}{}", Uuid::new_v4()));
        fs::create_dir_all(&staging_path)?;
        let final_path = cache_root.join(next_generation_name(None));
        fs::rename(&staging_path, &final_path)?;
        LocalFileStore::open(&final_path)
    }

    /// Every master/cache copy agrees on length and (tolerant) timestamp.
    fn cache_in_sync(&self, master: &dyn FileStore, cache: &LocalFileStore) -> Result<bool> {
        for name in master.list_all()? {
            let master_rec = match master.record(&name) {
                Ok(rec) => rec,
                Err(Error::FileNotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            match cache.record(&name) {
                Ok(rec) if rec.in_sync_with(&master_rec, self.sync.skew_tolerance) => {}
                Ok(_) | Err(Error::FileNotFound(_)) => return Ok(false),
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }

    /// Remove generations other than `keep`. A folder a concurrent reader
    /// still holds open stays behind as an orphan for the next open's
    /// cleanup pass rather than blocking.
    fn retire_generations(&self, cache_root: &Path, keep: &Path) {
        let Ok(entries) = fs::read_dir(cache_root) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if !path.is_dir() || path == keep || !name.starts_with(GENERATION_PREFIX) {
                continue;
            }
            if let Err(err) = fs::remove_dir_all(&path) {
                warn!(generation = %path.display(), %err, "old generation left for later cleanup");
            }
        }
    }

    /// Drop leftovers of crashed rebuilds and orphaned generations.
    fn cleanup_stale(&self, cache_root: &Path) {
        let keep = current_generation(cache_root).ok().flatten();
        let Ok(entries) = fs::read_dir(cache_root) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_tmp = name.starts_with(TMP_PREFIX);
            let is_old_gen =
                name.starts_with(GENERATION_PREFIX) && Some(&path) != keep.as_ref();
            if is_tmp || is_old_gen {
                if let Err(err) = fs::remove_dir_all(&path) {
                    warn!(path = %path.display(), %err, "stale cache folder left in place");
                }
            }
        }
    }
}

/// Inspect one copy: the mandatory structural file must exist and be fully
/// readable. An unreachable store counts as missing - indistinguishable
/// from absence, and the decision table treats both the same way.
fn check_health(store: &dyn FileStore, required_file: &str) -> Health {
    match store.open_read(required_file) {
        Ok(mut reader) => {
            let mut sink = Vec::new();
            match reader.read_to_end(&mut sink) {
                Ok(_) => Health::Healthy,
                Err(err) => {
                    warn!(file = required_file, %err, "structural file unreadable");
                    Health::Unreadable
                }
            }
        }
        Err(Error::FileNotFound(_)) => Health::Missing,
        Err(err) => {
            warn!(file = required_file, %err, "structural file inaccessible");
            Health::Missing
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn put(store: &dyn FileStore, name: &str, bytes: &[u8]) {
        let mut writer = store.open_write(name).unwrap();
        writer.write_all(bytes).unwrap();
        writer.finish().unwrap();
    }

    fn read_all(store: &dyn FileStore, name: &str) -> Vec<u8> {
        let mut reader = store.open_read(name).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        buf
    }

    fn rebuilder() -> CacheRebuilder {
        CacheRebuilder::new(SyncConfig::default(), HealthConfig::default())
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        master: Arc<dyn FileStore>,
        cache_root: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let master: Arc<dyn FileStore> =
            Arc::new(LocalFileStore::open(dir.path().join("master")).unwrap());
        let cache_root = dir.path().join("cache");
        Fixture {
            master,
            cache_root,
            _dir: dir,
        }
    }

    fn seeded_fixture() -> Fixture {
        let fx = fixture();
        put(fx.master.as_ref(), "segments", b"generation 1");
        put(fx.master.as_ref(), "_0.cfs", b"first segment");
        fx
    }

    #[test]
    fn test_brand_new_store_opens_clean() {
        let fx = fixture();
        let (flags, cache) = rebuilder().open(&fx.master, &fx.cache_root).unwrap();
        assert_eq!(flags, OpenFlags::OPENED_SUCCESSFULLY);
        assert!(cache.list_all().unwrap().is_empty());
        // A current generation folder now exists.
        assert!(current_generation(&fx.cache_root).unwrap().is_some());
    }

    #[test]
    fn test_healthy_and_in_sync_opens_clean() {
        let fx = seeded_fixture();
        let rb = rebuilder();
        let (first, _) = rb.open(&fx.master, &fx.cache_root).unwrap();
        assert!(first.contains(OpenFlags::FIXED)); // cold cache was built

        let (second, cache) = rb.open(&fx.master, &fx.cache_root).unwrap();
        assert_eq!(second, OpenFlags::OPENED_SUCCESSFULLY);
        assert_eq!(read_all(&cache, "_0.cfs"), b"first segment");
    }

    #[test]
    fn test_cache_missing_segment_file_is_fixed() {
        let fx = seeded_fixture();
        let rb = rebuilder();
        let (_, cache) = rb.open(&fx.master, &fx.cache_root).unwrap();

        // Corrupt the cache: drop a segment file from the current generation.
        cache.delete("_0.cfs").unwrap();

        let (flags, cache) = rb.open(&fx.master, &fx.cache_root).unwrap();
        assert!(flags.contains(OpenFlags::FIXED));
        assert!(flags.contains(OpenFlags::NOT_CLEAN));
        assert_eq!(read_all(&cache, "_0.cfs"), b"first segment");
    }

    #[test]
    fn test_cache_missing_required_file_sets_flag() {
        let fx = seeded_fixture();
        let rb = rebuilder();
        let (_, cache) = rb.open(&fx.master, &fx.cache_root).unwrap();
        cache.delete("segments").unwrap();

        let (flags, _) = rb.open(&fx.master, &fx.cache_root).unwrap();
        assert!(flags.contains(OpenFlags::FIXED));
        assert!(flags.contains(OpenFlags::MISSING_SEGMENTS));
    }

    #[test]
    fn test_master_corruption_synced_from_local() {
        let fx = seeded_fixture();
        let rb = rebuilder();
        let (_, _) = rb.open(&fx.master, &fx.cache_root).unwrap();

        // The master loses its structural file; a stray leftover appears.
        fx.master.delete("segments").unwrap();
        put(fx.master.as_ref(), "_9.stray", b"leftover");

        let (flags, _) = rb.open(&fx.master, &fx.cache_root).unwrap();
        assert!(flags.contains(OpenFlags::SYNCED_FROM_LOCAL));

        // The master ends with exactly the known-good cache file set.
        assert_eq!(fx.master.list_all().unwrap(), vec!["_0.cfs", "segments"]);
        assert_eq!(read_all(fx.master.as_ref(), "segments"), b"generation 1");
        assert_eq!(read_all(fx.master.as_ref(), "_0.cfs"), b"first segment");
    }

    #[test]
    fn test_both_corrupt_creates_new() {
        let fx = seeded_fixture();
        let rb = CacheRebuilder::new(
            SyncConfig::default(),
            HealthConfig {
                allow_repair: false,
                ..HealthConfig::default()
            },
        );
        let (_, cache) = rebuilder().open(&fx.master, &fx.cache_root).unwrap();

        // Both sides lose the structural file.
        fx.master.delete("segments").unwrap();
        cache.delete("segments").unwrap();

        let (flags, cache) = rb.open(&fx.master, &fx.cache_root).unwrap();
        assert!(flags.contains(OpenFlags::CORRUPT_CREATED_NEW));
        assert!(flags.contains(OpenFlags::NOT_CLEAN));

        // Explicit, reported data loss: the reopened store is empty.
        assert_eq!(fx.master.list_all().unwrap(), vec!["segments"]);
        assert_eq!(fx.master.length("segments").unwrap(), 0);
        assert_eq!(cache.list_all().unwrap(), vec!["segments"]);
    }

    #[test]
    fn test_both_corrupt_without_creation_fails() {
        let fx = seeded_fixture();
        let (_, cache) = rebuilder().open(&fx.master, &fx.cache_root).unwrap();
        fx.master.delete("segments").unwrap();
        cache.delete("segments").unwrap();

        let rb = CacheRebuilder::new(
            SyncConfig::default(),
            HealthConfig {
                create_on_corrupt: false,
                ..HealthConfig::default()
            },
        );
        assert!(matches!(
            rb.open(&fx.master, &fx.cache_root),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_rebuild_idempotent_and_retires_old_generation() {
        let fx = seeded_fixture();
        let rb = rebuilder();

        let first = rb.rebuild(fx.master.as_ref(), &fx.cache_root).unwrap();
        let first_files = first.list_all().unwrap();
        let first_root = first.root().to_path_buf();

        let second = rb.rebuild(fx.master.as_ref(), &fx.cache_root).unwrap();
        assert_eq!(second.list_all().unwrap(), first_files);
        for name in &first_files {
            assert_eq!(
                read_all(&second, name),
                read_all(fx.master.as_ref(), name)
            );
        }

        // The swap retired the previous generation.
        assert_ne!(second.root(), first_root);
        assert!(!first_root.exists());
        assert_eq!(
            current_generation(&fx.cache_root)
                .unwrap()
                .unwrap()
                .file_name(),
            second.root().file_name()
        );
    }

    #[test]
    fn test_generation_names_sort_forward() {
        let a = next_generation_name(None);
        let b = next_generation_name(Some(Path::new(&a)));
        assert!(b > a, "{b} must sort after {a}");
    }

    #[test]
    fn test_cleanup_removes_crashed_rebuild_leftovers() {
        let fx = seeded_fixture();
        let rb = rebuilder();
        let (_, _) = rb.open(&fx.master, &fx.cache_root).unwrap();

        // Simulate a crashed rebuild and an orphaned old generation.
        let stale_tmp = fx.cache_root.join(".tmp-deadbeef");
        fs::create_dir_all(&stale_tmp).unwrap();
        let orphan = fx.cache_root.join("gen-0000000000000001-0000");
        fs::create_dir_all(&orphan).unwrap();

        let (_, _) = rb.open(&fx.master, &fx.cache_root).unwrap();
        assert!(!stale_tmp.exists());
        assert!(!orphan.exists());
    }

    #[test]
    fn test_open_synced_wires_recovered_cache() {
        let fx = seeded_fixture();
        let dir = tempdir().unwrap();
        let mutexes = Arc::new(CrossProcessMutexRegistry::new(dir.path()).unwrap());

        let (store, flags) = rebuilder()
            .open_synced(fx.master.clone(), &fx.cache_root, mutexes)
            .unwrap();
        assert!(flags.contains(OpenFlags::FIXED));
        assert_eq!(read_all(&store, "_0.cfs"), b"first segment");
    }
}
