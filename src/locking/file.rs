//! Durable lock store.
//!
//! Layout: `<data_dir>/locks/<sha256(key)>.json`, one record per project key,
//! plus `<data_dir>/locks/.store.lock` held with an exclusive advisory lock
//! for as long as the store is open.
//!
//! Every write goes to a temp file in the same directory, is fsynced,
//! renamed over the record and then the directory is fsynced, so a record
//! is either fully present or absent after a crash. Writes for one key are
//! serialized through a per-key async mutex; reads take no lock.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use super::{Lock, LockManager, decide_acquire, decide_release};
use crate::errors::LockError;
use crate::models::{PrRef, ProjectKey};

const STORE_LOCK_FILE: &str = ".store.lock";
const RECORD_EXT: &str = "json";

pub struct FileLockManager {
    dir: PathBuf,
    key_mutexes: Mutex<HashMap<ProjectKey, Arc<tokio::sync::Mutex<()>>>>,
    // Held for the lifetime of the store; the OS drops the flock on close.
    _store_lock: File,
}

impl std::fmt::Debug for FileLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLockManager")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl FileLockManager {
    /// Open (creating if needed) the store under `<data_dir>/locks`.
    ///
    /// Fails with [`LockError::StoreBusy`] if another process has it open.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, LockError> {
        let dir = locks_dir(data_dir.as_ref());
        fs::create_dir_all(&dir).map_err(|source| io_err(&dir, source))?;

        let lock_path = dir.join(STORE_LOCK_FILE);
        let store_lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|source| io_err(&lock_path, source))?;
        store_lock
            .try_lock_exclusive()
            .map_err(|_| LockError::StoreBusy(dir.clone()))?;

        tracing::info!(dir = %dir.display(), "opened lock store");
        Ok(Self {
            dir,
            key_mutexes: Mutex::new(HashMap::new()),
            _store_lock: store_lock,
        })
    }

    /// Read every record without opening the store. Used by the CLI to
    /// inspect a store that a running server holds.
    pub fn snapshot(data_dir: impl AsRef<Path>) -> Result<Vec<Lock>, LockError> {
        let dir = locks_dir(data_dir.as_ref());
        if !dir.exists() {
            return Ok(Vec::new());
        }
        list_records(&dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, key: &ProjectKey) -> PathBuf {
        record_path(&self.dir, key)
    }

    fn key_mutex(&self, key: &ProjectKey) -> Result<Arc<tokio::sync::Mutex<()>>, LockError> {
        let mut map = self
            .key_mutexes
            .lock()
            .map_err(|e| LockError::TaskFailed(format!("key mutex table poisoned: {}", e)))?;
        Ok(map.entry(key.clone()).or_default().clone())
    }

    /// Drop the key's mutex once no writer holds or waits on it.
    fn prune_key_mutex(&self, key: &ProjectKey) {
        if let Ok(mut map) = self.key_mutexes.lock()
            && map.get(key).is_some_and(|m| Arc::strong_count(m) == 1)
        {
            map.remove(key);
        }
    }

    #[cfg(test)]
    fn key_mutex_count(&self) -> usize {
        self.key_mutexes.lock().map(|map| map.len()).unwrap_or_default()
    }

    async fn read(&self, key: &ProjectKey) -> Result<Option<Lock>, LockError> {
        let path = self.record_path(key);
        let key = key.clone();
        blocking(move || read_record(&path, &key)).await
    }

    // Callers hold the key's mutex.
    async fn acquire_locked(&self, key: &ProjectKey, pr: &PrRef) -> Result<Lock, LockError> {
        let existing = self.read(key).await?;
        let lock = decide_acquire(existing.as_ref(), key, pr, Utc::now())?;

        let dir = self.dir.clone();
        let path = self.record_path(key);
        let record = lock.clone();
        blocking(move || write_record(&dir, &path, &record)).await?;

        tracing::debug!(project = %key, pr = pr.number, "lock acquired");
        Ok(lock)
    }

    async fn release_locked(&self, key: &ProjectKey, pr: &PrRef) -> Result<Lock, LockError> {
        let existing = self.read(key).await?;
        let lock = decide_release(existing, key, pr)?;

        let dir = self.dir.clone();
        let path = self.record_path(key);
        blocking(move || remove_record(&dir, &path)).await?;

        tracing::debug!(project = %key, pr = pr.number, "lock released");
        Ok(lock)
    }
}

#[async_trait]
impl LockManager for FileLockManager {
    async fn try_acquire(&self, key: &ProjectKey, pr: &PrRef) -> Result<Lock, LockError> {
        let mutex = self.key_mutex(key)?;
        let result = {
            let _guard = mutex.lock().await;
            self.acquire_locked(key, pr).await
        };
        drop(mutex);
        self.prune_key_mutex(key);
        result
    }

    async fn release(&self, key: &ProjectKey, pr: &PrRef) -> Result<Lock, LockError> {
        let mutex = self.key_mutex(key)?;
        let result = {
            let _guard = mutex.lock().await;
            self.release_locked(key, pr).await
        };
        drop(mutex);
        self.prune_key_mutex(key);
        result
    }

    async fn release_all(&self, pr: &PrRef) -> Result<Vec<Lock>, LockError> {
        let mut released = Vec::new();
        for lock in self.locked_by(pr).await? {
            match self.release(&lock.project, pr).await {
                Ok(lock) => released.push(lock),
                // Released or re-owned since the listing.
                Err(LockError::NotLocked { .. } | LockError::NotOwner { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(released)
    }

    async fn list(&self) -> Result<Vec<Lock>, LockError> {
        let dir = self.dir.clone();
        blocking(move || list_records(&dir)).await
    }

    async fn get(&self, key: &ProjectKey) -> Result<Option<Lock>, LockError> {
        self.read(key).await
    }
}

fn locks_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("locks")
}

fn record_path(dir: &Path, key: &ProjectKey) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(key.repo.as_bytes());
    hasher.update(b"\n");
    hasher.update(key.dir.as_bytes());
    hasher.update(b"\n");
    hasher.update(key.workspace.as_bytes());
    dir.join(format!("{}.{}", hex::encode(hasher.finalize()), RECORD_EXT))
}

fn io_err(path: &Path, source: std::io::Error) -> LockError {
    LockError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Run blocking store I/O off the async workers.
async fn blocking<F, R>(f: F) -> Result<R, LockError>
where
    F: FnOnce() -> Result<R, LockError> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LockError::TaskFailed(e.to_string()))?
}

fn parse_record(path: &Path, raw: &[u8]) -> Result<Lock, LockError> {
    serde_json::from_slice(raw).map_err(|e| LockError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn read_record(path: &Path, key: &ProjectKey) -> Result<Option<Lock>, LockError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(io_err(path, source)),
    };
    let lock = parse_record(path, &raw)?;
    if lock.project != *key {
        return Err(LockError::Corrupt {
            path: path.to_path_buf(),
            message: format!("record is for {}, expected {}", lock.project, key),
        });
    }
    Ok(Some(lock))
}

fn write_record(dir: &Path, path: &Path, lock: &Lock) -> Result<(), LockError> {
    write_json_atomic(dir, path, lock).map_err(|source| io_err(path, source))
}

/// Replace `path` with `value` as pretty JSON: temp file in `dir`, fsync,
/// rename, fsync of `dir`.
pub(crate) fn write_json_atomic<T: Serialize>(
    dir: &Path,
    path: &Path,
    value: &T,
) -> std::io::Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value).map_err(std::io::Error::other)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    fsync_dir(dir)
}

fn remove_record(dir: &Path, path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => return Err(io_err(path, source)),
    }
    sync_dir(dir)
}

fn sync_dir(dir: &Path) -> Result<(), LockError> {
    fsync_dir(dir).map_err(|source| io_err(dir, source))
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn list_records(dir: &Path) -> Result<Vec<Lock>, LockError> {
    let entries = fs::read_dir(dir).map_err(|source| io_err(dir, source))?;
    let mut locks = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| io_err(dir, source))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
            continue;
        }
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            // Removed between read_dir and read.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(source) => return Err(io_err(&path, source)),
        };
        match parse_record(&path, &raw) {
            Ok(lock) => locks.push(lock),
            Err(e) => tracing::warn!(error = %e, "skipping corrupt lock record"),
        }
    }
    locks.sort_by(|a, b| a.project.cmp(&b.project));
    Ok(locks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::contract;

    fn open_store() -> (tempfile::TempDir, FileLockManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLockManager::open(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let (_dir, store) = open_store();
        contract::acquire_is_exclusive(&store).await;
    }

    #[tokio::test]
    async fn test_reacquire_is_idempotent() {
        let (_dir, store) = open_store();
        contract::reacquire_is_idempotent(&store).await;
    }

    #[tokio::test]
    async fn test_release_requires_owner() {
        let (_dir, store) = open_store();
        contract::release_requires_owner(&store).await;
    }

    #[tokio::test]
    async fn test_release_all_only_touches_owner() {
        let (_dir, store) = open_store();
        contract::release_all_only_touches_owner(&store).await;
    }

    #[tokio::test]
    async fn test_locked_by_filters() {
        let (_dir, store) = open_store();
        contract::locked_by_filters(&store).await;
    }

    #[tokio::test]
    async fn test_record_is_written_atomically_as_json() {
        let (_dir, store) = open_store();
        let key = contract::key("staging");
        store.try_acquire(&key, &contract::pr(3)).await.unwrap();

        let raw = std::fs::read_to_string(store.record_path(&key)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["owner_pr"], 3);
        assert_eq!(value["workspace"], "default");

        // Only the record and the store lock remain; no temp files.
        let names: Vec<String> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2, "unexpected files: {names:?}");
    }

    #[tokio::test]
    async fn test_key_mutexes_are_pruned() {
        let (_dir, store) = open_store();
        for dir in ["a", "b", "c"] {
            store
                .try_acquire(&contract::key(dir), &contract::pr(1))
                .await
                .unwrap();
        }
        assert_eq!(store.key_mutex_count(), 0);

        // A failed acquire and a release leave nothing behind either.
        assert!(store.try_acquire(&contract::key("a"), &contract::pr(2)).await.is_err());
        store.release_all(&contract::pr(1)).await.unwrap();
        assert_eq!(store.key_mutex_count(), 0);
    }

    #[tokio::test]
    async fn test_second_open_is_busy() {
        let (dir, _store) = open_store();
        assert!(matches!(
            FileLockManager::open(dir.path()),
            Err(LockError::StoreBusy(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_record_isolated_to_its_key() {
        let (_dir, store) = open_store();
        let good = contract::key("good");
        let bad = contract::key("bad");
        store.try_acquire(&good, &contract::pr(1)).await.unwrap();
        std::fs::write(store.record_path(&bad), b"{ not json").unwrap();

        let err = store.get(&bad).await.unwrap_err();
        assert!(matches!(err, LockError::Corrupt { .. }));
        assert!(matches!(
            store.try_acquire(&bad, &contract::pr(1)).await,
            Err(LockError::Corrupt { .. })
        ));

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].project, good);
        store.try_acquire(&contract::key("other"), &contract::pr(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_reads_without_store_lock() {
        let (dir, store) = open_store();
        store
            .try_acquire(&contract::key("staging"), &contract::pr(1))
            .await
            .unwrap();
        let locks = FileLockManager::snapshot(dir.path()).unwrap();
        assert_eq!(locks.len(), 1);

        let empty = tempfile::tempdir().unwrap();
        assert!(FileLockManager::snapshot(empty.path()).unwrap().is_empty());
    }
}
