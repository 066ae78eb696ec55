use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use super::{Lock, LockManager, decide_acquire, decide_release};
use crate::errors::LockError;
use crate::models::{PrRef, ProjectKey};

/// In-process lock table. Not durable.
#[derive(Debug, Default)]
pub struct MemoryLockManager {
    locks: Mutex<BTreeMap<ProjectKey, Lock>>,
    writes: AtomicUsize,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutations applied so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn table(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<ProjectKey, Lock>>, LockError> {
        self.locks
            .lock()
            .map_err(|e| LockError::TaskFailed(format!("lock table poisoned: {}", e)))
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn try_acquire(&self, key: &ProjectKey, pr: &PrRef) -> Result<Lock, LockError> {
        let mut table = self.table()?;
        let lock = decide_acquire(table.get(key), key, pr, Utc::now())?;
        table.insert(key.clone(), lock.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(lock)
    }

    async fn release(&self, key: &ProjectKey, pr: &PrRef) -> Result<Lock, LockError> {
        let mut table = self.table()?;
        let lock = decide_release(table.get(key).cloned(), key, pr)?;
        table.remove(key);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(lock)
    }

    async fn release_all(&self, pr: &PrRef) -> Result<Vec<Lock>, LockError> {
        let mut table = self.table()?;
        let owned: Vec<ProjectKey> = table
            .values()
            .filter(|lock| lock.is_owned_by(pr))
            .map(|lock| lock.project.clone())
            .collect();
        let released: Vec<Lock> = owned.iter().filter_map(|key| table.remove(key)).collect();
        if !released.is_empty() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(released)
    }

    async fn list(&self) -> Result<Vec<Lock>, LockError> {
        Ok(self.table()?.values().cloned().collect())
    }

    async fn get(&self, key: &ProjectKey) -> Result<Option<Lock>, LockError> {
        Ok(self.table()?.get(key).cloned())
    }
}
