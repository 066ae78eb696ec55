//! Per-project locks.
//!
//! A [`Lock`] is an exclusive claim on one [`ProjectKey`] by one pull request.
//! At most one lock exists per key. The owner may re-acquire (which
//! re-stamps `locked_at`) and release; everybody else gets
//! [`LockError::Held`] naming the owner.
//!
//! Two implementations share the same decision helpers:
//! - [`FileLockManager`]: durable, one JSON record per key
//! - [`MemoryLockManager`]: in-process, for tests

pub mod file;
pub mod memory;

pub use file::FileLockManager;
pub use memory::MemoryLockManager;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::LockError;
use crate::models::{PrRef, ProjectKey};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    #[serde(flatten)]
    pub project: ProjectKey,
    pub owner_pr: u64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub locked_at: DateTime<Utc>,
}

impl Lock {
    pub fn is_owned_by(&self, pr: &PrRef) -> bool {
        self.project.repo == pr.repo && self.owner_pr == pr.number
    }
}

/// Lock store operations. Every mutation is linearizable per key and
/// durable (for durable stores) before it returns.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Take or re-stamp the lock on `key` for `pr`.
    async fn try_acquire(&self, key: &ProjectKey, pr: &PrRef) -> Result<Lock, LockError>;

    /// Release `key` if `pr` owns it. Returns the released lock.
    async fn release(&self, key: &ProjectKey, pr: &PrRef) -> Result<Lock, LockError>;

    /// Release every lock owned by `pr` and nothing else.
    async fn release_all(&self, pr: &PrRef) -> Result<Vec<Lock>, LockError>;

    /// All locks, ordered by key.
    async fn list(&self) -> Result<Vec<Lock>, LockError>;

    async fn get(&self, key: &ProjectKey) -> Result<Option<Lock>, LockError>;

    /// Locks owned by `pr`, ordered by key.
    async fn locked_by(&self, pr: &PrRef) -> Result<Vec<Lock>, LockError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|lock| lock.is_owned_by(pr))
            .collect())
    }
}

/// Outcome of `try_acquire` given the current record.
pub(crate) fn decide_acquire(
    existing: Option<&Lock>,
    key: &ProjectKey,
    pr: &PrRef,
    now: DateTime<Utc>,
) -> Result<Lock, LockError> {
    match existing {
        Some(lock) if !lock.is_owned_by(pr) => Err(LockError::Held {
            project: key.clone(),
            by_pr: lock.owner_pr,
        }),
        _ => Ok(Lock {
            project: key.clone(),
            owner_pr: pr.number,
            locked_at: now,
        }),
    }
}

/// Outcome of `release` given the current record.
pub(crate) fn decide_release(
    existing: Option<Lock>,
    key: &ProjectKey,
    pr: &PrRef,
) -> Result<Lock, LockError> {
    match existing {
        None => Err(LockError::NotLocked {
            project: key.clone(),
        }),
        Some(lock) if !lock.is_owned_by(pr) => Err(LockError::NotOwner {
            project: key.clone(),
            owner: lock.owner_pr,
        }),
        Some(lock) => Ok(lock),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_record_format() {
        let lock = Lock {
            project: ProjectKey::new("acme/infra", "staging", "default"),
            owner_pr: 7,
            locked_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        let json: serde_json::Value = serde_json::to_value(&lock).unwrap();
        assert_eq!(json["repo"], "acme/infra");
        assert_eq!(json["dir"], "staging");
        assert_eq!(json["workspace"], "default");
        assert_eq!(json["owner_pr"], 7);
        assert_eq!(json["locked_at"], 1_700_000_000);
    }

    #[test]
    fn test_decide_acquire_restamps_for_owner() {
        let key = contract::key("x");
        let earlier = DateTime::from_timestamp(1, 0).unwrap();
        let later = DateTime::from_timestamp(2, 0).unwrap();
        let existing = decide_acquire(None, &key, &contract::pr(1), earlier).unwrap();
        let again = decide_acquire(Some(&existing), &key, &contract::pr(1), later).unwrap();
        assert_eq!(again.locked_at, later);
        assert!(decide_acquire(Some(&existing), &key, &contract::pr(2), later).is_err());
    }
}
