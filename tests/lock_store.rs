//! Durability and contention of the on-disk lock store.

use std::sync::Arc;

use planlock::errors::LockError;
use planlock::locking::{FileLockManager, LockManager};
use planlock::models::{PrRef, ProjectKey};
use tempfile::TempDir;

fn key(dir: &str) -> ProjectKey {
    ProjectKey::new("acme/infra", dir, "default")
}

fn pr(number: u64) -> PrRef {
    PrRef::new("acme/infra", number)
}

#[tokio::test]
async fn test_locks_survive_restart() {
    let data = TempDir::new().unwrap();
    {
        let store = FileLockManager::open(data.path()).unwrap();
        store.try_acquire(&key("staging"), &pr(1)).await.unwrap();
        store.try_acquire(&key("production"), &pr(2)).await.unwrap();
    }

    let store = FileLockManager::open(data.path()).unwrap();
    let locks = store.list().await.unwrap();
    assert_eq!(locks.len(), 2);
    assert_eq!(store.get(&key("staging")).await.unwrap().unwrap().owner_pr, 1);

    // Ownership is enforced across restarts too.
    let err = store.try_acquire(&key("staging"), &pr(2)).await.unwrap_err();
    assert!(matches!(err, LockError::Held { by_pr: 1, .. }));

    store.release(&key("staging"), &pr(1)).await.unwrap();
    drop(store);

    let store = FileLockManager::open(data.path()).unwrap();
    let locks = store.list().await.unwrap();
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].project, key("production"));
}

#[tokio::test]
async fn test_store_is_single_process() {
    let data = TempDir::new().unwrap();
    let _first = FileLockManager::open(data.path()).unwrap();
    let err = FileLockManager::open(data.path()).unwrap_err();
    assert!(matches!(err, LockError::StoreBusy(_)));

    // Read-only inspection still works.
    assert!(FileLockManager::snapshot(data.path()).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_has_one_winner() {
    let data = TempDir::new().unwrap();
    let store = Arc::new(FileLockManager::open(data.path()).unwrap());

    let attempts: Vec<_> = (1..=16)
        .map(|n| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { (n, store.try_acquire(&key("staging"), &pr(n)).await) })
        })
        .collect();

    let mut winners = Vec::new();
    let mut losers = Vec::new();
    for attempt in attempts {
        let (n, result) = attempt.await.unwrap();
        match result {
            Ok(lock) => {
                assert_eq!(lock.owner_pr, n);
                winners.push(n);
            }
            Err(LockError::Held { by_pr, .. }) => losers.push(by_pr),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(losers.len(), 15);
    assert!(losers.iter().all(|by| *by == winners[0]));
    assert_eq!(
        store.get(&key("staging")).await.unwrap().unwrap().owner_pr,
        winners[0]
    );
}
