//! Per-key lock manager collaborator.
//!
//! The lock manager is the serialization point between normal write traffic
//! and the state transfer consumer: both acquire the same per-key locks, so
//! a concurrent user write and an inbound transfer write for one key are
//! linearized rather than raced.

use crate::error::{Error, Result};
use crate::types::GlobalTransaction;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Entry-level locking collaborator.
#[async_trait]
pub trait LockManager: Send + Sync + std::fmt::Debug {
    /// Acquire all `keys` for `owner`, waiting up to `timeout`.
    /// Re-acquiring keys already held by the same owner succeeds.
    async fn lock(
        &self,
        keys: &[Vec<u8>],
        owner: GlobalTransaction,
        timeout: Duration,
    ) -> Result<()>;

    /// Release the keys held by `owner`. Keys held by other owners are
    /// left untouched.
    fn unlock(&self, keys: &[Vec<u8>], owner: &GlobalTransaction);

    /// Current holder of a key, if any.
    fn holder(&self, key: &[u8]) -> Option<GlobalTransaction>;
}

/// In-memory lock table.
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    locks: DashMap<Vec<u8>, GlobalTransaction>,
    released: Arc<Notify>,
}

impl InMemoryLockManager {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take every key at once; on conflict, roll back the keys taken
    /// in this attempt and report the conflicting key.
    fn try_lock_all(&self, keys: &[Vec<u8>], owner: GlobalTransaction) -> bool {
        let mut acquired: Vec<&Vec<u8>> = Vec::with_capacity(keys.len());
        for key in keys {
            match self.locks.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(owner);
                    acquired.push(key);
                }
                dashmap::mapref::entry::Entry::Occupied(held) => {
                    if *held.get() == owner {
                        continue;
                    }
                    drop(held);
                    for k in acquired {
                        self.locks.remove(k.as_slice());
                    }
                    return false;
                }
            }
        }
        true
    }

    /// Number of currently held keys. Test/diagnostic helper.
    pub fn held_count(&self) -> usize {
        self.locks.len()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn lock(
        &self,
        keys: &[Vec<u8>],
        owner: GlobalTransaction,
        timeout: Duration,
    ) -> Result<()> {
        // Sorted acquisition order prevents deadlock between two owners
        // locking overlapping key sets.
        let mut sorted: Vec<Vec<u8>> = keys.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let deadline = Instant::now() + timeout;
        loop {
            if self.try_lock_all(&sorted, owner) {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            let notified = self.released.notified();
            // Re-check under a bounded wait; a release may have raced in
            // between the failed attempt and registering the waiter.
            let _ = tokio::time::timeout(remaining.min(Duration::from_millis(50)), notified).await;
        }
    }

    fn unlock(&self, keys: &[Vec<u8>], owner: &GlobalTransaction) {
        let mut any = false;
        for key in keys {
            let removed = self
                .locks
                .remove_if(key.as_slice(), |_, holder| holder == owner);
            any |= removed.is_some();
        }
        if any {
            self.released.notify_waiters();
        }
    }

    fn holder(&self, key: &[u8]) -> Option<GlobalTransaction> {
        self.locks.get(key).map(|h| *h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<Vec<u8>> {
        names.iter().map(|n| n.as_bytes().to_vec()).collect()
    }

    #[tokio::test]
    async fn test_lock_unlock_roundtrip() {
        let lm = InMemoryLockManager::new();
        let tx = GlobalTransaction::new(1, 1);
        lm.lock(&keys(&["a", "b"]), tx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(lm.holder(b"a"), Some(tx));
        assert_eq!(lm.held_count(), 2);

        lm.unlock(&keys(&["a", "b"]), &tx);
        assert!(lm.holder(b"a").is_none());
        assert_eq!(lm.held_count(), 0);
    }

    #[tokio::test]
    async fn test_reentrant_lock_same_owner() {
        let lm = InMemoryLockManager::new();
        let tx = GlobalTransaction::new(1, 1);
        lm.lock(&keys(&["a"]), tx, Duration::from_secs(1))
            .await
            .unwrap();
        lm.lock(&keys(&["a", "b"]), tx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(lm.held_count(), 2);
    }

    #[tokio::test]
    async fn test_conflicting_lock_times_out() {
        let lm = InMemoryLockManager::new();
        let tx1 = GlobalTransaction::new(1, 1);
        let tx2 = GlobalTransaction::new(2, 1);
        lm.lock(&keys(&["a"]), tx1, Duration::from_secs(1))
            .await
            .unwrap();

        let err = lm
            .lock(&keys(&["a"]), tx2, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        // The failed attempt must not leave partial locks behind.
        assert_eq!(lm.holder(b"a"), Some(tx1));
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let lm = Arc::new(InMemoryLockManager::new());
        let tx1 = GlobalTransaction::new(1, 1);
        let tx2 = GlobalTransaction::new(2, 1);
        lm.lock(&keys(&["a"]), tx1, Duration::from_secs(1))
            .await
            .unwrap();

        let lm2 = lm.clone();
        let waiter = tokio::spawn(async move {
            lm2.lock(&keys(&["a"]), tx2, Duration::from_secs(2)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        lm.unlock(&keys(&["a"]), &tx1);

        waiter.await.unwrap().unwrap();
        assert_eq!(lm.holder(b"a"), Some(tx2));
    }

    #[tokio::test]
    async fn test_partial_conflict_rolls_back() {
        let lm = InMemoryLockManager::new();
        let tx1 = GlobalTransaction::new(1, 1);
        let tx2 = GlobalTransaction::new(2, 1);
        lm.lock(&keys(&["b"]), tx1, Duration::from_secs(1))
            .await
            .unwrap();

        let err = lm
            .lock(&keys(&["a", "b"]), tx2, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        // "a" must not be stuck held by tx2.
        assert!(lm.holder(b"a").is_none());
    }
}
