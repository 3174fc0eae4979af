//! Cluster-wide TTL-leased locks.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::types::LockId;
use crate::db::DbResult;

/// Proof of a held lock, handed back on release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub lock_id: LockId,
    pub holder: String,
    pub token: String,
}

/// Lease-based lock shared by all scheduler replicas.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Returns `None` when another holder has an unexpired lease.
    async fn acquire(&self, lock_id: LockId, ttl: Duration) -> DbResult<Option<LockLease>>;

    /// Releases the lease if it is still ours; a lost lease is not an error.
    async fn release(&self, lease: LockLease) -> DbResult<()>;
}

struct HeldLock {
    token: String,
    expires_at: Instant,
}

/// In-process lock service for tests and single-replica runs.
pub struct MemoryLockService {
    holder: String,
    locks: Mutex<HashMap<LockId, HeldLock>>,
}

impl MemoryLockService {
    pub fn new(holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Whether some holder currently has an unexpired lease on `lock_id`.
    pub fn is_held(&self, lock_id: LockId) -> bool {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .get(&lock_id)
            .is_some_and(|held| held.expires_at > Instant::now())
    }

    /// Takes a lease on behalf of another replica.
    pub fn hold_externally(&self, lock_id: LockId, ttl: Duration) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.insert(
            lock_id,
            HeldLock {
                token: "external".to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

impl Default for MemoryLockService {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl DistributedLock for MemoryLockService {
    async fn acquire(&self, lock_id: LockId, ttl: Duration) -> DbResult<Option<LockLease>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if locks.get(&lock_id).is_some_and(|held| held.expires_at > now) {
            return Ok(None);
        }
        let token = uuid::Uuid::new_v4().to_string();
        locks.insert(
            lock_id,
            HeldLock {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(LockLease {
            lock_id,
            holder: self.holder.clone(),
            token,
        }))
    }

    async fn release(&self, lease: LockLease) -> DbResult<()> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&lease.lock_id)
            .is_some_and(|held| held.token == lease.token)
        {
            locks.remove(&lease.lock_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_is_unavailable() {
        let locks = MemoryLockService::default();
        let ttl = Duration::from_secs(60);

        let lease = locks
            .acquire(LockId::SokovanTargetTerminating, ttl)
            .await
            .unwrap()
            .unwrap();
        assert!(locks
            .acquire(LockId::SokovanTargetTerminating, ttl)
            .await
            .unwrap()
            .is_none());
        assert!(locks
            .acquire(LockId::SokovanTargetCreating, ttl)
            .await
            .unwrap()
            .is_some());

        locks.release(lease).await.unwrap();
        assert!(!locks.is_held(LockId::SokovanTargetTerminating));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_can_be_taken_over() {
        let locks = MemoryLockService::default();
        locks.hold_externally(LockId::SokovanTargetRunning, Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(6)).await;

        let lease = locks
            .acquire(LockId::SokovanTargetRunning, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(lease.is_some());
    }

    #[tokio::test]
    async fn test_stale_release_does_not_drop_new_holder() {
        let locks = MemoryLockService::default();
        let stale = LockLease {
            lock_id: LockId::SokovanTargetPending,
            holder: "memory".to_string(),
            token: "old".to_string(),
        };
        locks.hold_externally(LockId::SokovanTargetPending, Duration::from_secs(60));

        locks.release(stale).await.unwrap();

        assert!(locks.is_held(LockId::SokovanTargetPending));
    }
}
