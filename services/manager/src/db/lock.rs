//! Lease locks stored in `scheduler_locks`.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::debug;

use super::{DbError, DbResult};
use crate::scheduler::lock::{DistributedLock, LockLease};
use crate::scheduler::types::LockId;

/// Postgres-backed lock service.
///
/// A lease row is taken over only once its `expires_at` has passed, so a
/// crashed replica blocks others for at most one TTL.
#[derive(Clone)]
pub struct PgLockService {
    pool: PgPool,
    holder: String,
}

impl PgLockService {
    pub fn new(pool: PgPool, holder: impl Into<String>) -> Self {
        Self {
            pool,
            holder: holder.into(),
        }
    }
}

#[async_trait]
impl DistributedLock for PgLockService {
    async fn acquire(&self, lock_id: LockId, ttl: Duration) -> DbResult<Option<LockLease>> {
        let token = uuid::Uuid::new_v4().to_string();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        let row = sqlx::query(
            r#"
            INSERT INTO scheduler_locks (lock_id, holder, token, acquired_at, expires_at)
            VALUES ($1, $2, $3, now(), now() + make_interval(secs => $4::double precision / 1000))
            ON CONFLICT (lock_id) DO UPDATE
                SET holder = EXCLUDED.holder,
                    token = EXCLUDED.token,
                    acquired_at = EXCLUDED.acquired_at,
                    expires_at = EXCLUDED.expires_at
                WHERE scheduler_locks.expires_at < now()
            RETURNING token
            "#,
        )
        .bind(lock_id.as_str())
        .bind(&self.holder)
        .bind(&token)
        .bind(ttl_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        let Some(row) = row else {
            debug!(lock_id = %lock_id, "Lock held by another replica");
            return Ok(None);
        };
        Ok(Some(LockLease {
            lock_id,
            holder: self.holder.clone(),
            token: row.get("token"),
        }))
    }

    async fn release(&self, lease: LockLease) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM scheduler_locks WHERE lock_id = $1 AND token = $2")
            .bind(lease.lock_id.as_str())
            .bind(&lease.token)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        if result.rows_affected() == 0 {
            debug!(lock_id = %lease.lock_id, "Lease already expired or taken over");
        }
        Ok(())
    }
}
