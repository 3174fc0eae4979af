//! Schedule marks in `schedule_marks`, immediate wakes over LISTEN/NOTIFY.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool};
use tokio::sync::{broadcast, OnceCell};
use tracing::{debug, warn};

use super::{DbError, DbResult};
use crate::scheduler::types::ScheduleType;
use crate::scheduler::wake::{WakeChannel, WAKE_BUFFER};

/// Postgres-backed wake channel shared by all replicas.
#[derive(Clone)]
pub struct PgWakeChannel {
    pool: PgPool,
    channel: String,
    notify: Arc<OnceCell<broadcast::Sender<ScheduleType>>>,
}

impl PgWakeChannel {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
            notify: Arc::new(OnceCell::new()),
        }
    }

    /// Starts the listener task on first use.
    async fn sender(&self) -> DbResult<&broadcast::Sender<ScheduleType>> {
        self.notify
            .get_or_try_init(|| async {
                let mut listener = PgListener::connect_with(&self.pool)
                    .await
                    .map_err(DbError::Query)?;
                listener
                    .listen(&self.channel)
                    .await
                    .map_err(DbError::Query)?;
                let (tx, _) = broadcast::channel(WAKE_BUFFER);
                tokio::spawn(forward_notifications(listener, tx.clone()));
                Ok(tx)
            })
            .await
    }
}

async fn forward_notifications(mut listener: PgListener, tx: broadcast::Sender<ScheduleType>) {
    loop {
        match listener.recv().await {
            Ok(notification) => match notification.payload().parse::<ScheduleType>() {
                Ok(schedule_type) => {
                    // No live subscribers is fine.
                    let _ = tx.send(schedule_type);
                }
                Err(e) => warn!(error = %e, "Ignoring unknown wake payload"),
            },
            Err(e) => {
                // PgListener reconnects on the next recv.
                warn!(error = %e, "Wake listener error");
            }
        }
    }
}

#[async_trait]
impl WakeChannel for PgWakeChannel {
    async fn publish(&self, schedule_type: ScheduleType, immediate: bool) -> DbResult<()> {
        if immediate {
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(&self.channel)
                .bind(schedule_type.as_str())
                .execute(&self.pool)
                .await
                .map_err(DbError::Query)?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO schedule_marks (schedule_type, marked_at)
                VALUES ($1, now())
                ON CONFLICT (schedule_type) DO UPDATE SET marked_at = EXCLUDED.marked_at
                "#,
            )
            .bind(schedule_type.as_str())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        }
        debug!(schedule_type = %schedule_type, immediate, "Published wake signal");
        Ok(())
    }

    async fn load_and_delete_mark(&self, schedule_type: ScheduleType) -> DbResult<bool> {
        let row = sqlx::query(
            "DELETE FROM schedule_marks WHERE schedule_type = $1 RETURNING schedule_type",
        )
        .bind(schedule_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(row.is_some())
    }

    async fn subscribe(&self) -> DbResult<broadcast::Receiver<ScheduleType>> {
        Ok(self.sender().await?.subscribe())
    }
}
