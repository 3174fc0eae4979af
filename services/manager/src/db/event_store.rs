//! Append-only event log.
//!
//! Lifecycle broadcasts are persisted here so that downstream consumers can
//! tail the log by `event_id`.

use chrono::{DateTime, Utc};
use sokovan_events::{ActorType, AggregateType, EventEnvelope};
use sokovan_id::EventId;
use sqlx::postgres::PgPool;
use sqlx::Row;

use super::{DbError, DbResult};
use crate::events::EventBus;

/// Input for appending a new event.
#[derive(Debug, Clone)]
pub struct AppendEvent {
    pub occurred_at: DateTime<Utc>,
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
    pub event_type: String,
    pub event_version: i32,
    pub actor_type: ActorType,
    pub actor_id: String,
    pub request_id: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<EventId>,
    pub payload: serde_json::Value,
}

impl From<EventEnvelope<serde_json::Value>> for AppendEvent {
    fn from(envelope: EventEnvelope<serde_json::Value>) -> Self {
        Self {
            occurred_at: envelope.occurred_at,
            aggregate_type: envelope.aggregate_type,
            aggregate_id: envelope.aggregate_id,
            event_type: envelope.event_type,
            event_version: envelope.event_version,
            actor_type: envelope.actor_type,
            actor_id: envelope.actor_id,
            request_id: envelope.request_id.map(|id| id.to_string()),
            correlation_id: envelope.correlation_id,
            causation_id: envelope.causation_id,
            payload: envelope.payload,
        }
    }
}

const INSERT_EVENT: &str = r#"
    INSERT INTO events (
        occurred_at,
        aggregate_type,
        aggregate_id,
        event_type,
        event_version,
        actor_type,
        actor_id,
        request_id,
        correlation_id,
        causation_id,
        payload
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    RETURNING event_id
"#;

/// Event store for managing the append-only event log.
#[derive(Clone)]
pub struct EventStore {
    pool: PgPool,
}

impl EventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append a single event to the log, returning the assigned `event_id`.
    pub async fn append(&self, event: AppendEvent) -> DbResult<EventId> {
        let row = bind_event(sqlx::query(INSERT_EVENT), &event)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(EventId::new(row.get("event_id")))
    }

    /// Append multiple events atomically.
    pub async fn append_batch(&self, events: Vec<AppendEvent>) -> DbResult<Vec<EventId>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        let mut ids = Vec::with_capacity(events.len());
        for event in &events {
            let row = bind_event(sqlx::query(INSERT_EVENT), event)
                .fetch_one(&mut *tx)
                .await
                .map_err(DbError::Query)?;
            ids.push(EventId::new(row.get("event_id")));
        }
        tx.commit().await.map_err(DbError::Query)?;
        Ok(ids)
    }

    /// Highest assigned event id, or 0 for an empty log.
    pub async fn latest_event_id(&self) -> DbResult<EventId> {
        let row = sqlx::query("SELECT COALESCE(MAX(event_id), 0) AS max_id FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(EventId::new(row.get("max_id")))
    }
}

fn bind_event<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    event: &'q AppendEvent,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(event.occurred_at)
        .bind(event.aggregate_type.to_string())
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(event.event_version)
        .bind(event.actor_type.to_string())
        .bind(&event.actor_id)
        .bind(&event.request_id)
        .bind(&event.correlation_id)
        .bind(event.causation_id.map(|id| id.value()))
        .bind(&event.payload)
}

#[async_trait::async_trait]
impl EventBus for EventStore {
    async fn publish(&self, event: EventEnvelope<serde_json::Value>) -> DbResult<()> {
        self.append(event.into()).await.map(|_| ())
    }
}
