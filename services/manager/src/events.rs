//! Best-effort broadcast of lifecycle events.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use sokovan_events::{
    event_types, AggregateType, EventEnvelope, SessionStatus, SessionStatusChangedPayload,
    SessionTransition,
};

use crate::db::{DbError, DbResult};
use crate::scheduler::types::ScheduledSessionData;

/// Sink for lifecycle events.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: EventEnvelope<serde_json::Value>) -> DbResult<()>;
}

/// Builds a JSON envelope for `payload`.
pub fn envelope<P: Serialize>(
    aggregate_type: AggregateType,
    aggregate_id: impl Into<String>,
    event_type: &str,
    payload: P,
) -> DbResult<EventEnvelope<serde_json::Value>> {
    EventEnvelope::builder()
        .aggregate(aggregate_type, aggregate_id)
        .event_type(event_type)
        .payload(serde_json::to_value(payload)?)
        .build()
        .map_err(DbError::from)
}

/// Publishes one batch `session.status_changed` event for `sessions`.
///
/// Does nothing for an empty batch.
pub async fn broadcast_status_change(
    bus: &dyn EventBus,
    to_status: SessionStatus,
    scaling_group: &str,
    sessions: &[ScheduledSessionData],
) -> DbResult<()> {
    let Some(first) = sessions.first() else {
        return Ok(());
    };
    let payload = SessionStatusChangedPayload {
        to_status,
        scaling_group: scaling_group.to_string(),
        transitions: sessions
            .iter()
            .map(|s| SessionTransition {
                session_id: s.session_id,
                from_status: s.from_status,
            })
            .collect(),
        reason: Some(first.reason.clone()),
    };
    let event = envelope(
        AggregateType::Session,
        first.session_id.to_string(),
        event_types::SESSION_STATUS_CHANGED,
        payload,
    )?;
    bus.publish(event).await
}

/// Event bus that keeps everything in memory.
#[derive(Default)]
pub struct RecordingEventBus {
    events: Mutex<Vec<EventEnvelope<serde_json::Value>>>,
    fail: bool,
}

impl RecordingEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus whose every publish fails.
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<EventEnvelope<serde_json::Value>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<EventEnvelope<serde_json::Value>> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

#[async_trait]
impl EventBus for RecordingEventBus {
    async fn publish(&self, event: EventEnvelope<serde_json::Value>) -> DbResult<()> {
        if self.fail {
            return Err(DbError::Unavailable("event bus offline".to_string()));
        }
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }
}
