//! Event envelope - the common wrapper for all events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sokovan_id::{EventId, RequestId};

use crate::EventError;

/// Actor type for audit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A human user acting through an access key.
    User,
    /// A fleet agent reporting its own state.
    Agent,
    /// The scheduler itself.
    #[default]
    System,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::Agent => write!(f, "agent"),
            ActorType::System => write!(f, "system"),
        }
    }
}

/// Aggregate type for event routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    Session,
    Kernel,
    Agent,
}

impl std::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggregateType::Session => "session",
            AggregateType::Kernel => "kernel",
            AggregateType::Agent => "agent",
        };
        write!(f, "{}", s)
    }
}

/// The event envelope - common metadata for all events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    /// Globally monotonic event identifier, `None` until the log assigns one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// The type of aggregate this event belongs to.
    pub aggregate_type: AggregateType,

    /// The ID of the aggregate instance.
    pub aggregate_id: String,

    /// The event type (e.g., "session.status_changed").
    pub event_type: String,

    /// Schema version for this event type.
    pub event_version: i32,

    /// Type of actor that triggered the event.
    pub actor_type: ActorType,

    /// Identifier of the actor.
    pub actor_id: String,

    /// Request correlation ID for tracing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,

    /// Grouping ID for related events, e.g. all transitions of one tick.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Event ID of the event that caused this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<EventId>,

    /// Event-specific payload.
    pub payload: P,
}

impl<P> EventEnvelope<P> {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder<P> {
        EventEnvelopeBuilder::new()
    }
}

impl<P: Serialize> EventEnvelope<P> {
    /// Converts the payload to JSON, keeping the envelope metadata.
    pub fn into_json(self) -> Result<EventEnvelope<serde_json::Value>, EventError> {
        Ok(EventEnvelope {
            event_id: self.event_id,
            occurred_at: self.occurred_at,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            event_version: self.event_version,
            actor_type: self.actor_type,
            actor_id: self.actor_id,
            request_id: self.request_id,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            payload: serde_json::to_value(self.payload)?,
        })
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug)]
pub struct EventEnvelopeBuilder<P> {
    occurred_at: Option<DateTime<Utc>>,
    aggregate_type: Option<AggregateType>,
    aggregate_id: Option<String>,
    event_type: Option<String>,
    event_version: i32,
    actor_type: ActorType,
    actor_id: String,
    request_id: Option<RequestId>,
    correlation_id: Option<String>,
    causation_id: Option<EventId>,
    payload: Option<P>,
}

impl<P> EventEnvelopeBuilder<P> {
    pub fn new() -> Self {
        Self {
            occurred_at: None,
            aggregate_type: None,
            aggregate_id: None,
            event_type: None,
            event_version: 1,
            actor_type: ActorType::System,
            actor_id: "scheduler".to_string(),
            request_id: None,
            correlation_id: None,
            causation_id: None,
            payload: None,
        }
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn aggregate(mut self, agg_type: AggregateType, agg_id: impl Into<String>) -> Self {
        self.aggregate_type = Some(agg_type);
        self.aggregate_id = Some(agg_id.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn event_version(mut self, version: i32) -> Self {
        self.event_version = version;
        self
    }

    pub fn actor(mut self, actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        self.actor_type = actor_type;
        self.actor_id = actor_id.into();
        self
    }

    pub fn request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn causation_id(mut self, id: EventId) -> Self {
        self.causation_id = Some(id);
        self
    }

    pub fn payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the event envelope, failing on the first missing required field.
    pub fn build(self) -> Result<EventEnvelope<P>, EventError> {
        Ok(EventEnvelope {
            event_id: None,
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            aggregate_type: self
                .aggregate_type
                .ok_or(EventError::MissingField("aggregate_type"))?,
            aggregate_id: self
                .aggregate_id
                .ok_or(EventError::MissingField("aggregate_id"))?,
            event_type: self
                .event_type
                .ok_or(EventError::MissingField("event_type"))?,
            event_version: self.event_version,
            actor_type: self.actor_type,
            actor_id: self.actor_id,
            request_id: self.request_id,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            payload: self.payload.ok_or(EventError::MissingField("payload"))?,
        })
    }
}

impl<P> Default for EventEnvelopeBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_type_serialization() {
        assert_eq!(serde_json::to_string(&ActorType::User).unwrap(), "\"user\"");
        assert_eq!(serde_json::to_string(&ActorType::Agent).unwrap(), "\"agent\"");
        assert_eq!(
            serde_json::to_string(&ActorType::System).unwrap(),
            "\"system\""
        );
    }

    #[test]
    fn test_aggregate_type_display() {
        assert_eq!(AggregateType::Session.to_string(), "session");
        assert_eq!(AggregateType::Kernel.to_string(), "kernel");
        assert_eq!(AggregateType::Agent.to_string(), "agent");
    }

    #[test]
    fn test_event_envelope_builder() {
        let envelope = EventEnvelope::<serde_json::Value>::builder()
            .aggregate(AggregateType::Session, "sess_01HV4Z2WQXKJNM8GPQY6VBKC3D")
            .event_type("session.status_changed")
            .request_id(RequestId::new())
            .payload(serde_json::json!({"to_status": "RUNNING"}))
            .build()
            .unwrap();

        assert_eq!(envelope.event_type, "session.status_changed");
        assert_eq!(envelope.event_version, 1);
        assert_eq!(envelope.actor_type, ActorType::System);
        assert!(envelope.event_id.is_none());
    }

    #[test]
    fn test_event_envelope_builder_missing_payload() {
        let err = EventEnvelope::<serde_json::Value>::builder()
            .aggregate(AggregateType::Agent, "i-node-1")
            .event_type("agent.joined")
            .build()
            .unwrap_err();

        assert_eq!(err, EventError::MissingField("payload"));
    }

    #[test]
    fn test_envelope_into_json_keeps_metadata() {
        let envelope = EventEnvelope::builder()
            .aggregate(AggregateType::Kernel, "kern_01HV4Z2WQXKJNM8GPQY6VBKC3D")
            .event_type("kernel.status_changed")
            .correlation_id("tick-1")
            .payload(vec![1, 2, 3])
            .build()
            .unwrap()
            .into_json()
            .unwrap();

        assert_eq!(envelope.correlation_id.as_deref(), Some("tick-1"));
        assert_eq!(envelope.payload, serde_json::json!([1, 2, 3]));
    }
}
