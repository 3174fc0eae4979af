//! # sokovan-events
//!
//! Lifecycle status enums and event definitions shared by the scheduler and
//! anything that subscribes to its event log.
//!
//! ## Event Envelope
//!
//! All events share a common envelope with:
//! - Global ordering (`event_id`, assigned by the log on append)
//! - Aggregate routing (`aggregate_type`, `aggregate_id`)
//! - Audit context (`actor_type`, `actor_id`, `request_id`)
//! - Correlation (`correlation_id`, `causation_id`)
//!
//! ## Event Types
//!
//! - Session events (`session.*`)
//! - Kernel events (`kernel.*`)
//! - Agent events (`agent.*`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
