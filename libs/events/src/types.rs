//! Lifecycle statuses and event payloads.
//!
//! Statuses are persisted and serialized in their upper-case form
//! (`"RUNNING"`), which is also what `as_str` and `FromStr` use.

use serde::{Deserialize, Serialize};
use sokovan_id::{AgentId, KernelId, SessionId};

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Session
    pub const SESSION_STATUS_CHANGED: &str = "session.status_changed";
    pub const SESSION_TERMINATION_REQUESTED: &str = "session.termination_requested";

    // Kernel
    pub const KERNEL_STATUS_CHANGED: &str = "kernel.status_changed";

    // Agent
    pub const AGENT_JOINED: &str = "agent.joined";
    pub const AGENT_REJOINED: &str = "agent.rejoined";
    pub const AGENT_UPDATED: &str = "agent.updated";
}

// =============================================================================
// Status Enums
// =============================================================================

macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Every variant, in lifecycle order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Returns the persisted spelling of this status.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = EventError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(EventError::UnknownStatus {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

status_enum! {
    /// Session lifecycle status.
    ///
    /// Moves forward only, except that `Pending` and `Pulling` may short-circuit
    /// to `Cancelled`.
    SessionStatus, "session" {
        Pending => "PENDING",
        Scheduled => "SCHEDULED",
        Preparing => "PREPARING",
        Pulling => "PULLING",
        Prepared => "PREPARED",
        Creating => "CREATING",
        Running => "RUNNING",
        Terminating => "TERMINATING",
        Terminated => "TERMINATED",
        Error => "ERROR",
        Cancelled => "CANCELLED",
    }
}

impl SessionStatus {
    /// Statuses from which a termination request cancels instead of terminates.
    pub const CANCELLABLE: &'static [SessionStatus] =
        &[SessionStatus::Pending, SessionStatus::Pulling];

    /// Whether the session has finished its lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Terminated | SessionStatus::Cancelled)
    }

    /// Whether a termination request should be treated as a no-op.
    pub fn is_termination_skipped(&self) -> bool {
        matches!(
            self,
            SessionStatus::Terminating | SessionStatus::Terminated | SessionStatus::Cancelled
        )
    }

    /// Whether a termination request cancels the session directly.
    pub fn is_cancellable(&self) -> bool {
        Self::CANCELLABLE.contains(self)
    }
}

status_enum! {
    /// Kernel lifecycle status, mirroring the session lifecycle per container.
    KernelStatus, "kernel" {
        Pending => "PENDING",
        Scheduled => "SCHEDULED",
        Preparing => "PREPARING",
        Pulling => "PULLING",
        Prepared => "PREPARED",
        Creating => "CREATING",
        Running => "RUNNING",
        Terminating => "TERMINATING",
        Terminated => "TERMINATED",
        Error => "ERROR",
        Cancelled => "CANCELLED",
    }
}

impl KernelStatus {
    /// Whether the kernel is gone and needs no destroy call.
    pub fn is_dead(&self) -> bool {
        matches!(self, KernelStatus::Terminated | KernelStatus::Cancelled)
    }

    /// Whether the kernel still holds resources on its agent.
    pub fn occupies_agent_resources(&self) -> bool {
        !matches!(
            self,
            KernelStatus::Pending | KernelStatus::Terminated | KernelStatus::Cancelled
        )
    }

    /// Statuses an agent report may move a kernel out of, for the given target.
    ///
    /// An empty slice means the target is never accepted from a report.
    pub fn allowed_predecessors(target: KernelStatus) -> &'static [KernelStatus] {
        use KernelStatus::*;
        match target {
            Pulling => &[Scheduled, Preparing],
            Prepared => &[Scheduled, Preparing, Pulling],
            Creating => &[Prepared],
            Running => &[Prepared, Creating],
            Terminated => &[
                Scheduled,
                Preparing,
                Pulling,
                Prepared,
                Creating,
                Running,
                Terminating,
                Error,
            ],
            Error => &[Scheduled, Preparing, Pulling, Prepared, Creating, Running],
            Pending | Scheduled | Preparing | Terminating | Cancelled => &[],
        }
    }
}

status_enum! {
    /// Agent liveness status.
    AgentStatus, "agent" {
        Alive => "ALIVE",
        Lost => "LOST",
        Restarting => "RESTARTING",
        Terminated => "TERMINATED",
    }
}

// =============================================================================
// Event Payloads
// =============================================================================

// -----------------------------------------------------------------------------
// Session Events
// -----------------------------------------------------------------------------

/// One session's transition within a status-change batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTransition {
    pub session_id: SessionId,
    pub from_status: SessionStatus,
}

/// Emitted once per batched status update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatusChangedPayload {
    pub to_status: SessionStatus,
    pub scaling_group: String,
    pub transitions: Vec<SessionTransition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Emitted when a termination request moved sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTerminationRequestedPayload {
    pub cancelled: Vec<SessionId>,
    pub terminating: Vec<SessionId>,
    pub reason: String,
}

// -----------------------------------------------------------------------------
// Kernel Events
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelStatusChangedPayload {
    pub kernel_id: KernelId,
    pub session_id: SessionId,
    pub from_status: KernelStatus,
    pub to_status: KernelStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// -----------------------------------------------------------------------------
// Agent Events
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentJoinedPayload {
    pub agent_id: AgentId,
    pub addr: String,
    pub scaling_group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRejoinedPayload {
    pub agent_id: AgentId,
    pub addr: String,
    pub previous_status: AgentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentUpdatedPayload {
    pub agent_id: AgentId,
    pub changed_fields: Vec<String>,
}

// =============================================================================
// Tests
// =============================================================================
