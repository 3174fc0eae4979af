//! Scheduler error types.

use sokovan_id::SessionId;

use crate::db::DbError;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur during a scheduler tick.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("database error: {0}")]
    Database(#[from] DbError),

    /// Referenced data is missing or malformed for one session.
    #[error("integrity error for session {session_id}: {reason}")]
    Integrity {
        session_id: SessionId,
        reason: String,
    },

    #[error("handler {handler} failed: {reason}")]
    Handler {
        handler: &'static str,
        reason: String,
    },
}

/// Error type returned by hooks and post-processing.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;
