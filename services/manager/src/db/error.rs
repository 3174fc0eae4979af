//! Database error types.

use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}. Run from repo root or services/manager.")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// A stored value could not be decoded into its domain type.
    #[error("corrupt {entity} row {id}: {reason}")]
    Decode {
        entity: &'static str,
        id: String,
        reason: String,
    },

    /// The backing store refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// An event could not be built.
    #[error("event error: {0}")]
    Event(#[from] sokovan_events::EventError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        DbError::Query(err)
    }
}

/// Result type for store operations.
pub type DbResult<T> = Result<T, DbError>;
