//! Database layer for the manager.
//!
//! This module provides:
//! - Connection pool management
//! - Event log appends
//! - Session, kernel and agent repositories
//! - Lease locks and schedule marks shared by scheduler replicas
//! - An in-memory store with the same contracts, for tests and dev runs
//!
//! The database layer uses SQLx with Postgres.

mod agents;
mod error;
mod event_store;
mod lock;
pub mod memory;
mod sessions;
mod wake;

pub use agents::PgAgentRepository;
pub use error::{DbError, DbResult};
pub use event_store::{AppendEvent, EventStore};
pub use lock::PgLockService;
pub use memory::MemoryStore;
pub use sessions::PgSchedulerRepository;
pub use wake::PgWakeChannel;

use std::str::FromStr;
use std::time::Duration;

use sokovan_resource::ResourceSlot;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/sokovan".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/sokovan".to_string());

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        Self {
            database_url,
            max_connections,
            min_connections,
            ..Default::default()
        }
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn connect(config: &DbConfig) -> DbResult<Self> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        info!("Database connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database is reachable.
    pub async fn health_check(&self) -> DbResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    /// Run pending migrations.
    ///
    /// Production deployments run migrations out of band; this is for dev mode.
    pub async fn run_migrations(&self) -> DbResult<()> {
        info!("Running database migrations");

        let candidates = vec![
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("services/manager/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator.run(&self.pool).await.map_err(DbError::Migration)?;
                    info!("Database migrations complete");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(DbError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    pub fn event_store(&self) -> EventStore {
        EventStore::new(self.pool.clone())
    }

    pub fn scheduler_repository(&self) -> PgSchedulerRepository {
        PgSchedulerRepository::new(self.pool.clone())
    }

    pub fn agent_repository(&self) -> PgAgentRepository {
        PgAgentRepository::new(self.pool.clone())
    }

    /// Lock service whose leases are tagged with `holder`.
    pub fn lock_service(&self, holder: impl Into<String>) -> PgLockService {
        PgLockService::new(self.pool.clone(), holder)
    }

    /// Wake channel notifying over the Postgres channel `channel`.
    pub fn wake_channel(&self, channel: impl Into<String>) -> PgWakeChannel {
        PgWakeChannel::new(self.pool.clone(), channel)
    }
}

// =============================================================================
// Row decoding helpers
// =============================================================================

fn column_decode_error(column: &str, reason: impl std::fmt::Display) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: reason.to_string().into(),
    }
}

/// Reads a text column and parses it into `T`.
pub(crate) fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e| column_decode_error(column, e))
}

pub(crate) fn parse_optional_column<T>(row: &PgRow, column: &str) -> Result<Option<T>, sqlx::Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| s.parse().map_err(|e| column_decode_error(column, e)))
        .transpose()
}

/// Reads a JSONB resource-slot column.
pub(crate) fn slots_column(row: &PgRow, column: &str) -> Result<ResourceSlot, sqlx::Error> {
    let raw: serde_json::Value = row.try_get(column)?;
    serde_json::from_value(raw).map_err(|e| column_decode_error(column, e))
}

pub(crate) fn optional_slots_column(
    row: &PgRow,
    column: &str,
) -> Result<Option<ResourceSlot>, sqlx::Error> {
    let raw: Option<serde_json::Value> = row.try_get(column)?;
    raw.map(|v| serde_json::from_value(v).map_err(|e| column_decode_error(column, e)))
        .transpose()
}

pub(crate) fn slots_to_json(slots: &ResourceSlot) -> DbResult<serde_json::Value> {
    Ok(serde_json::to_value(slots)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
        assert!(config.database_url.ends_with("/sokovan"));
    }

    #[test]
    fn test_slots_json_shape() {
        let slots = ResourceSlot::from_user_input([("cpu", "2"), ("mem", "1g")]).unwrap();
        let value = slots_to_json(&slots).unwrap();
        let back: ResourceSlot = serde_json::from_value(value).unwrap();
        assert_eq!(back, slots);
    }
}
