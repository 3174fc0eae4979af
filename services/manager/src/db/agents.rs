//! Postgres implementation of [`AgentRepository`].

use async_trait::async_trait;
use chrono::Utc;
use sokovan_id::AgentId;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;

use super::{parse_column, slots_column, slots_to_json, DbError, DbResult};
use crate::agents::registry::{
    plan_heartbeat, AgentHeartbeat, AgentRecord, AgentRepository, HeartbeatOutcome, HeartbeatPlan,
};

const AGENT_COLUMNS: &str = "id, status, addr, public_key, scaling_group, region, architecture, \
     version, available_slots, occupied_slots, compute_plugins, first_contact, status_changed";

const INSERT_AGENT: &str = r#"
    INSERT INTO agents (
        id, status, addr, public_key, scaling_group, region, architecture,
        version, available_slots, occupied_slots, compute_plugins,
        first_contact, status_changed
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
    ON CONFLICT (id) DO NOTHING
"#;

const UPDATE_AGENT: &str = r#"
    UPDATE agents
    SET status = $2, addr = $3, public_key = $4, scaling_group = $5,
        region = $6, architecture = $7, version = $8, available_slots = $9,
        occupied_slots = $10, compute_plugins = $11, first_contact = $12,
        status_changed = $13
    WHERE id = $1
"#;

fn agent_from_row(row: &PgRow) -> DbResult<AgentRecord> {
    let decode = |row: &PgRow| -> Result<AgentRecord, sqlx::Error> {
        let plugins: serde_json::Value = row.try_get("compute_plugins")?;
        Ok(AgentRecord {
            id: parse_column(row, "id")?,
            status: parse_column(row, "status")?,
            addr: row.try_get("addr")?,
            public_key: row.try_get("public_key")?,
            scaling_group: row.try_get("scaling_group")?,
            region: row.try_get("region")?,
            architecture: row.try_get("architecture")?,
            version: row.try_get("version")?,
            available_slots: slots_column(row, "available_slots")?,
            occupied_slots: slots_column(row, "occupied_slots")?,
            compute_plugins: serde_json::from_value(plugins).map_err(|e| {
                sqlx::Error::ColumnDecode {
                    index: "compute_plugins".to_string(),
                    source: Box::new(e),
                }
            })?,
            first_contact: row.try_get("first_contact")?,
            status_changed: row.try_get("status_changed")?,
        })
    };
    decode(row).map_err(|e| DbError::Decode {
        entity: "agent",
        id: row.try_get::<String, _>("id").unwrap_or_default(),
        reason: e.to_string(),
    })
}

/// Agent rows in Postgres.
#[derive(Clone)]
pub struct PgAgentRepository {
    pool: PgPool,
}

impl PgAgentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_agent(
        tx: &mut Transaction<'_, Postgres>,
        agent_id: &AgentId,
    ) -> DbResult<Option<AgentRecord>> {
        let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = $1 FOR UPDATE");
        sqlx::query(&sql)
            .bind(agent_id.as_str())
            .fetch_optional(&mut **tx)
            .await?
            .map(|row| agent_from_row(&row))
            .transpose()
    }

    /// Writes `plan`, returning false when an insert lost the race against a
    /// concurrent first heartbeat for the same agent.
    async fn write(tx: &mut Transaction<'_, Postgres>, plan: &HeartbeatPlan) -> DbResult<bool> {
        let Some(record) = plan.record() else {
            return Ok(true);
        };
        let sql = match plan {
            HeartbeatPlan::Insert(_) => INSERT_AGENT,
            _ => UPDATE_AGENT,
        };
        let written = sqlx::query(sql)
            .bind(record.id.as_str())
            .bind(record.status.as_str())
            .bind(&record.addr)
            .bind(&record.public_key)
            .bind(&record.scaling_group)
            .bind(&record.region)
            .bind(&record.architecture)
            .bind(&record.version)
            .bind(slots_to_json(&record.available_slots)?)
            .bind(slots_to_json(&record.occupied_slots)?)
            .bind(serde_json::to_value(&record.compute_plugins)?)
            .bind(record.first_contact)
            .bind(record.status_changed)
            .execute(&mut **tx)
            .await?;
        Ok(written.rows_affected() > 0)
    }
}

#[async_trait]
impl AgentRepository for PgAgentRepository {
    async fn apply_heartbeat(
        &self,
        agent_id: &AgentId,
        heartbeat: &AgentHeartbeat,
    ) -> DbResult<HeartbeatOutcome> {
        let mut tx = self.pool.begin().await?;
        let existing = Self::lock_agent(&mut tx, agent_id).await?;
        let mut plan = plan_heartbeat(existing.as_ref(), agent_id, heartbeat, Utc::now());
        if !Self::write(&mut tx, &plan).await? {
            // Another replica registered the agent first; its row is now
            // committed and can be locked.
            let existing = Self::lock_agent(&mut tx, agent_id).await?;
            if existing.is_none() {
                return Err(DbError::Unavailable(format!(
                    "agent {agent_id} conflicted on insert but is not visible"
                )));
            }
            plan = plan_heartbeat(existing.as_ref(), agent_id, heartbeat, Utc::now());
            Self::write(&mut tx, &plan).await?;
        }
        tx.commit().await?;

        let outcome = plan.outcome(agent_id);
        debug!(agent_id = %agent_id, kind = ?outcome.kind, "Applied heartbeat");
        Ok(outcome)
    }

    async fn get_agent(&self, agent_id: &AgentId) -> DbResult<Option<AgentRecord>> {
        let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = $1");
        sqlx::query(&sql)
            .bind(agent_id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| agent_from_row(&row))
            .transpose()
    }
}
