//! Postgres implementation of [`SchedulerRepository`].

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use sokovan_events::{KernelStatus, SessionStatus};
use sokovan_id::{AccessKey, AgentId, ProjectId, SessionId, UserId};
use sokovan_resource::{ResourceSlot, SlotName};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, instrument};

use super::{
    optional_slots_column, parse_column, parse_optional_column, slots_column, slots_to_json,
    DbError, DbResult,
};
use crate::admission::{
    KeypairResourcePolicy, PendingSessionInfo, SessionDependencyInfo, SlotType, SystemSnapshot,
};
use crate::scheduler::repository::SchedulerRepository;
use crate::scheduler::types::{
    classify_for_termination, group_kernels, AppliedTransition, KernelInfo, KernelMatchType,
    KernelStatusReport, KernelStatusUpdate, KernelTransition, MarkTerminationResult, SessionInfo,
    SessionStatusBatch, SessionTerminationResult, SessionWithKernels, TerminatedUpdateSummary,
    TerminatingKernelData, TerminatingSessionData, TerminationClass,
};

const SESSION_COLUMNS: &str = "s.id, s.creation_id, s.access_key, s.user_id, s.project_id, \
     s.domain_name, s.scaling_group, s.status, s.status_info, s.requested_slots, \
     s.occupying_slots, s.created_at, s.terminated_at";

const KERNEL_COLUMNS: &str = "k.id, k.session_id, k.status, k.agent_id, k.agent_addr, \
     k.container_id, k.requested_slots, k.occupied_slots";

/// Access keys, users, projects and domains with work waiting in a scaling group.
const PENDING_IN_GROUP: &str =
    "SELECT {col} FROM sessions WHERE scaling_group = $1 AND status = 'PENDING'";

fn pending_scope(column: &str) -> String {
    PENDING_IN_GROUP.replace("{col}", column)
}

fn texts<T: ToString>(items: &[T]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

fn occupying_kernel_statuses() -> Vec<String> {
    KernelStatus::ALL
        .iter()
        .filter(|s| s.occupies_agent_resources())
        .map(|s| s.as_str().to_string())
        .collect()
}

fn limit(value: Option<i32>) -> Option<u32> {
    value.map(|v| u32::try_from(v).unwrap_or(0))
}

fn decode<T>(
    entity: &'static str,
    row: &PgRow,
    f: impl FnOnce(&PgRow) -> Result<T, sqlx::Error>,
) -> DbResult<T> {
    f(row).map_err(|e| DbError::Decode {
        entity,
        id: row.try_get::<String, _>("id").unwrap_or_default(),
        reason: e.to_string(),
    })
}

fn session_from_row(row: &PgRow) -> Result<SessionInfo, sqlx::Error> {
    Ok(SessionInfo {
        id: parse_column(row, "id")?,
        creation_id: row.try_get("creation_id")?,
        access_key: parse_column(row, "access_key")?,
        user_id: parse_column(row, "user_id")?,
        project_id: parse_column(row, "project_id")?,
        domain_name: row.try_get("domain_name")?,
        scaling_group: row.try_get("scaling_group")?,
        status: parse_column(row, "status")?,
        status_info: row.try_get("status_info")?,
        requested_slots: slots_column(row, "requested_slots")?,
        occupying_slots: optional_slots_column(row, "occupying_slots")?,
        created_at: row.try_get("created_at")?,
        terminated_at: row.try_get("terminated_at")?,
    })
}

fn kernel_from_row(row: &PgRow) -> Result<KernelInfo, sqlx::Error> {
    Ok(KernelInfo {
        id: parse_column(row, "id")?,
        session_id: parse_column(row, "session_id")?,
        status: parse_column(row, "status")?,
        agent_id: parse_optional_column(row, "agent_id")?,
        agent_addr: row.try_get("agent_addr")?,
        container_id: row.try_get("container_id")?,
        requested_slots: slots_column(row, "requested_slots")?,
        occupied_slots: optional_slots_column(row, "occupied_slots")?,
    })
}

/// Session and kernel rows in Postgres.
#[derive(Clone)]
pub struct PgSchedulerRepository {
    pool: PgPool,
}

impl PgSchedulerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_kernels(&self, session_ids: &[String]) -> DbResult<Vec<KernelInfo>> {
        let sql = format!(
            "SELECT {KERNEL_COLUMNS} FROM kernels k \
             WHERE k.session_id = ANY($1) ORDER BY k.session_id, k.created_at, k.id"
        );
        let rows = sqlx::query(&sql)
            .bind(session_ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| decode("kernel", row, kernel_from_row))
            .collect()
    }

    async fn attach_kernels(&self, rows: Vec<PgRow>) -> DbResult<Vec<SessionWithKernels>> {
        let sessions = rows
            .iter()
            .map(|row| decode("session", row, session_from_row))
            .collect::<DbResult<Vec<_>>>()?;
        let ids: Vec<String> = sessions.iter().map(|s| s.id.to_string()).collect();
        let mut kernels = group_kernels(self.fetch_kernels(&ids).await?);
        Ok(sessions
            .into_iter()
            .map(|session| SessionWithKernels {
                kernels: kernels.remove(&session.id).unwrap_or_default(),
                session,
            })
            .collect())
    }

    /// Recomputes `occupied_slots` of `agents` from their resource-holding kernels.
    async fn sync_agent_occupancy(
        tx: &mut Transaction<'_, Postgres>,
        agents: &[AgentId],
    ) -> DbResult<usize> {
        if agents.is_empty() {
            return Ok(0);
        }
        let agent_ids = texts(agents);
        let rows = sqlx::query(
            r#"
            SELECT agent_id, COALESCE(occupied_slots, requested_slots) AS slots
            FROM kernels
            WHERE agent_id = ANY($1) AND status = ANY($2)
            "#,
        )
        .bind(&agent_ids)
        .bind(occupying_kernel_statuses())
        .fetch_all(&mut **tx)
        .await?;

        let mut occupancy: HashMap<String, ResourceSlot> =
            agent_ids.iter().map(|id| (id.clone(), ResourceSlot::new())).collect();
        for row in &rows {
            let agent_id: String = row.try_get("agent_id")?;
            let slots = slots_column(row, "slots")?;
            *occupancy.entry(agent_id).or_default() += &slots;
        }

        for (agent_id, slots) in &occupancy {
            sqlx::query("UPDATE agents SET occupied_slots = $2 WHERE id = $1")
                .bind(agent_id)
                .bind(slots_to_json(slots)?)
                .execute(&mut **tx)
                .await?;
        }
        Ok(occupancy.len())
    }
}

#[async_trait]
impl SchedulerRepository for PgSchedulerRepository {
    async fn get_schedulable_scaling_groups(&self) -> DbResult<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM scaling_groups WHERE is_active ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("name")).collect())
    }

    async fn get_sessions_for_handler(
        &self,
        scaling_group: &str,
        statuses: &[SessionStatus],
        kernel_statuses: &[KernelStatus],
        match_type: KernelMatchType,
    ) -> DbResult<Vec<SessionWithKernels>> {
        let kernel_clause = match match_type {
            KernelMatchType::All => {
                "EXISTS (SELECT 1 FROM kernels k WHERE k.session_id = s.id) \
                 AND NOT EXISTS (SELECT 1 FROM kernels k \
                     WHERE k.session_id = s.id AND k.status <> ALL($3))"
            }
            KernelMatchType::Any => {
                "EXISTS (SELECT 1 FROM kernels k \
                     WHERE k.session_id = s.id AND k.status = ANY($3))"
            }
            KernelMatchType::NotAny => {
                "NOT EXISTS (SELECT 1 FROM kernels k \
                     WHERE k.session_id = s.id AND k.status = ANY($3))"
            }
        };
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions s \
             WHERE s.scaling_group = $1 AND s.status = ANY($2) AND {kernel_clause} \
             ORDER BY s.created_at, s.id"
        );
        let rows = sqlx::query(&sql)
            .bind(scaling_group)
            .bind(texts(statuses))
            .bind(texts(kernel_statuses))
            .fetch_all(&self.pool)
            .await?;
        self.attach_kernels(rows).await
    }

    async fn get_sessions_with_kernels(
        &self,
        session_ids: &[SessionId],
    ) -> DbResult<Vec<SessionWithKernels>> {
        if session_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions s WHERE s.id = ANY($1)");
        let rows = sqlx::query(&sql)
            .bind(texts(session_ids))
            .fetch_all(&self.pool)
            .await?;
        self.attach_kernels(rows).await
    }

    #[instrument(skip(self, batch), fields(to_status = %batch.to_status, count = batch.entries.len()))]
    async fn update_sessions_status(
        &self,
        batch: SessionStatusBatch,
    ) -> DbResult<Vec<AppliedTransition>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = batch
            .entries
            .iter()
            .map(|e| e.session_id.to_string())
            .collect();
        let slots = batch
            .entries
            .iter()
            .map(|e| match &e.occupying_slots {
                Some(slots) => slots_to_json(slots),
                None => Ok(serde_json::Value::Null),
            })
            .collect::<DbResult<Vec<_>>>()?;

        let rows = sqlx::query(
            r#"
            WITH targets AS (
                SELECT t.id, NULLIF(t.occupying_slots, 'null'::jsonb) AS occupying_slots
                FROM UNNEST($1::text[], $2::jsonb[]) AS t(id, occupying_slots)
            ),
            locked AS (
                SELECT s.id, s.status AS from_status
                FROM sessions s
                JOIN targets t ON t.id = s.id
                WHERE s.status = ANY($3)
                FOR UPDATE OF s
            )
            UPDATE sessions s
            SET status = $4,
                status_info = COALESCE($5, s.status_info),
                occupying_slots = COALESCE(t.occupying_slots, s.occupying_slots),
                status_changed_at = now(),
                terminated_at = CASE WHEN $6 THEN now() ELSE s.terminated_at END
            FROM locked l
            JOIN targets t ON t.id = l.id
            WHERE s.id = l.id
            RETURNING s.id, l.from_status
            "#,
        )
        .bind(&ids)
        .bind(&slots)
        .bind(texts(&batch.from_statuses))
        .bind(batch.to_status.as_str())
        .bind(&batch.status_info)
        .bind(batch.stamps_terminated_at())
        .fetch_all(&self.pool)
        .await?;

        let applied = rows
            .iter()
            .map(|row| {
                decode("session", row, |row| {
                    Ok(AppliedTransition {
                        session_id: parse_column(row, "id")?,
                        from_status: parse_column(row, "from_status")?,
                    })
                })
            })
            .collect::<DbResult<Vec<_>>>()?;
        debug!(applied = applied.len(), "Applied session status batch");
        Ok(applied)
    }

    #[instrument(skip(self, session_ids), fields(count = session_ids.len()))]
    async fn mark_sessions_terminating(
        &self,
        session_ids: &[SessionId],
        reason: &str,
    ) -> DbResult<MarkTerminationResult> {
        let mut result = MarkTerminationResult::default();
        if session_ids.is_empty() {
            return Ok(result);
        }

        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT id, status FROM sessions WHERE id = ANY($1) FOR UPDATE")
            .bind(texts(session_ids))
            .fetch_all(&mut *tx)
            .await?;
        let mut current: HashMap<SessionId, SessionStatus> = HashMap::new();
        for row in &rows {
            let (id, status) = decode("session", row, |row| {
                Ok((parse_column(row, "id")?, parse_column(row, "status")?))
            })?;
            current.insert(id, status);
        }

        for id in session_ids {
            match current.get(id).copied().map(classify_for_termination) {
                None => result.not_found.push(*id),
                Some(TerminationClass::Cancel) => result.cancelled.push(*id),
                Some(TerminationClass::Terminate) => result.terminating.push(*id),
                Some(TerminationClass::Skip) => result.skipped.push(*id),
            }
        }

        for (ids, to_status, terminal) in [
            (&result.cancelled, SessionStatus::Cancelled, true),
            (&result.terminating, SessionStatus::Terminating, false),
        ] {
            if ids.is_empty() {
                continue;
            }
            let ids = texts(ids);
            sqlx::query(
                r#"
                UPDATE sessions
                SET status = $2,
                    status_info = $3,
                    status_changed_at = now(),
                    terminated_at = CASE WHEN $4 THEN now() ELSE terminated_at END
                WHERE id = ANY($1)
                "#,
            )
            .bind(&ids)
            .bind(to_status.as_str())
            .bind(reason)
            .bind(terminal)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                r#"
                UPDATE kernels
                SET status = $2,
                    status_info = $3,
                    status_changed_at = now(),
                    terminated_at = CASE WHEN $4 THEN now() ELSE terminated_at END
                WHERE session_id = ANY($1) AND status NOT IN ('TERMINATED', 'CANCELLED')
                "#,
            )
            .bind(&ids)
            .bind(to_status.as_str())
            .bind(reason)
            .bind(terminal)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(result)
    }

    async fn get_terminating_sessions(&self) -> DbResult<Vec<TerminatingSessionData>> {
        let session_rows = sqlx::query(
            r#"
            SELECT id, creation_id, access_key, scaling_group, status_info
            FROM sessions
            WHERE status = 'TERMINATING'
            ORDER BY status_changed_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        if session_rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut sessions = session_rows
            .iter()
            .map(|row| {
                decode("session", row, |row| {
                    Ok(TerminatingSessionData {
                        session_id: parse_column(row, "id")?,
                        creation_id: row.try_get("creation_id")?,
                        access_key: parse_column(row, "access_key")?,
                        scaling_group: row.try_get("scaling_group")?,
                        status_info: row.try_get("status_info")?,
                        kernels: Vec::new(),
                    })
                })
            })
            .collect::<DbResult<Vec<_>>>()?;

        let ids: Vec<String> = sessions.iter().map(|s| s.session_id.to_string()).collect();
        let kernel_rows = sqlx::query(
            r#"
            SELECT id, session_id, status, agent_id, agent_addr, container_id
            FROM kernels
            WHERE session_id = ANY($1)
            ORDER BY session_id, created_at, id
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_session: BTreeMap<SessionId, Vec<TerminatingKernelData>> = BTreeMap::new();
        for row in &kernel_rows {
            let (session_id, kernel) = decode("kernel", row, |row| {
                Ok((
                    parse_column::<SessionId>(row, "session_id")?,
                    TerminatingKernelData {
                        kernel_id: parse_column(row, "id")?,
                        status: parse_column(row, "status")?,
                        agent_id: parse_optional_column(row, "agent_id")?,
                        agent_addr: row.try_get("agent_addr")?,
                        container_id: row.try_get("container_id")?,
                    },
                ))
            })?;
            by_session.entry(session_id).or_default().push(kernel);
        }
        for session in &mut sessions {
            session.kernels = by_session.remove(&session.session_id).unwrap_or_default();
        }
        Ok(sessions)
    }

    #[instrument(skip(self, results), fields(sessions = results.len()))]
    async fn batch_update_terminated_status(
        &self,
        results: &[SessionTerminationResult],
    ) -> DbResult<TerminatedUpdateSummary> {
        let mut summary = TerminatedUpdateSummary::default();
        if results.is_empty() {
            return Ok(summary);
        }

        let destroyed: Vec<String> = results
            .iter()
            .flat_map(|r| r.kernel_results.iter().filter(|k| k.success))
            .map(|k| k.kernel_id.to_string())
            .collect();
        let finished: Vec<String> = results
            .iter()
            .filter(|r| r.should_terminate_session())
            .map(|r| r.session_id.to_string())
            .collect();
        let agents: Vec<AgentId> = results
            .iter()
            .flat_map(|r| r.kernel_results.iter().filter_map(|k| k.agent_id.clone()))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut tx = self.pool.begin().await?;

        if !destroyed.is_empty() {
            let updated = sqlx::query(
                r#"
                UPDATE kernels
                SET status = 'TERMINATED',
                    status_changed_at = now(),
                    terminated_at = now()
                WHERE id = ANY($1) AND status NOT IN ('TERMINATED', 'CANCELLED')
                "#,
            )
            .bind(&destroyed)
            .execute(&mut *tx)
            .await?;
            summary.kernels_terminated = usize::try_from(updated.rows_affected()).unwrap_or(0);
        }

        if !finished.is_empty() {
            let rows = sqlx::query(
                r#"
                UPDATE sessions
                SET status = 'TERMINATED',
                    status_changed_at = now(),
                    terminated_at = now()
                WHERE id = ANY($1) AND status = 'TERMINATING'
                RETURNING id
                "#,
            )
            .bind(&finished)
            .fetch_all(&mut *tx)
            .await?;
            summary.sessions_terminated = rows
                .iter()
                .map(|row| decode("session", row, |row| parse_column(row, "id")))
                .collect::<DbResult<Vec<_>>>()?;
        }

        summary.agents_synced = Self::sync_agent_occupancy(&mut tx, &agents).await?;
        tx.commit().await?;
        Ok(summary)
    }

    async fn update_kernel_status(
        &self,
        report: &KernelStatusReport,
        allowed_from: &[KernelStatus],
    ) -> DbResult<KernelStatusUpdate> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT id, session_id, status FROM kernels WHERE id = $1 FOR UPDATE")
            .bind(report.kernel_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(KernelStatusUpdate::NotFound);
        };
        let (session_id, current): (SessionId, KernelStatus) = decode("kernel", &row, |row| {
            Ok((parse_column(row, "session_id")?, parse_column(row, "status")?))
        })?;
        if !allowed_from.contains(&current) {
            return Ok(KernelStatusUpdate::Rejected { current });
        }

        let occupied = report.occupied_slots.as_ref().map(slots_to_json).transpose()?;
        sqlx::query(
            r#"
            UPDATE kernels
            SET status = $2,
                status_info = COALESCE($3, status_info),
                occupied_slots = COALESCE($4, occupied_slots),
                container_id = COALESCE($5, container_id),
                status_changed_at = now(),
                terminated_at = CASE WHEN $6 THEN now() ELSE terminated_at END
            WHERE id = $1
            "#,
        )
        .bind(report.kernel_id.to_string())
        .bind(report.status.as_str())
        .bind(&report.reason)
        .bind(occupied)
        .bind(&report.container_id)
        .bind(report.status.is_dead())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(KernelStatusUpdate::Applied(KernelTransition {
            kernel_id: report.kernel_id,
            session_id,
            from_status: current,
            to_status: report.status,
        }))
    }

    #[instrument(skip(self))]
    async fn load_system_snapshot(&self, scaling_group: &str) -> DbResult<SystemSnapshot> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;
        let mut snapshot = SystemSnapshot::default();

        // Capacity and per-agent occupancy.
        let rows = sqlx::query(
            r#"
            SELECT id, available_slots, occupied_slots
            FROM agents
            WHERE scaling_group = $1 AND status = 'ALIVE'
            "#,
        )
        .bind(scaling_group)
        .fetch_all(&mut *tx)
        .await?;
        for row in &rows {
            let (agent_id, available, occupied) = decode("agent", row, |row| {
                Ok((
                    parse_column::<AgentId>(row, "id")?,
                    slots_column(row, "available_slots")?,
                    slots_column(row, "occupied_slots")?,
                ))
            })?;
            snapshot.total_capacity += &available;
            snapshot
                .resource_occupancy
                .by_agent
                .insert(agent_id, occupied);
        }

        // Occupancy per ownership scope, cluster-wide.
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.access_key, s.user_id, s.project_id, s.domain_name,
                   COALESCE(k.occupied_slots, k.requested_slots) AS slots
            FROM kernels k
            JOIN sessions s ON s.id = k.session_id
            WHERE k.status = ANY($1)
            "#,
        )
        .bind(occupying_kernel_statuses())
        .fetch_all(&mut *tx)
        .await?;
        let occupancy = &mut snapshot.resource_occupancy;
        for row in &rows {
            let (access_key, user_id, project_id, domain, slots) = decode("session", row, |row| {
                Ok((
                    parse_column::<AccessKey>(row, "access_key")?,
                    parse_column::<UserId>(row, "user_id")?,
                    parse_column::<ProjectId>(row, "project_id")?,
                    row.try_get::<String, _>("domain_name")?,
                    slots_column(row, "slots")?,
                ))
            })?;
            *occupancy.by_keypair.entry(access_key).or_default() += &slots;
            *occupancy.by_user.entry(user_id).or_default() += &slots;
            *occupancy.by_group.entry(project_id).or_default() += &slots;
            *occupancy.by_domain.entry(domain).or_default() += &slots;
        }

        // Keypair policies for keys with pending work here.
        let sql = format!(
            "SELECT kp.access_key, p.total_resource_slots, p.default_for_unspecified, \
                    p.max_concurrent_sessions, p.max_concurrent_sftp_sessions, \
                    p.max_pending_session_count, p.max_pending_session_resource_slots \
             FROM keypairs kp \
             JOIN keypair_resource_policies p ON p.name = kp.resource_policy \
             WHERE kp.access_key IN ({})",
            pending_scope("access_key")
        );
        let rows = sqlx::query(&sql)
            .bind(scaling_group)
            .fetch_all(&mut *tx)
            .await?;
        for row in &rows {
            let (access_key, policy) = decode("keypair", row, |row| {
                Ok((
                    parse_column::<AccessKey>(row, "access_key")?,
                    KeypairResourcePolicy {
                        total_resource_slots: optional_slots_column(row, "total_resource_slots")?,
                        default_for_unspecified: parse_column(row, "default_for_unspecified")?,
                        max_concurrent_sessions: limit(row.try_get("max_concurrent_sessions")?),
                        max_concurrent_sftp_sessions: limit(
                            row.try_get("max_concurrent_sftp_sessions")?,
                        ),
                        max_pending_session_count: limit(row.try_get("max_pending_session_count")?),
                        max_pending_session_resource_slots: optional_slots_column(
                            row,
                            "max_pending_session_resource_slots",
                        )?,
                    },
                ))
            })?;
            snapshot
                .resource_policy
                .keypair_policies
                .insert(access_key, policy);
        }

        // User, project and domain ceilings.
        let sql = format!(
            "SELECT id, total_resource_slots FROM users \
             WHERE total_resource_slots IS NOT NULL AND id IN ({})",
            pending_scope("user_id")
        );
        for row in &sqlx::query(&sql)
            .bind(scaling_group)
            .fetch_all(&mut *tx)
            .await?
        {
            let (id, slots) = decode("user", row, |row| {
                Ok((
                    parse_column::<UserId>(row, "id")?,
                    slots_column(row, "total_resource_slots")?,
                ))
            })?;
            snapshot.resource_policy.user_limits.insert(id, slots);
        }
        let sql = format!(
            "SELECT id, total_resource_slots FROM projects \
             WHERE total_resource_slots IS NOT NULL AND id IN ({})",
            pending_scope("project_id")
        );
        for row in &sqlx::query(&sql)
            .bind(scaling_group)
            .fetch_all(&mut *tx)
            .await?
        {
            let (id, slots) = decode("project", row, |row| {
                Ok((
                    parse_column::<ProjectId>(row, "id")?,
                    slots_column(row, "total_resource_slots")?,
                ))
            })?;
            snapshot.resource_policy.group_limits.insert(id, slots);
        }
        let sql = format!(
            "SELECT name AS id, total_resource_slots FROM domains \
             WHERE total_resource_slots IS NOT NULL AND name IN ({})",
            pending_scope("domain_name")
        );
        for row in &sqlx::query(&sql)
            .bind(scaling_group)
            .fetch_all(&mut *tx)
            .await?
        {
            let (name, slots) = decode("domain", row, |row| {
                Ok((
                    row.try_get::<String, _>("id")?,
                    slots_column(row, "total_resource_slots")?,
                ))
            })?;
            snapshot.resource_policy.domain_limits.insert(name, slots);
        }

        // Live session counters.
        let rows = sqlx::query(
            r#"
            SELECT access_key, is_private, COUNT(*) AS live
            FROM sessions
            WHERE status NOT IN ('PENDING', 'TERMINATED', 'CANCELLED')
            GROUP BY access_key, is_private
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;
        for row in &rows {
            let access_key: AccessKey = parse_column(row, "access_key")?;
            let is_private: bool = row.try_get("is_private")?;
            let live: i64 = row.try_get("live")?;
            let live = u32::try_from(live).unwrap_or(u32::MAX);
            let counters = if is_private {
                &mut snapshot.concurrency.sftp_sessions_by_keypair
            } else {
                &mut snapshot.concurrency.sessions_by_keypair
            };
            counters.insert(access_key, live);
        }

        // Pending sessions of every key with pending work here.
        let sql = format!(
            "SELECT id, access_key, requested_slots, created_at FROM sessions \
             WHERE status = 'PENDING' AND access_key IN ({}) \
             ORDER BY created_at, id",
            pending_scope("access_key")
        );
        for row in &sqlx::query(&sql)
            .bind(scaling_group)
            .fetch_all(&mut *tx)
            .await?
        {
            let (access_key, pending) = decode("session", row, |row| {
                Ok((
                    parse_column::<AccessKey>(row, "access_key")?,
                    PendingSessionInfo {
                        session_id: parse_column(row, "id")?,
                        requested_slots: slots_column(row, "requested_slots")?,
                        creation_time: row.try_get("created_at")?,
                    },
                ))
            })?;
            snapshot
                .pending_sessions
                .by_keypair
                .entry(access_key)
                .or_default()
                .push(pending);
        }

        // Dependencies of pending sessions.
        let rows = sqlx::query(
            r#"
            SELECT d.session_id AS id, d.depends_on, dep.status, dep.result
            FROM session_dependencies d
            JOIN sessions s ON s.id = d.session_id
            JOIN sessions dep ON dep.id = d.depends_on
            WHERE s.scaling_group = $1 AND s.status = 'PENDING'
            "#,
        )
        .bind(scaling_group)
        .fetch_all(&mut *tx)
        .await?;
        for row in &rows {
            let (session_id, dependency) = decode("session", row, |row| {
                Ok((
                    parse_column::<SessionId>(row, "id")?,
                    SessionDependencyInfo {
                        depends_on: parse_column(row, "depends_on")?,
                        status: parse_column(row, "status")?,
                        result: parse_column(row, "result")?,
                    },
                ))
            })?;
            snapshot
                .session_dependencies
                .by_session
                .entry(session_id)
                .or_default()
                .push(dependency);
        }

        let rows = sqlx::query("SELECT slot_name AS id, slot_type FROM resource_slot_types")
            .fetch_all(&mut *tx)
            .await?;
        for row in &rows {
            let name: String = row.try_get("id")?;
            let slot_type: SlotType = parse_column(row, "slot_type")?;
            let slot = SlotName::new(name.clone()).map_err(|e| DbError::Decode {
                entity: "resource slot type",
                id: name,
                reason: e.to_string(),
            })?;
            snapshot.known_slot_types.insert(slot, slot_type);
        }

        tx.commit().await?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_scope_subquery() {
        assert_eq!(
            pending_scope("user_id"),
            "SELECT user_id FROM sessions WHERE scaling_group = $1 AND status = 'PENDING'"
        );
    }

    #[test]
    fn test_occupying_statuses_exclude_dead_and_pending() {
        let statuses = occupying_kernel_statuses();
        assert!(statuses.contains(&"RUNNING".to_string()));
        assert!(statuses.contains(&"TERMINATING".to_string()));
        assert!(!statuses.contains(&"PENDING".to_string()));
        assert!(!statuses.contains(&"TERMINATED".to_string()));
        assert!(!statuses.contains(&"CANCELLED".to_string()));
    }

    #[test]
    fn test_negative_limits_block() {
        assert_eq!(limit(None), None);
        assert_eq!(limit(Some(5)), Some(5));
        assert_eq!(limit(Some(-1)), Some(0));
    }
}
