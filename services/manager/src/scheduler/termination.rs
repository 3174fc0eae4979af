//! Session termination: request intake and the destroy fan-out tick.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use sokovan_events::{event_types, AggregateType, SessionStatus, SessionTerminationRequestedPayload};
use sokovan_id::SessionId;
use tracing::{debug, info, instrument, warn};

use super::error::SchedulerResult;
use super::hooks::{best_effort, HookRegistry};
use super::lock::DistributedLock;
use super::repository::SchedulerRepository;
use super::types::{
    KernelTerminationResult, LockId, MarkTerminationResult, ScheduleType, ScheduledSessionData,
    SessionTerminationResult, TerminatingKernelData, TerminatingSessionData,
    TerminatedUpdateSummary,
};
use super::wake::WakeChannel;
use crate::agents::{AgentClientPool, AgentRpcError, DestroyKernelRequest};
use crate::events::{broadcast_status_change, envelope, EventBus};

/// `status_info` used when a session carries no termination reason.
pub const DEFAULT_TERMINATION_REASON: &str = "user-requested";

/// What one termination tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationTickSummary {
    /// Another replica held the termination lock.
    pub skipped: bool,
    pub sessions_processed: usize,
    pub kernel_failures: usize,
    pub update: TerminatedUpdateSummary,
}

pub struct TerminationCoordinator {
    repo: Arc<dyn SchedulerRepository>,
    locks: Arc<dyn DistributedLock>,
    wake: Arc<dyn WakeChannel>,
    events: Arc<dyn EventBus>,
    clients: Arc<dyn AgentClientPool>,
    hooks: HookRegistry,
    lock_ttl: Duration,
    rpc_timeout: Duration,
}

impl TerminationCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn SchedulerRepository>,
        locks: Arc<dyn DistributedLock>,
        wake: Arc<dyn WakeChannel>,
        events: Arc<dyn EventBus>,
        clients: Arc<dyn AgentClientPool>,
        hooks: HookRegistry,
        lock_ttl: Duration,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            locks,
            wake,
            events,
            clients,
            hooks,
            lock_ttl,
            rpc_timeout,
        }
    }

    /// Cancels or marks the given sessions terminating.
    ///
    /// The terminate schedule is only woken when something changed, so
    /// repeated requests for the same sessions cost nothing downstream.
    #[instrument(skip(self, session_ids), fields(count = session_ids.len()))]
    pub async fn mark_sessions_for_termination(
        &self,
        session_ids: &[SessionId],
        reason: &str,
    ) -> SchedulerResult<MarkTerminationResult> {
        let mut seen = HashSet::new();
        let session_ids: Vec<SessionId> = session_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();
        let result = self
            .repo
            .mark_sessions_terminating(&session_ids, reason)
            .await?;

        if !result.has_processed() {
            debug!(
                skipped = result.skipped.len(),
                not_found = result.not_found.len(),
                "Termination request changed nothing"
            );
            return Ok(result);
        }

        info!(
            cancelled = result.cancelled.len(),
            terminating = result.terminating.len(),
            skipped = result.skipped.len(),
            not_found = result.not_found.len(),
            "Marked sessions for termination"
        );
        best_effort(
            "wake terminate",
            self.wake.publish(ScheduleType::Terminate, true),
        )
        .await;

        let first = result
            .cancelled
            .first()
            .or_else(|| result.terminating.first())
            .map(ToString::to_string)
            .unwrap_or_default();
        let payload = SessionTerminationRequestedPayload {
            cancelled: result.cancelled.clone(),
            terminating: result.terminating.clone(),
            reason: reason.to_string(),
        };
        best_effort("termination event", async move {
            let event = envelope(
                AggregateType::Session,
                first,
                event_types::SESSION_TERMINATION_REQUESTED,
                payload,
            )?;
            self.events.publish(event).await
        })
        .await;

        Ok(result)
    }

    /// Destroys the kernels of every TERMINATING session and finalizes the
    /// sessions whose kernels are all gone.
    #[instrument(skip(self))]
    pub async fn terminate_sessions(&self) -> SchedulerResult<TerminationTickSummary> {
        let lock_id = LockId::SokovanTargetTerminating;
        let Some(lease) = self.locks.acquire(lock_id, self.lock_ttl).await? else {
            debug!(lock_id = %lock_id, "Lock held elsewhere, skipping tick");
            return Ok(TerminationTickSummary {
                skipped: true,
                ..TerminationTickSummary::default()
            });
        };

        let outcome = self.terminate_locked().await;

        if let Err(e) = self.locks.release(lease).await {
            warn!(error = %e, "Failed to release termination lock");
        }
        outcome
    }

    async fn terminate_locked(&self) -> SchedulerResult<TerminationTickSummary> {
        let sessions = self.repo.get_terminating_sessions().await?;
        if sessions.is_empty() {
            debug!("No terminating sessions");
            return Ok(TerminationTickSummary::default());
        }

        let results = join_all(sessions.iter().map(|s| self.terminate_session(s))).await;
        let kernel_failures: usize = results.iter().map(|r| r.failed_kernels().count()).sum();

        let update = self.repo.batch_update_terminated_status(&results).await?;
        info!(
            sessions = sessions.len(),
            terminated = update.sessions_terminated.len(),
            kernels_terminated = update.kernels_terminated,
            kernel_failures,
            "Termination tick complete"
        );

        if !update.sessions_terminated.is_empty() {
            self.after_terminated(&sessions, &results, &update).await;
        }

        Ok(TerminationTickSummary {
            skipped: false,
            sessions_processed: sessions.len(),
            kernel_failures,
            update,
        })
    }

    async fn terminate_session(&self, session: &TerminatingSessionData) -> SessionTerminationResult {
        let reason = session
            .status_info
            .clone()
            .unwrap_or_else(|| DEFAULT_TERMINATION_REASON.to_string());
        let kernel_results = join_all(
            session
                .kernels
                .iter()
                .map(|kernel| self.destroy_kernel(session.session_id, kernel, &reason)),
        )
        .await;
        SessionTerminationResult {
            session_id: session.session_id,
            access_key: session.access_key.clone(),
            creation_id: session.creation_id.clone(),
            reason,
            kernel_results,
        }
    }

    async fn destroy_kernel(
        &self,
        session_id: SessionId,
        kernel: &TerminatingKernelData,
        reason: &str,
    ) -> KernelTerminationResult {
        let done = |error: Option<String>| KernelTerminationResult {
            kernel_id: kernel.kernel_id,
            agent_id: kernel.agent_id.clone(),
            success: error.is_none(),
            error,
        };

        let Some(agent_id) = &kernel.agent_id else {
            return done(None);
        };
        if kernel.status.is_dead() {
            return done(None);
        }
        let Some(agent_addr) = &kernel.agent_addr else {
            warn!(kernel_id = %kernel.kernel_id, agent_id = %agent_id, "Agent address unknown");
            return done(Some(format!("address of agent {agent_id} is unknown")));
        };

        let request = DestroyKernelRequest {
            kernel_id: kernel.kernel_id,
            session_id,
            reason: reason.to_string(),
        };
        let call = self.clients.destroy_kernel(agent_id, agent_addr, &request);
        let outcome = match tokio::time::timeout(self.rpc_timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AgentRpcError::Timeout {
                agent_id: agent_id.clone(),
                timeout: self.rpc_timeout,
            }),
        };
        match outcome {
            Ok(()) => done(None),
            Err(e) => {
                warn!(
                    kernel_id = %kernel.kernel_id,
                    agent_id = %agent_id,
                    error = %e,
                    "Failed to destroy kernel, will retry"
                );
                done(Some(e.to_string()))
            }
        }
    }

    async fn after_terminated(
        &self,
        sessions: &[TerminatingSessionData],
        results: &[SessionTerminationResult],
        update: &TerminatedUpdateSummary,
    ) {
        let finished: Vec<(&TerminatingSessionData, ScheduledSessionData)> = sessions
            .iter()
            .zip(results)
            .filter(|(s, _)| update.sessions_terminated.contains(&s.session_id))
            .map(|(s, r)| {
                (
                    s,
                    ScheduledSessionData {
                        session_id: s.session_id,
                        creation_id: s.creation_id.clone(),
                        access_key: s.access_key.clone(),
                        from_status: SessionStatus::Terminating,
                        reason: r.reason.clone(),
                    },
                )
            })
            .collect();

        for (_, data) in &finished {
            self.hooks.run_on_terminated(data).await;
        }

        best_effort(
            "wake schedule",
            self.wake.publish(ScheduleType::Schedule, false),
        )
        .await;

        let mut by_group: BTreeMap<&str, Vec<ScheduledSessionData>> = BTreeMap::new();
        for (session, data) in finished {
            by_group
                .entry(session.scaling_group.as_str())
                .or_default()
                .push(data);
        }
        for (scaling_group, data) in by_group {
            best_effort(
                "terminated event",
                broadcast_status_change(
                    self.events.as_ref(),
                    SessionStatus::Terminated,
                    scaling_group,
                    &data,
                ),
            )
            .await;
        }
    }
}
