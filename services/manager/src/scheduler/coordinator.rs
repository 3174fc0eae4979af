//! Runs promotion handlers across scaling groups.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use sokovan_events::SessionStatus;
use sokovan_id::SessionId;
use tracing::{debug, error, info, instrument, warn};

use super::error::SchedulerResult;
use super::handlers::PromotionHandler;
use super::hooks::best_effort;
use super::lock::DistributedLock;
use super::repository::SchedulerRepository;
use super::types::{ExecutionResult, SessionStatusBatch};

/// What one handler run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerRunSummary {
    /// Another replica held the handler's lock.
    pub skipped: bool,
    pub scaling_groups: usize,
    pub failed_groups: usize,
    /// Sessions moved to the handler's success status.
    pub promoted: usize,
}

pub struct LifecycleCoordinator {
    repo: Arc<dyn SchedulerRepository>,
    locks: Arc<dyn DistributedLock>,
    lock_ttl: Duration,
}

impl LifecycleCoordinator {
    pub fn new(
        repo: Arc<dyn SchedulerRepository>,
        locks: Arc<dyn DistributedLock>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            repo,
            locks,
            lock_ttl,
        }
    }

    /// Runs `handler` once over every schedulable scaling group.
    #[instrument(skip(self, handler), fields(handler = handler.name()))]
    pub async fn process_lifecycle_schedule(
        &self,
        handler: &dyn PromotionHandler,
    ) -> SchedulerResult<HandlerRunSummary> {
        let lease = match handler.lock_id() {
            Some(lock_id) => match self.locks.acquire(lock_id, self.lock_ttl).await? {
                Some(lease) => Some(lease),
                None => {
                    debug!(lock_id = %lock_id, "Lock held elsewhere, skipping tick");
                    return Ok(HandlerRunSummary {
                        skipped: true,
                        ..HandlerRunSummary::default()
                    });
                }
            },
            None => None,
        };

        let outcome = self.run_groups(handler).await;

        if let Some(lease) = lease {
            if let Err(e) = self.locks.release(lease).await {
                warn!(error = %e, "Failed to release scheduler lock");
            }
        }
        outcome
    }

    async fn run_groups(&self, handler: &dyn PromotionHandler) -> SchedulerResult<HandlerRunSummary> {
        let groups = self.repo.get_schedulable_scaling_groups().await?;
        let outcomes = join_all(
            groups
                .iter()
                .map(|group| self.process_scaling_group(handler, group)),
        )
        .await;

        let mut summary = HandlerRunSummary {
            scaling_groups: groups.len(),
            ..HandlerRunSummary::default()
        };
        for (group, outcome) in groups.iter().zip(outcomes) {
            match outcome {
                Ok(promoted) => summary.promoted += promoted,
                Err(e) => {
                    summary.failed_groups += 1;
                    error!(scaling_group = %group, error = %e, "Handler batch failed");
                }
            }
        }
        if summary.promoted > 0 {
            info!(
                promoted = summary.promoted,
                to_status = %handler.success_status(),
                "Promoted sessions"
            );
        }
        Ok(summary)
    }

    async fn process_scaling_group(
        &self,
        handler: &dyn PromotionHandler,
        scaling_group: &str,
    ) -> SchedulerResult<usize> {
        let sessions = self
            .repo
            .get_sessions_for_handler(
                scaling_group,
                handler.target_statuses(),
                handler.target_kernel_statuses(),
                handler.kernel_match_type(),
            )
            .await?;
        if sessions.is_empty() {
            debug!(scaling_group = %scaling_group, "No sessions to promote");
            return Ok(0);
        }

        let mut result = handler.execute(scaling_group, &sessions).await?;
        let promoted = self.apply_transitions(handler, &mut result).await?;

        if result.needs_post_processing() {
            best_effort(
                handler.name(),
                handler.post_process(scaling_group, &result),
            )
            .await;
        }
        Ok(promoted)
    }

    /// Writes success, failure and stale transitions, each guarded by the
    /// handler's target statuses. Returns the number of promoted sessions.
    async fn apply_transitions(
        &self,
        handler: &dyn PromotionHandler,
        result: &mut ExecutionResult,
    ) -> SchedulerResult<usize> {
        let transitions = handler.status_transitions();
        let guard = handler.target_statuses();

        let mut promoted = 0;
        if !result.successes.is_empty() {
            let occupancy: HashMap<SessionId, _> = result
                .sessions_running_data
                .iter()
                .map(|d| (d.session_id, d.occupying_slots.clone()))
                .collect();
            let mut batch = SessionStatusBatch::new(transitions.success, guard)
                .with_sessions(result.success_ids())
                .with_info(handler.success_reason());
            for entry in &mut batch.entries {
                entry.occupying_slots = occupancy.get(&entry.session_id).cloned();
            }

            let applied: HashSet<SessionId> = self
                .repo
                .update_sessions_status(batch)
                .await?
                .into_iter()
                .map(|t| t.session_id)
                .collect();
            if applied.len() < result.successes.len() {
                debug!(
                    expected = result.successes.len(),
                    applied = applied.len(),
                    "Some sessions were moved by another writer"
                );
            }
            result.retain_applied(&applied);
            promoted = applied.len();
        }

        let mut failure_batches: BTreeMap<(SessionStatus, String), Vec<SessionId>> =
            BTreeMap::new();
        for failure in &result.failures {
            match transitions.for_failure(failure.kind) {
                Some(to_status) => failure_batches
                    .entry((to_status, failure.reason.clone()))
                    .or_default()
                    .push(failure.session.session_id),
                None => debug!(
                    session_id = %failure.session.session_id,
                    reason = %failure.reason,
                    "Leaving failed session in place"
                ),
            }
        }
        for ((to_status, reason), ids) in failure_batches {
            let batch = SessionStatusBatch::new(to_status, guard)
                .with_sessions(ids)
                .with_info(reason);
            self.repo.update_sessions_status(batch).await?;
        }

        if let Some(expired) = transitions.expired {
            if !result.stales.is_empty() {
                let batch = SessionStatusBatch::new(expired, guard)
                    .with_sessions(result.stales.iter().map(|s| s.session_id))
                    .with_info("expired");
                self.repo.update_sessions_status(batch).await?;
            }
        }

        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::scheduler::lock::MemoryLockService;
    use crate::scheduler::types::{
        ExecutionFailure, FailureKind, KernelMatchType, LockId, PromotionStatusTransitions,
        ScheduleType, SessionInfo, SessionWithKernels,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use sokovan_events::KernelStatus;
    use sokovan_id::{AccessKey, ProjectId, UserId};
    use sokovan_resource::ResourceSlot;

    /// Fails every matched session with `GiveUp`.
    struct GiveUpHandler;

    #[async_trait]
    impl PromotionHandler for GiveUpHandler {
        fn name(&self) -> &'static str {
            "give-up"
        }

        fn target_statuses(&self) -> &'static [SessionStatus] {
            &[SessionStatus::Preparing]
        }

        fn target_kernel_statuses(&self) -> &'static [KernelStatus] {
            &[KernelStatus::Preparing]
        }

        fn kernel_match_type(&self) -> KernelMatchType {
            KernelMatchType::NotAny
        }

        fn status_transitions(&self) -> PromotionStatusTransitions {
            PromotionStatusTransitions {
                give_up: Some(SessionStatus::Error),
                ..PromotionStatusTransitions::success_only(SessionStatus::Prepared)
            }
        }

        fn lock_id(&self) -> Option<LockId> {
            None
        }

        fn schedule_type(&self) -> ScheduleType {
            ScheduleType::CheckPullingProgress
        }

        async fn execute(
            &self,
            _scaling_group: &str,
            sessions: &[SessionWithKernels],
        ) -> SchedulerResult<ExecutionResult> {
            Ok(ExecutionResult {
                failures: sessions
                    .iter()
                    .map(|s| ExecutionFailure {
                        session: s.transition_info(),
                        kind: FailureKind::GiveUp,
                        reason: "image not found".to_string(),
                    })
                    .collect(),
                ..ExecutionResult::default()
            })
        }
    }

    fn session(status: SessionStatus) -> SessionInfo {
        SessionInfo {
            id: SessionId::new(),
            creation_id: "c".to_string(),
            access_key: AccessKey::parse("AKTEST").unwrap(),
            user_id: UserId::new(),
            project_id: ProjectId::new(),
            domain_name: "default".to_string(),
            scaling_group: "default".to_string(),
            status,
            status_info: None,
            requested_slots: ResourceSlot::new(),
            occupying_slots: None,
            created_at: Utc::now(),
            terminated_at: None,
        }
    }

    #[tokio::test]
    async fn test_give_up_failures_use_declared_status() {
        let store = Arc::new(MemoryStore::new());
        let s = session(SessionStatus::Preparing);
        store.insert_session(s.clone());
        let coordinator = LifecycleCoordinator::new(
            store.clone(),
            Arc::new(MemoryLockService::default()),
            Duration::from_secs(60),
        );

        let summary = coordinator
            .process_lifecycle_schedule(&GiveUpHandler)
            .await
            .unwrap();

        assert_eq!(summary.promoted, 0);
        let stored = store.session(s.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Error);
        assert_eq!(stored.status_info.as_deref(), Some("image not found"));
    }
}
