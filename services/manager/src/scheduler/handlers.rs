//! Promotion handlers.
//!
//! Each handler promotes sessions whose kernels have all reached a given
//! state. Handlers only decide; the [`LifecycleCoordinator`] performs the
//! guarded writes and calls [`PromotionHandler::post_process`] afterwards.
//!
//! [`LifecycleCoordinator`]: super::coordinator::LifecycleCoordinator

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use sokovan_events::{KernelStatus, SessionStatus};
use sokovan_id::SessionId;
use tracing::{debug, warn};

use super::error::{HookError, SchedulerError, SchedulerResult};
use super::hooks::HookRegistry;
use super::repository::SchedulerRepository;
use super::types::{
    sum_kernel_occupancy, ExecutionFailure, ExecutionResult, FailureKind, KernelMatchType, LockId,
    PromotionStatusTransitions, ScheduleType, ScheduledSessionData, SessionRunningData,
    SessionWithKernels,
};
use super::wake::WakeChannel;
use crate::events::{broadcast_status_change, EventBus};

/// Default `status_info` for scheduler-driven transitions.
pub const TRIGGERED_BY_SCHEDULER: &str = "triggered-by-scheduler";

/// A forward session transition driven by aggregate kernel status.
#[async_trait]
pub trait PromotionHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Session statuses eligible for this handler. Also the guard of the
    /// success write.
    fn target_statuses(&self) -> &'static [SessionStatus];

    fn target_kernel_statuses(&self) -> &'static [KernelStatus];

    fn kernel_match_type(&self) -> KernelMatchType;

    fn status_transitions(&self) -> PromotionStatusTransitions;

    fn success_status(&self) -> SessionStatus {
        self.status_transitions().success
    }

    /// Recorded as `status_info` on promoted sessions.
    fn success_reason(&self) -> &'static str {
        TRIGGERED_BY_SCHEDULER
    }

    /// Lock guarding this handler's status group, if any.
    fn lock_id(&self) -> Option<LockId>;

    /// Schedule type whose ticks run this handler.
    fn schedule_type(&self) -> ScheduleType;

    async fn execute(
        &self,
        scaling_group: &str,
        sessions: &[SessionWithKernels],
    ) -> SchedulerResult<ExecutionResult>;

    /// Follow-up work for applied successes. Errors are logged by the caller.
    async fn post_process(
        &self,
        _scaling_group: &str,
        _result: &ExecutionResult,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

/// Dependencies shared by the standard handlers.
#[derive(Clone)]
pub struct SchedulerContext {
    pub repo: Arc<dyn SchedulerRepository>,
    pub wake: Arc<dyn WakeChannel>,
    pub events: Arc<dyn EventBus>,
    pub hooks: HookRegistry,
}

fn scheduled_data(session: &SessionWithKernels, reason: &str) -> ScheduledSessionData {
    ScheduledSessionData {
        session_id: session.session.id,
        creation_id: session.session.creation_id.clone(),
        access_key: session.session.access_key.clone(),
        from_status: session.session.status,
        reason: reason.to_string(),
    }
}

/// Every matched session succeeds.
fn promote_all(sessions: &[SessionWithKernels], reason: &str) -> ExecutionResult {
    ExecutionResult {
        successes: sessions.iter().map(|s| s.transition_info()).collect(),
        scheduled_data: sessions.iter().map(|s| scheduled_data(s, reason)).collect(),
        ..ExecutionResult::default()
    }
}

// =============================================================================
// DetectTermination
// =============================================================================

/// Moves RUNNING sessions whose kernels all died on their own into the
/// regular termination path.
pub struct DetectTerminationHandler {
    ctx: SchedulerContext,
}

impl DetectTerminationHandler {
    pub const REASON: &'static str = "abnormal-termination";

    pub fn new(ctx: SchedulerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl PromotionHandler for DetectTerminationHandler {
    fn name(&self) -> &'static str {
        "detect-termination"
    }

    fn target_statuses(&self) -> &'static [SessionStatus] {
        &[SessionStatus::Running]
    }

    fn target_kernel_statuses(&self) -> &'static [KernelStatus] {
        &[KernelStatus::Terminated]
    }

    fn kernel_match_type(&self) -> KernelMatchType {
        KernelMatchType::All
    }

    fn status_transitions(&self) -> PromotionStatusTransitions {
        PromotionStatusTransitions::success_only(SessionStatus::Terminating)
    }

    fn success_reason(&self) -> &'static str {
        Self::REASON
    }

    fn lock_id(&self) -> Option<LockId> {
        Some(LockId::SokovanTargetRunning)
    }

    fn schedule_type(&self) -> ScheduleType {
        ScheduleType::CheckRunningSessionTermination
    }

    async fn execute(
        &self,
        _scaling_group: &str,
        sessions: &[SessionWithKernels],
    ) -> SchedulerResult<ExecutionResult> {
        for session in sessions {
            debug!(session_id = %session.id(), "Detected session with no live kernels");
        }
        Ok(promote_all(sessions, Self::REASON))
    }

    async fn post_process(
        &self,
        scaling_group: &str,
        result: &ExecutionResult,
    ) -> Result<(), HookError> {
        self.ctx
            .wake
            .publish(ScheduleType::CheckTerminatingProgress, false)
            .await?;
        broadcast_status_change(
            self.ctx.events.as_ref(),
            SessionStatus::Terminating,
            scaling_group,
            &result.scheduled_data,
        )
        .await?;
        Ok(())
    }
}

// =============================================================================
// PromoteToPrepared
// =============================================================================

/// PREPARING/PULLING sessions whose images are ready on every agent.
pub struct PromoteToPreparedHandler {
    ctx: SchedulerContext,
}

impl PromoteToPreparedHandler {
    pub fn new(ctx: SchedulerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl PromotionHandler for PromoteToPreparedHandler {
    fn name(&self) -> &'static str {
        "promote-to-prepared"
    }

    fn target_statuses(&self) -> &'static [SessionStatus] {
        &[SessionStatus::Preparing, SessionStatus::Pulling]
    }

    fn target_kernel_statuses(&self) -> &'static [KernelStatus] {
        &[KernelStatus::Prepared, KernelStatus::Running]
    }

    fn kernel_match_type(&self) -> KernelMatchType {
        KernelMatchType::All
    }

    fn status_transitions(&self) -> PromotionStatusTransitions {
        PromotionStatusTransitions::success_only(SessionStatus::Prepared)
    }

    fn lock_id(&self) -> Option<LockId> {
        Some(LockId::SokovanTargetPreparing)
    }

    fn schedule_type(&self) -> ScheduleType {
        ScheduleType::CheckPullingProgress
    }

    async fn execute(
        &self,
        _scaling_group: &str,
        sessions: &[SessionWithKernels],
    ) -> SchedulerResult<ExecutionResult> {
        Ok(promote_all(sessions, self.success_reason()))
    }

    async fn post_process(
        &self,
        scaling_group: &str,
        result: &ExecutionResult,
    ) -> Result<(), HookError> {
        self.ctx.wake.publish(ScheduleType::Start, false).await?;
        broadcast_status_change(
            self.ctx.events.as_ref(),
            SessionStatus::Prepared,
            scaling_group,
            &result.scheduled_data,
        )
        .await?;
        Ok(())
    }
}

// =============================================================================
// PromoteToRunning
// =============================================================================

/// CREATING sessions whose kernels are all running. The session's
/// occupancy is the sum of its kernels' reported occupancy and is written
/// together with the status.
pub struct PromoteToRunningHandler {
    ctx: SchedulerContext,
}

impl PromoteToRunningHandler {
    pub fn new(ctx: SchedulerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl PromotionHandler for PromoteToRunningHandler {
    fn name(&self) -> &'static str {
        "promote-to-running"
    }

    fn target_statuses(&self) -> &'static [SessionStatus] {
        &[SessionStatus::Creating]
    }

    fn target_kernel_statuses(&self) -> &'static [KernelStatus] {
        &[KernelStatus::Running]
    }

    fn kernel_match_type(&self) -> KernelMatchType {
        KernelMatchType::All
    }

    fn status_transitions(&self) -> PromotionStatusTransitions {
        PromotionStatusTransitions::success_only(SessionStatus::Running)
    }

    fn lock_id(&self) -> Option<LockId> {
        Some(LockId::SokovanTargetCreating)
    }

    fn schedule_type(&self) -> ScheduleType {
        ScheduleType::CheckCreatingProgress
    }

    async fn execute(
        &self,
        _scaling_group: &str,
        sessions: &[SessionWithKernels],
    ) -> SchedulerResult<ExecutionResult> {
        let ids: Vec<SessionId> = sessions.iter().map(|s| s.id()).collect();
        let fresh: HashMap<SessionId, SessionWithKernels> = self
            .ctx
            .repo
            .get_sessions_with_kernels(&ids)
            .await?
            .into_iter()
            .map(|s| (s.id(), s))
            .collect();

        let mut result = ExecutionResult::default();
        for session in sessions {
            let info = session.transition_info();
            let Some(current) = fresh.get(&session.id()) else {
                let err = SchedulerError::Integrity {
                    session_id: session.id(),
                    reason: "session disappeared before promotion".to_string(),
                };
                warn!(error = %err, "Skipping session");
                result.failures.push(ExecutionFailure {
                    session: info,
                    kind: FailureKind::NeedRetry,
                    reason: err.to_string(),
                });
                continue;
            };
            if !KernelMatchType::All.matches(current.kernel_statuses(), self.target_kernel_statuses())
            {
                debug!(session_id = %session.id(), "Kernels changed since selection");
                result.stales.push(info);
                continue;
            }
            result.successes.push(info);
            result
                .scheduled_data
                .push(scheduled_data(session, self.success_reason()));
            result.sessions_running_data.push(SessionRunningData {
                session_id: session.id(),
                occupying_slots: sum_kernel_occupancy(&current.kernels),
            });
        }
        Ok(result)
    }

    async fn post_process(
        &self,
        scaling_group: &str,
        result: &ExecutionResult,
    ) -> Result<(), HookError> {
        for session in &result.scheduled_data {
            self.ctx.hooks.run_on_running(session).await;
        }
        broadcast_status_change(
            self.ctx.events.as_ref(),
            SessionStatus::Running,
            scaling_group,
            &result.scheduled_data,
        )
        .await?;
        Ok(())
    }
}

// =============================================================================
// PromoteToTerminated
// =============================================================================

/// TERMINATING sessions whose kernels are all gone.
pub struct PromoteToTerminatedHandler {
    ctx: SchedulerContext,
}

impl PromoteToTerminatedHandler {
    pub fn new(ctx: SchedulerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl PromotionHandler for PromoteToTerminatedHandler {
    fn name(&self) -> &'static str {
        "promote-to-terminated"
    }

    fn target_statuses(&self) -> &'static [SessionStatus] {
        &[SessionStatus::Terminating]
    }

    fn target_kernel_statuses(&self) -> &'static [KernelStatus] {
        &[KernelStatus::Terminated]
    }

    fn kernel_match_type(&self) -> KernelMatchType {
        KernelMatchType::All
    }

    fn status_transitions(&self) -> PromotionStatusTransitions {
        PromotionStatusTransitions::success_only(SessionStatus::Terminated)
    }

    fn lock_id(&self) -> Option<LockId> {
        Some(LockId::SokovanTargetTerminating)
    }

    fn schedule_type(&self) -> ScheduleType {
        ScheduleType::CheckTerminatingProgress
    }

    async fn execute(
        &self,
        _scaling_group: &str,
        sessions: &[SessionWithKernels],
    ) -> SchedulerResult<ExecutionResult> {
        Ok(promote_all(sessions, self.success_reason()))
    }

    async fn post_process(
        &self,
        scaling_group: &str,
        result: &ExecutionResult,
    ) -> Result<(), HookError> {
        for session in &result.scheduled_data {
            self.ctx.hooks.run_on_terminated(session).await;
        }
        // Freed capacity may admit pending sessions.
        self.ctx.wake.publish(ScheduleType::Schedule, false).await?;
        broadcast_status_change(
            self.ctx.events.as_ref(),
            SessionStatus::Terminated,
            scaling_group,
            &result.scheduled_data,
        )
        .await?;
        Ok(())
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Handlers keyed by the schedule type that runs them.
#[derive(Clone, Default)]
pub struct PromotionHandlerRegistry {
    handlers: BTreeMap<ScheduleType, Arc<dyn PromotionHandler>>,
}

impl PromotionHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four standard promotion handlers.
    pub fn standard(ctx: SchedulerContext) -> Self {
        Self::new()
            .with_handler(Arc::new(DetectTerminationHandler::new(ctx.clone())))
            .with_handler(Arc::new(PromoteToPreparedHandler::new(ctx.clone())))
            .with_handler(Arc::new(PromoteToRunningHandler::new(ctx.clone())))
            .with_handler(Arc::new(PromoteToTerminatedHandler::new(ctx)))
    }

    pub fn with_handler(mut self, handler: Arc<dyn PromotionHandler>) -> Self {
        self.handlers.insert(handler.schedule_type(), handler);
        self
    }

    pub fn get(&self, schedule_type: ScheduleType) -> Option<Arc<dyn PromotionHandler>> {
        self.handlers.get(&schedule_type).cloned()
    }

    pub fn schedule_types(&self) -> impl Iterator<Item = ScheduleType> + '_ {
        self.handlers.keys().copied()
    }
}
