//! Storage contract consumed by the coordinators.

use async_trait::async_trait;
use sokovan_events::{KernelStatus, SessionStatus};
use sokovan_id::SessionId;

use super::types::{
    AppliedTransition, KernelMatchType, KernelStatusReport, KernelStatusUpdate,
    MarkTerminationResult, SessionStatusBatch, SessionTerminationResult, SessionWithKernels,
    TerminatedUpdateSummary, TerminatingSessionData,
};
use crate::admission::SystemSnapshot;
use crate::db::DbResult;

/// Persistent session and kernel state.
#[async_trait]
pub trait SchedulerRepository: Send + Sync {
    /// Scaling groups that currently accept work.
    async fn get_schedulable_scaling_groups(&self) -> DbResult<Vec<String>>;

    /// Sessions in `statuses` whose kernels satisfy `match_type` over
    /// `kernel_statuses`, with all of their kernels.
    async fn get_sessions_for_handler(
        &self,
        scaling_group: &str,
        statuses: &[SessionStatus],
        kernel_statuses: &[KernelStatus],
        match_type: KernelMatchType,
    ) -> DbResult<Vec<SessionWithKernels>>;

    /// Fresh copies of the given sessions with full kernel data.
    async fn get_sessions_with_kernels(
        &self,
        session_ids: &[SessionId],
    ) -> DbResult<Vec<SessionWithKernels>>;

    /// Applies a guarded batch write and reports which sessions moved.
    async fn update_sessions_status(
        &self,
        batch: SessionStatusBatch,
    ) -> DbResult<Vec<AppliedTransition>>;

    /// Cancels or marks sessions terminating according to their current status.
    async fn mark_sessions_terminating(
        &self,
        session_ids: &[SessionId],
        reason: &str,
    ) -> DbResult<MarkTerminationResult>;

    /// Every TERMINATING session with kernel routing data.
    async fn get_terminating_sessions(&self) -> DbResult<Vec<TerminatingSessionData>>;

    /// Commits destroy outcomes of one tick in a single transaction.
    ///
    /// Successful kernels become TERMINATED, sessions whose kernels all
    /// succeeded become TERMINATED, and occupancy of the touched agents is
    /// recomputed.
    async fn batch_update_terminated_status(
        &self,
        results: &[SessionTerminationResult],
    ) -> DbResult<TerminatedUpdateSummary>;

    /// Applies an agent-reported kernel status if the current status is in
    /// `allowed_from`.
    async fn update_kernel_status(
        &self,
        report: &KernelStatusReport,
        allowed_from: &[KernelStatus],
    ) -> DbResult<KernelStatusUpdate>;

    /// Point-in-time view used by admission validators.
    async fn load_system_snapshot(&self, scaling_group: &str) -> DbResult<SystemSnapshot>;
}
