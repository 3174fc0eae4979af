//! Intake of kernel status changes reported by agents.

use std::sync::Arc;

use sokovan_events::{event_types, AggregateType, KernelStatus, KernelStatusChangedPayload};
use tracing::{debug, instrument, warn};

use super::error::SchedulerResult;
use super::hooks::best_effort;
use super::repository::SchedulerRepository;
use super::types::{KernelStatusReport, KernelStatusUpdate, KernelTransition, ScheduleType};
use super::wake::WakeChannel;
use crate::events::{envelope, EventBus};

/// Schedule types to mark after a kernel reached `status`.
pub fn schedules_after(status: KernelStatus) -> &'static [ScheduleType] {
    match status {
        KernelStatus::Pulling | KernelStatus::Prepared => &[ScheduleType::CheckPullingProgress],
        KernelStatus::Running => &[ScheduleType::CheckCreatingProgress],
        KernelStatus::Terminated | KernelStatus::Error => &[
            ScheduleType::CheckRunningSessionTermination,
            ScheduleType::CheckTerminatingProgress,
        ],
        _ => &[],
    }
}

pub struct KernelStateEngine {
    repo: Arc<dyn SchedulerRepository>,
    wake: Arc<dyn WakeChannel>,
    events: Arc<dyn EventBus>,
}

impl KernelStateEngine {
    pub fn new(
        repo: Arc<dyn SchedulerRepository>,
        wake: Arc<dyn WakeChannel>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self { repo, wake, events }
    }

    /// Applies a reported status if the kernel may move there from where it is.
    #[instrument(skip(self, report), fields(kernel_id = %report.kernel_id, status = %report.status))]
    pub async fn handle_kernel_status(
        &self,
        report: KernelStatusReport,
    ) -> SchedulerResult<KernelStatusUpdate> {
        let allowed = KernelStatus::allowed_predecessors(report.status);
        let update = self.repo.update_kernel_status(&report, allowed).await?;

        match &update {
            KernelStatusUpdate::Applied(transition) => {
                debug!(from_status = %transition.from_status, "Kernel status applied");
                self.publish_event(transition, report.reason.clone()).await;
                for schedule_type in schedules_after(transition.to_status) {
                    best_effort("wake", self.wake.publish(*schedule_type, false)).await;
                }
            }
            KernelStatusUpdate::Rejected { current } => {
                debug!(current = %current, "Ignoring out-of-order kernel status");
            }
            KernelStatusUpdate::NotFound => {
                warn!("Status reported for unknown kernel");
            }
        }
        Ok(update)
    }

    async fn publish_event(&self, transition: &KernelTransition, reason: Option<String>) {
        let payload = KernelStatusChangedPayload {
            kernel_id: transition.kernel_id,
            session_id: transition.session_id,
            from_status: transition.from_status,
            to_status: transition.to_status,
            reason,
        };
        best_effort("kernel event", async move {
            let event = envelope(
                AggregateType::Kernel,
                transition.kernel_id.to_string(),
                event_types::KERNEL_STATUS_CHANGED,
                payload,
            )?;
            self.events.publish(event).await
        })
        .await;
    }
}
