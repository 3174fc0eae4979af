//! Data carried through scheduler ticks.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sokovan_events::{KernelStatus, SessionStatus};
use sokovan_id::{AccessKey, AgentId, KernelId, ProjectId, SessionId, UserId};
use sokovan_resource::ResourceSlot;

// =============================================================================
// Sessions and kernels
// =============================================================================

/// Persisted kernel state as seen by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelInfo {
    pub id: KernelId,
    pub session_id: SessionId,
    pub status: KernelStatus,
    pub agent_id: Option<AgentId>,
    pub agent_addr: Option<String>,
    pub container_id: Option<String>,
    pub requested_slots: ResourceSlot,
    /// Set by the agent once the container holds resources.
    pub occupied_slots: Option<ResourceSlot>,
}

/// Persisted session state as seen by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub creation_id: String,
    pub access_key: AccessKey,
    pub user_id: UserId,
    pub project_id: ProjectId,
    pub domain_name: String,
    pub scaling_group: String,
    pub status: SessionStatus,
    pub status_info: Option<String>,
    pub requested_slots: ResourceSlot,
    /// Only populated once every kernel is running.
    pub occupying_slots: Option<ResourceSlot>,
    pub created_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionWithKernels {
    pub session: SessionInfo,
    pub kernels: Vec<KernelInfo>,
}

impl SessionWithKernels {
    pub fn id(&self) -> SessionId {
        self.session.id
    }

    pub fn kernel_statuses(&self) -> impl Iterator<Item = KernelStatus> + '_ {
        self.kernels.iter().map(|k| k.status)
    }

    /// Identity used when recording a transition of this session.
    pub fn transition_info(&self) -> SessionTransitionInfo {
        SessionTransitionInfo {
            session_id: self.session.id,
            creation_id: self.session.creation_id.clone(),
            access_key: self.session.access_key.clone(),
            from_status: self.session.status,
        }
    }
}

// =============================================================================
// Handler metadata
// =============================================================================

/// How kernel statuses combine to qualify a session for a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelMatchType {
    /// Every kernel is in a target status.
    All,
    /// At least one kernel is in a target status.
    Any,
    /// No kernel is in a target status.
    NotAny,
}

impl KernelMatchType {
    /// A session without kernels never matches `All` or `Any`.
    pub fn matches<I>(&self, kernel_statuses: I, targets: &[KernelStatus]) -> bool
    where
        I: IntoIterator<Item = KernelStatus>,
    {
        let mut seen = false;
        match self {
            KernelMatchType::All => {
                for status in kernel_statuses {
                    seen = true;
                    if !targets.contains(&status) {
                        return false;
                    }
                }
                seen
            }
            KernelMatchType::Any => kernel_statuses.into_iter().any(|s| targets.contains(&s)),
            KernelMatchType::NotAny => !kernel_statuses.into_iter().any(|s| targets.contains(&s)),
        }
    }
}

/// Cluster-wide locks, one per session status group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockId {
    SokovanTargetPending,
    SokovanTargetPreparing,
    SokovanTargetCreating,
    SokovanTargetRunning,
    SokovanTargetTerminating,
}

impl LockId {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockId::SokovanTargetPending => "sokovan.target.pending",
            LockId::SokovanTargetPreparing => "sokovan.target.preparing",
            LockId::SokovanTargetCreating => "sokovan.target.creating",
            LockId::SokovanTargetRunning => "sokovan.target.running",
            LockId::SokovanTargetTerminating => "sokovan.target.terminating",
        }
    }
}

impl std::fmt::Display for LockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Targets of "schedule needed" wake signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScheduleType {
    /// Place pending sessions; consumed by the admission workflow.
    Schedule,
    /// Launch prepared sessions; consumed by the launcher.
    Start,
    CheckPullingProgress,
    CheckCreatingProgress,
    CheckTerminatingProgress,
    CheckRunningSessionTermination,
    Terminate,
}

impl ScheduleType {
    pub const ALL: &'static [ScheduleType] = &[
        ScheduleType::Schedule,
        ScheduleType::Start,
        ScheduleType::CheckPullingProgress,
        ScheduleType::CheckCreatingProgress,
        ScheduleType::CheckTerminatingProgress,
        ScheduleType::CheckRunningSessionTermination,
        ScheduleType::Terminate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Schedule => "schedule",
            ScheduleType::Start => "start",
            ScheduleType::CheckPullingProgress => "check_pulling_progress",
            ScheduleType::CheckCreatingProgress => "check_creating_progress",
            ScheduleType::CheckTerminatingProgress => "check_terminating_progress",
            ScheduleType::CheckRunningSessionTermination => "check_running_session_termination",
            ScheduleType::Terminate => "terminate",
        }
    }
}

impl std::fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScheduleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScheduleType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown schedule type: {s}"))
    }
}

/// Periodic task cadence for one schedule type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerTaskSpec {
    pub schedule_type: ScheduleType,
    /// "Process if needed" cadence; `None` disables the short task.
    pub short_interval: Option<Duration>,
    /// Forced processing cadence.
    pub long_interval: Duration,
    pub initial_delay: Duration,
}

impl SchedulerTaskSpec {
    /// Task specs for every schedule type this service processes itself.
    pub fn defaults(short: Duration, long: Duration, initial_delay: Duration) -> Vec<Self> {
        [
            ScheduleType::CheckPullingProgress,
            ScheduleType::CheckCreatingProgress,
            ScheduleType::CheckRunningSessionTermination,
            ScheduleType::CheckTerminatingProgress,
            ScheduleType::Terminate,
        ]
        .into_iter()
        .map(|schedule_type| SchedulerTaskSpec {
            schedule_type,
            short_interval: Some(short),
            long_interval: long,
            initial_delay,
        })
        .collect()
    }
}

/// Target statuses a handler declares for each execution outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromotionStatusTransitions {
    pub success: SessionStatus,
    pub need_retry: Option<SessionStatus>,
    pub expired: Option<SessionStatus>,
    pub give_up: Option<SessionStatus>,
}

impl PromotionStatusTransitions {
    pub const fn success_only(success: SessionStatus) -> Self {
        Self {
            success,
            need_retry: None,
            expired: None,
            give_up: None,
        }
    }

    pub fn for_failure(&self, kind: FailureKind) -> Option<SessionStatus> {
        match kind {
            FailureKind::NeedRetry => self.need_retry,
            FailureKind::GiveUp => self.give_up,
        }
    }
}

// =============================================================================
// Execution results
// =============================================================================

/// Identity of a session at the moment a handler looked at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTransitionInfo {
    pub session_id: SessionId,
    pub creation_id: String,
    pub access_key: AccessKey,
    pub from_status: SessionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Try again on a later tick.
    NeedRetry,
    /// Stop trying.
    GiveUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionFailure {
    pub session: SessionTransitionInfo,
    pub kind: FailureKind,
    pub reason: String,
}

/// Data for the events and hooks that follow a successful transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledSessionData {
    pub session_id: SessionId,
    pub creation_id: String,
    pub access_key: AccessKey,
    pub from_status: SessionStatus,
    pub reason: String,
}

/// Aggregate occupancy to store together with a RUNNING transition.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRunningData {
    pub session_id: SessionId,
    pub occupying_slots: ResourceSlot,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub successes: Vec<SessionTransitionInfo>,
    pub failures: Vec<ExecutionFailure>,
    pub stales: Vec<SessionTransitionInfo>,
    pub scheduled_data: Vec<ScheduledSessionData>,
    pub sessions_running_data: Vec<SessionRunningData>,
}

impl ExecutionResult {
    pub fn success_ids(&self) -> Vec<SessionId> {
        self.successes.iter().map(|s| s.session_id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.successes.is_empty() && self.failures.is_empty() && self.stales.is_empty()
    }

    pub fn needs_post_processing(&self) -> bool {
        !self.scheduled_data.is_empty()
    }

    /// Drops success-side data for sessions the guarded update did not touch.
    pub fn retain_applied(&mut self, applied: &HashSet<SessionId>) {
        self.successes.retain(|s| applied.contains(&s.session_id));
        self.scheduled_data.retain(|s| applied.contains(&s.session_id));
        self.sessions_running_data
            .retain(|s| applied.contains(&s.session_id));
    }
}

// =============================================================================
// Batched status writes
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatusEntry {
    pub session_id: SessionId,
    pub occupying_slots: Option<ResourceSlot>,
}

/// One compare-and-set status write covering many sessions.
///
/// Only sessions whose current status is in `from_statuses` are updated.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatusBatch {
    pub to_status: SessionStatus,
    pub from_statuses: Vec<SessionStatus>,
    pub entries: Vec<SessionStatusEntry>,
    pub status_info: Option<String>,
}

impl SessionStatusBatch {
    pub fn new(to_status: SessionStatus, from_statuses: &[SessionStatus]) -> Self {
        Self {
            to_status,
            from_statuses: from_statuses.to_vec(),
            entries: Vec::new(),
            status_info: None,
        }
    }

    pub fn with_sessions(mut self, ids: impl IntoIterator<Item = SessionId>) -> Self {
        self.entries
            .extend(ids.into_iter().map(|session_id| SessionStatusEntry {
                session_id,
                occupying_slots: None,
            }));
        self
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.status_info = Some(info.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Terminal targets also stamp `terminated_at`.
    pub fn stamps_terminated_at(&self) -> bool {
        self.to_status.is_terminal()
    }
}

/// A session the guarded write actually moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedTransition {
    pub session_id: SessionId,
    pub from_status: SessionStatus,
}

// =============================================================================
// Termination
// =============================================================================

/// Outcome of [`classify_for_termination`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationClass {
    Cancel,
    Terminate,
    Skip,
}

/// Decides what a termination request does to a session in `status`.
pub fn classify_for_termination(status: SessionStatus) -> TerminationClass {
    if status.is_termination_skipped() {
        TerminationClass::Skip
    } else if status.is_cancellable() {
        TerminationClass::Cancel
    } else {
        TerminationClass::Terminate
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkTerminationResult {
    pub cancelled: Vec<SessionId>,
    pub terminating: Vec<SessionId>,
    pub skipped: Vec<SessionId>,
    pub not_found: Vec<SessionId>,
}

impl MarkTerminationResult {
    /// Whether any session changed status and needs follow-up work.
    pub fn has_processed(&self) -> bool {
        !self.cancelled.is_empty() || !self.terminating.is_empty()
    }

    pub fn processed_count(&self) -> usize {
        self.cancelled.len() + self.terminating.len()
    }
}

/// Kernel routing data needed to issue a destroy call without a second query.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminatingKernelData {
    pub kernel_id: KernelId,
    pub status: KernelStatus,
    pub agent_id: Option<AgentId>,
    pub agent_addr: Option<String>,
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TerminatingSessionData {
    pub session_id: SessionId,
    pub creation_id: String,
    pub access_key: AccessKey,
    pub scaling_group: String,
    pub status_info: Option<String>,
    pub kernels: Vec<TerminatingKernelData>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelTerminationResult {
    pub kernel_id: KernelId,
    pub agent_id: Option<AgentId>,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTerminationResult {
    pub session_id: SessionId,
    pub access_key: AccessKey,
    pub creation_id: String,
    pub reason: String,
    pub kernel_results: Vec<KernelTerminationResult>,
}

impl SessionTerminationResult {
    /// A session finalizes only when every kernel was destroyed.
    pub fn should_terminate_session(&self) -> bool {
        self.kernel_results.iter().all(|k| k.success)
    }

    pub fn failed_kernels(&self) -> impl Iterator<Item = &KernelTerminationResult> {
        self.kernel_results.iter().filter(|k| !k.success)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminatedUpdateSummary {
    pub sessions_terminated: Vec<SessionId>,
    pub kernels_terminated: usize,
    pub agents_synced: usize,
}

// =============================================================================
// Kernel status intake
// =============================================================================

/// A kernel status change reported by an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelStatusReport {
    pub kernel_id: KernelId,
    pub status: KernelStatus,
    pub reason: Option<String>,
    /// Resources the container actually holds, sent once it is running.
    pub occupied_slots: Option<ResourceSlot>,
    pub container_id: Option<String>,
}

impl KernelStatusReport {
    pub fn new(kernel_id: KernelId, status: KernelStatus) -> Self {
        Self {
            kernel_id,
            status,
            reason: None,
            occupied_slots: None,
            container_id: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_occupied_slots(mut self, slots: ResourceSlot) -> Self {
        self.occupied_slots = Some(slots);
        self
    }

    pub fn with_container_id(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelTransition {
    pub kernel_id: KernelId,
    pub session_id: SessionId,
    pub from_status: KernelStatus,
    pub to_status: KernelStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelStatusUpdate {
    Applied(KernelTransition),
    /// The kernel exists but its current status may not move to the target.
    Rejected { current: KernelStatus },
    NotFound,
}

/// Sum of kernel occupancy per session. A kernel that has not reported its
/// occupied slots counts as empty.
pub fn sum_kernel_occupancy(kernels: &[KernelInfo]) -> ResourceSlot {
    kernels
        .iter()
        .filter_map(|k| k.occupied_slots.as_ref())
        .fold(ResourceSlot::new(), |mut acc, slots| {
            acc += slots;
            acc
        })
}

/// Groups kernels by session, preserving kernel order inside a session.
pub fn group_kernels(kernels: Vec<KernelInfo>) -> BTreeMap<SessionId, Vec<KernelInfo>> {
    let mut grouped: BTreeMap<SessionId, Vec<KernelInfo>> = BTreeMap::new();
    for kernel in kernels {
        grouped.entry(kernel.session_id).or_default().push(kernel);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use rust_decimal_macros::dec;
    use KernelStatus::*;

    #[rstest]
    #[case(KernelMatchType::All, vec![Running, Running], true)]
    #[case(KernelMatchType::All, vec![Running, Creating], false)]
    #[case(KernelMatchType::All, vec![], false)]
    #[case(KernelMatchType::Any, vec![Creating, Running], true)]
    #[case(KernelMatchType::Any, vec![Creating], false)]
    #[case(KernelMatchType::Any, vec![], false)]
    #[case(KernelMatchType::NotAny, vec![Creating], true)]
    #[case(KernelMatchType::NotAny, vec![Creating, Running], false)]
    #[case(KernelMatchType::NotAny, vec![], true)]
    fn test_kernel_match_type(
        #[case] match_type: KernelMatchType,
        #[case] statuses: Vec<KernelStatus>,
        #[case] expected: bool,
    ) {
        assert_eq!(match_type.matches(statuses, &[Running]), expected);
    }

    #[rstest]
    #[case(SessionStatus::Pending, TerminationClass::Cancel)]
    #[case(SessionStatus::Pulling, TerminationClass::Cancel)]
    #[case(SessionStatus::Scheduled, TerminationClass::Terminate)]
    #[case(SessionStatus::Preparing, TerminationClass::Terminate)]
    #[case(SessionStatus::Running, TerminationClass::Terminate)]
    #[case(SessionStatus::Error, TerminationClass::Terminate)]
    #[case(SessionStatus::Terminating, TerminationClass::Skip)]
    #[case(SessionStatus::Terminated, TerminationClass::Skip)]
    #[case(SessionStatus::Cancelled, TerminationClass::Skip)]
    fn test_classify_for_termination(
        #[case] status: SessionStatus,
        #[case] expected: TerminationClass,
    ) {
        assert_eq!(classify_for_termination(status), expected);
    }

    #[test]
    fn test_schedule_type_parse_roundtrip() {
        for t in ScheduleType::ALL {
            assert_eq!(t.as_str().parse::<ScheduleType>().unwrap(), *t);
        }
        assert!("sweep".parse::<ScheduleType>().is_err());
    }

    #[test]
    fn test_should_terminate_session_requires_every_kernel() {
        let ok = KernelTerminationResult {
            kernel_id: KernelId::new(),
            agent_id: None,
            success: true,
            error: None,
        };
        let failed = KernelTerminationResult {
            kernel_id: KernelId::new(),
            agent_id: None,
            success: false,
            error: Some("Network error".to_string()),
        };
        let mut result = SessionTerminationResult {
            session_id: SessionId::new(),
            access_key: AccessKey::parse("AKTEST").unwrap(),
            creation_id: "c1".to_string(),
            reason: "user-requested".to_string(),
            kernel_results: vec![ok.clone()],
        };
        assert!(result.should_terminate_session());

        result.kernel_results.push(failed);
        assert!(!result.should_terminate_session());
        assert_eq!(result.failed_kernels().count(), 1);
    }

    #[test]
    fn test_sum_kernel_occupancy_counts_missing_as_empty() {
        let session_id = SessionId::new();
        let kernel = |slots: Option<ResourceSlot>| KernelInfo {
            id: KernelId::new(),
            session_id,
            status: Running,
            agent_id: None,
            agent_addr: None,
            container_id: None,
            requested_slots: ResourceSlot::new(),
            occupied_slots: slots,
        };
        let cpu = |v| ResourceSlot::try_from_pairs([("cpu", v)]).unwrap();

        let kernels = vec![kernel(Some(cpu(dec!(1)))), kernel(Some(cpu(dec!(2.5))))];
        assert_eq!(sum_kernel_occupancy(&kernels), cpu(dec!(3.5)));

        let missing = vec![kernel(Some(cpu(dec!(1)))), kernel(None)];
        assert_eq!(sum_kernel_occupancy(&missing), cpu(dec!(1)));
        assert!(sum_kernel_occupancy(&[kernel(None)]).is_empty());
    }

    #[test]
    fn test_default_task_specs_cover_processed_types() {
        let specs = SchedulerTaskSpec::defaults(
            Duration::from_secs(2),
            Duration::from_secs(60),
            Duration::from_secs(30),
        );
        let types: Vec<_> = specs.iter().map(|s| s.schedule_type).collect();
        assert!(types.contains(&ScheduleType::Terminate));
        assert!(!types.contains(&ScheduleType::Schedule));
        assert!(specs.iter().all(|s| s.short_interval == Some(Duration::from_secs(2))));
    }
}
