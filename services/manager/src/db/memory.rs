//! In-memory store with the same contracts as the Postgres repositories.
//!
//! Used by tests and single-process dev runs. Every operation runs under one
//! mutex, which gives it the same all-or-nothing behavior as the
//! transactional Postgres code.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use sokovan_events::{AgentStatus, KernelStatus, SessionStatus};
use sokovan_id::{AgentId, KernelId, SessionId};
use sokovan_resource::{ResourceSlot, SlotName};

use super::{DbError, DbResult};
use crate::admission::{
    PendingSessionInfo, ResourcePolicySnapshot, SessionDependencyInfo, SessionResult, SlotType,
    SystemSnapshot,
};
use crate::agents::registry::{
    plan_heartbeat, AgentHeartbeat, AgentRecord, AgentRepository, HeartbeatOutcome,
};
use crate::scheduler::repository::SchedulerRepository;
use crate::scheduler::types::{
    classify_for_termination, AppliedTransition, KernelInfo, KernelMatchType, KernelStatusReport,
    KernelStatusUpdate, KernelTransition, MarkTerminationResult, SessionInfo, SessionStatusBatch,
    SessionTerminationResult, SessionWithKernels, TerminatedUpdateSummary, TerminatingKernelData,
    TerminatingSessionData, TerminationClass,
};

#[derive(Default)]
struct State {
    scaling_groups: BTreeMap<String, bool>,
    sessions: BTreeMap<SessionId, SessionInfo>,
    kernels: BTreeMap<KernelId, KernelInfo>,
    agents: BTreeMap<AgentId, AgentRecord>,
    private_sessions: HashSet<SessionId>,
    results: HashMap<SessionId, SessionResult>,
    dependencies: Vec<(SessionId, SessionId)>,
    resource_policy: ResourcePolicySnapshot,
    slot_types: BTreeMap<SlotName, SlotType>,
    terminated_batches: Vec<Vec<SessionTerminationResult>>,
    unavailable: bool,
    fail_next: HashSet<&'static str>,
}

impl State {
    fn check(&mut self, operation: &'static str) -> DbResult<()> {
        if self.unavailable || self.fail_next.remove(operation) {
            return Err(DbError::Unavailable(format!("{operation} refused")));
        }
        Ok(())
    }

    fn kernels_of(&self, session_id: SessionId) -> Vec<KernelInfo> {
        self.kernels
            .values()
            .filter(|k| k.session_id == session_id)
            .cloned()
            .collect()
    }

    fn with_kernels(&self, session: &SessionInfo) -> SessionWithKernels {
        SessionWithKernels {
            session: session.clone(),
            kernels: self.kernels_of(session.id),
        }
    }

    fn set_kernels_of_sessions(&mut self, sessions: &[SessionId], to_status: KernelStatus) {
        for kernel in self.kernels.values_mut() {
            if sessions.contains(&kernel.session_id) && !kernel.status.is_dead() {
                kernel.status = to_status;
            }
        }
    }

    fn recompute_agent_occupancy(&mut self, agent_id: &AgentId) -> bool {
        let occupied: ResourceSlot = self
            .kernels
            .values()
            .filter(|k| k.agent_id.as_ref() == Some(agent_id))
            .filter(|k| k.status.occupies_agent_resources())
            .map(|k| k.occupied_slots.as_ref().unwrap_or(&k.requested_slots))
            .sum();
        match self.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.occupied_slots = occupied;
                true
            }
            None => false,
        }
    }
}

/// Shared in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_scaling_group(&self, name: impl Into<String>, is_active: bool) {
        self.state().scaling_groups.insert(name.into(), is_active);
    }

    pub fn insert_session(&self, session: SessionInfo) {
        let mut state = self.state();
        state
            .scaling_groups
            .entry(session.scaling_group.clone())
            .or_insert(true);
        state.sessions.insert(session.id, session);
    }

    pub fn insert_kernel(&self, kernel: KernelInfo) {
        self.state().kernels.insert(kernel.id, kernel);
    }

    pub fn insert_agent(&self, agent: AgentRecord) {
        self.state().agents.insert(agent.id.clone(), agent);
    }

    /// Counts the session against the SFTP concurrency limit.
    pub fn mark_private(&self, session_id: SessionId) {
        self.state().private_sessions.insert(session_id);
    }

    pub fn set_result(&self, session_id: SessionId, result: SessionResult) {
        self.state().results.insert(session_id, result);
    }

    pub fn add_dependency(&self, session_id: SessionId, depends_on: SessionId) {
        self.state().dependencies.push((session_id, depends_on));
    }

    pub fn set_resource_policy(&self, policy: ResourcePolicySnapshot) {
        self.state().resource_policy = policy;
    }

    pub fn register_slot_type(&self, slot: SlotName, slot_type: SlotType) {
        self.state().slot_types.insert(slot, slot_type);
    }

    pub fn session(&self, id: SessionId) -> Option<SessionInfo> {
        self.state().sessions.get(&id).cloned()
    }

    pub fn kernel(&self, id: KernelId) -> Option<KernelInfo> {
        self.state().kernels.get(&id).cloned()
    }

    pub fn agent(&self, id: &AgentId) -> Option<AgentRecord> {
        self.state().agents.get(id).cloned()
    }

    /// Every argument passed to `batch_update_terminated_status`, in order.
    pub fn terminated_batches(&self) -> Vec<Vec<SessionTerminationResult>> {
        self.state().terminated_batches.clone()
    }

    /// Makes every operation fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Makes the next call of `operation` fail.
    pub fn fail_next(&self, operation: &'static str) {
        self.state().fail_next.insert(operation);
    }
}

#[async_trait]
impl SchedulerRepository for MemoryStore {
    async fn get_schedulable_scaling_groups(&self) -> DbResult<Vec<String>> {
        let mut state = self.state();
        state.check("get_schedulable_scaling_groups")?;
        Ok(state
            .scaling_groups
            .iter()
            .filter(|(_, active)| **active)
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn get_sessions_for_handler(
        &self,
        scaling_group: &str,
        statuses: &[SessionStatus],
        kernel_statuses: &[KernelStatus],
        match_type: KernelMatchType,
    ) -> DbResult<Vec<SessionWithKernels>> {
        let mut state = self.state();
        state.check("get_sessions_for_handler")?;
        let mut matched: Vec<SessionWithKernels> = state
            .sessions
            .values()
            .filter(|s| s.scaling_group == scaling_group && statuses.contains(&s.status))
            .map(|s| state.with_kernels(s))
            .filter(|s| match_type.matches(s.kernel_statuses(), kernel_statuses))
            .collect();
        matched.sort_by(|a, b| {
            (a.session.created_at, a.session.id).cmp(&(b.session.created_at, b.session.id))
        });
        Ok(matched)
    }

    async fn get_sessions_with_kernels(
        &self,
        session_ids: &[SessionId],
    ) -> DbResult<Vec<SessionWithKernels>> {
        let mut state = self.state();
        state.check("get_sessions_with_kernels")?;
        Ok(session_ids
            .iter()
            .filter_map(|id| state.sessions.get(id))
            .map(|s| state.with_kernels(s))
            .collect())
    }

    async fn update_sessions_status(
        &self,
        batch: SessionStatusBatch,
    ) -> DbResult<Vec<AppliedTransition>> {
        let mut state = self.state();
        state.check("update_sessions_status")?;
        let now = Utc::now();
        let mut applied = Vec::new();
        for entry in &batch.entries {
            let Some(session) = state.sessions.get_mut(&entry.session_id) else {
                continue;
            };
            if !batch.from_statuses.contains(&session.status) {
                continue;
            }
            applied.push(AppliedTransition {
                session_id: session.id,
                from_status: session.status,
            });
            session.status = batch.to_status;
            if let Some(info) = &batch.status_info {
                session.status_info = Some(info.clone());
            }
            if let Some(slots) = &entry.occupying_slots {
                session.occupying_slots = Some(slots.clone());
            }
            if batch.stamps_terminated_at() {
                session.terminated_at = Some(now);
            }
        }
        Ok(applied)
    }

    async fn mark_sessions_terminating(
        &self,
        session_ids: &[SessionId],
        reason: &str,
    ) -> DbResult<MarkTerminationResult> {
        let mut state = self.state();
        state.check("mark_sessions_terminating")?;
        let now = Utc::now();
        let mut result = MarkTerminationResult::default();
        for id in session_ids {
            let Some(session) = state.sessions.get_mut(id) else {
                result.not_found.push(*id);
                continue;
            };
            match classify_for_termination(session.status) {
                TerminationClass::Cancel => {
                    session.status = SessionStatus::Cancelled;
                    session.status_info = Some(reason.to_string());
                    session.terminated_at = Some(now);
                    result.cancelled.push(*id);
                }
                TerminationClass::Terminate => {
                    session.status = SessionStatus::Terminating;
                    session.status_info = Some(reason.to_string());
                    result.terminating.push(*id);
                }
                TerminationClass::Skip => result.skipped.push(*id),
            }
        }
        let cancelled = result.cancelled.clone();
        let terminating = result.terminating.clone();
        state.set_kernels_of_sessions(&cancelled, KernelStatus::Cancelled);
        state.set_kernels_of_sessions(&terminating, KernelStatus::Terminating);
        Ok(result)
    }

    async fn get_terminating_sessions(&self) -> DbResult<Vec<TerminatingSessionData>> {
        let mut state = self.state();
        state.check("get_terminating_sessions")?;
        Ok(state
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Terminating)
            .map(|s| TerminatingSessionData {
                session_id: s.id,
                creation_id: s.creation_id.clone(),
                access_key: s.access_key.clone(),
                scaling_group: s.scaling_group.clone(),
                status_info: s.status_info.clone(),
                kernels: state
                    .kernels_of(s.id)
                    .into_iter()
                    .map(|k| TerminatingKernelData {
                        kernel_id: k.id,
                        status: k.status,
                        agent_id: k.agent_id,
                        agent_addr: k.agent_addr,
                        container_id: k.container_id,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn batch_update_terminated_status(
        &self,
        results: &[SessionTerminationResult],
    ) -> DbResult<TerminatedUpdateSummary> {
        let mut state = self.state();
        state.check("batch_update_terminated_status")?;
        state.terminated_batches.push(results.to_vec());
        let now = Utc::now();
        let mut summary = TerminatedUpdateSummary::default();
        let mut agents = BTreeSet::new();

        for result in results {
            for kernel_result in &result.kernel_results {
                if let Some(agent_id) = &kernel_result.agent_id {
                    agents.insert(agent_id.clone());
                }
                if !kernel_result.success {
                    continue;
                }
                if let Some(kernel) = state.kernels.get_mut(&kernel_result.kernel_id) {
                    if !kernel.status.is_dead() {
                        kernel.status = KernelStatus::Terminated;
                        summary.kernels_terminated += 1;
                    }
                }
            }
            if !result.should_terminate_session() {
                continue;
            }
            if let Some(session) = state.sessions.get_mut(&result.session_id) {
                if session.status == SessionStatus::Terminating {
                    session.status = SessionStatus::Terminated;
                    session.terminated_at = Some(now);
                    summary.sessions_terminated.push(session.id);
                }
            }
        }

        for agent_id in &agents {
            if state.recompute_agent_occupancy(agent_id) {
                summary.agents_synced += 1;
            }
        }
        Ok(summary)
    }

    async fn update_kernel_status(
        &self,
        report: &KernelStatusReport,
        allowed_from: &[KernelStatus],
    ) -> DbResult<KernelStatusUpdate> {
        let mut state = self.state();
        state.check("update_kernel_status")?;
        let Some(kernel) = state.kernels.get_mut(&report.kernel_id) else {
            return Ok(KernelStatusUpdate::NotFound);
        };
        let current = kernel.status;
        if !allowed_from.contains(&current) {
            return Ok(KernelStatusUpdate::Rejected { current });
        }
        kernel.status = report.status;
        if let Some(slots) = &report.occupied_slots {
            kernel.occupied_slots = Some(slots.clone());
        }
        if let Some(container_id) = &report.container_id {
            kernel.container_id = Some(container_id.clone());
        }
        Ok(KernelStatusUpdate::Applied(KernelTransition {
            kernel_id: kernel.id,
            session_id: kernel.session_id,
            from_status: current,
            to_status: report.status,
        }))
    }

    async fn load_system_snapshot(&self, scaling_group: &str) -> DbResult<SystemSnapshot> {
        let mut state = self.state();
        state.check("load_system_snapshot")?;
        let mut snapshot = SystemSnapshot {
            resource_policy: state.resource_policy.clone(),
            known_slot_types: state.slot_types.clone(),
            ..SystemSnapshot::default()
        };

        for agent in state.agents.values() {
            if agent.scaling_group == scaling_group && agent.status == AgentStatus::Alive {
                snapshot.total_capacity += &agent.available_slots;
                snapshot
                    .resource_occupancy
                    .by_agent
                    .insert(agent.id.clone(), agent.occupied_slots.clone());
            }
        }

        let occupancy = &mut snapshot.resource_occupancy;
        for kernel in state.kernels.values() {
            if !kernel.status.occupies_agent_resources() {
                continue;
            }
            let Some(session) = state.sessions.get(&kernel.session_id) else {
                continue;
            };
            let slots = kernel.occupied_slots.as_ref().unwrap_or(&kernel.requested_slots);
            *occupancy
                .by_keypair
                .entry(session.access_key.clone())
                .or_default() += slots;
            *occupancy.by_user.entry(session.user_id).or_default() += slots;
            *occupancy.by_group.entry(session.project_id).or_default() += slots;
            *occupancy
                .by_domain
                .entry(session.domain_name.clone())
                .or_default() += slots;
        }

        let live = |status: SessionStatus| {
            !matches!(
                status,
                SessionStatus::Pending | SessionStatus::Terminated | SessionStatus::Cancelled
            )
        };
        for session in state.sessions.values().filter(|s| live(s.status)) {
            let counters = if state.private_sessions.contains(&session.id) {
                &mut snapshot.concurrency.sftp_sessions_by_keypair
            } else {
                &mut snapshot.concurrency.sessions_by_keypair
            };
            *counters.entry(session.access_key.clone()).or_default() += 1;
        }

        let pending_here: Vec<&SessionInfo> = state
            .sessions
            .values()
            .filter(|s| s.scaling_group == scaling_group && s.status == SessionStatus::Pending)
            .collect();
        let pending_keys: HashSet<_> = pending_here.iter().map(|s| &s.access_key).collect();
        let mut pending: Vec<&SessionInfo> = state
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Pending && pending_keys.contains(&s.access_key))
            .collect();
        pending.sort_by_key(|s| (s.created_at, s.id));
        for session in pending {
            snapshot
                .pending_sessions
                .by_keypair
                .entry(session.access_key.clone())
                .or_default()
                .push(PendingSessionInfo {
                    session_id: session.id,
                    requested_slots: session.requested_slots.clone(),
                    creation_time: session.created_at,
                });
        }

        let pending_ids: HashSet<SessionId> = pending_here.iter().map(|s| s.id).collect();
        for (session_id, depends_on) in &state.dependencies {
            if !pending_ids.contains(session_id) {
                continue;
            }
            let Some(dependency) = state.sessions.get(depends_on) else {
                continue;
            };
            snapshot
                .session_dependencies
                .by_session
                .entry(*session_id)
                .or_default()
                .push(SessionDependencyInfo {
                    depends_on: *depends_on,
                    status: dependency.status,
                    result: state.results.get(depends_on).copied().unwrap_or_default(),
                });
        }

        Ok(snapshot)
    }
}

#[async_trait]
impl AgentRepository for MemoryStore {
    async fn apply_heartbeat(
        &self,
        agent_id: &AgentId,
        heartbeat: &AgentHeartbeat,
    ) -> DbResult<HeartbeatOutcome> {
        let mut state = self.state();
        state.check("apply_heartbeat")?;
        let plan = plan_heartbeat(state.agents.get(agent_id), agent_id, heartbeat, Utc::now());
        if let Some(record) = plan.record() {
            state.agents.insert(agent_id.clone(), record.clone());
        }
        Ok(plan.outcome(agent_id))
    }

    async fn get_agent(&self, agent_id: &AgentId) -> DbResult<Option<AgentRecord>> {
        let mut state = self.state();
        state.check("get_agent")?;
        Ok(state.agents.get(agent_id).cloned())
    }
}
