//! Shared fixtures for manager integration tests.
//!
//! Everything runs against the in-memory adapters, so no database or agent
//! processes are needed.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use sokovan_events::{KernelStatus, SessionStatus, SessionStatusChangedPayload};
use sokovan_id::{AccessKey, AgentId, KernelId, ProjectId, SessionId, UserId};
use sokovan_manager::agents::{AgentHeartbeat, AgentRecord, FakeAgentClientPool};
use sokovan_manager::db::MemoryStore;
use sokovan_manager::events::RecordingEventBus;
use sokovan_manager::scheduler::types::{KernelInfo, SessionInfo};
use sokovan_manager::scheduler::{
    HookRegistry, LifecycleCoordinator, MemoryLockService, MemoryWakeChannel,
    PromotionHandlerRegistry, SchedulerContext, TerminationCoordinator,
};
use sokovan_resource::ResourceSlot;

pub const LOCK_TTL: Duration = Duration::from_secs(30);
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub locks: Arc<MemoryLockService>,
    pub wake: Arc<MemoryWakeChannel>,
    pub events: Arc<RecordingEventBus>,
    pub agents: Arc<FakeAgentClientPool>,
    pub hooks: HookRegistry,
    pub rpc_timeout: Duration,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            locks: Arc::new(MemoryLockService::new("test-replica")),
            wake: Arc::new(MemoryWakeChannel::new()),
            events: Arc::new(RecordingEventBus::new()),
            agents: Arc::new(FakeAgentClientPool::new()),
            hooks: HookRegistry::new(),
            rpc_timeout: RPC_TIMEOUT,
        }
    }

    pub fn with_agents(mut self, agents: FakeAgentClientPool) -> Self {
        self.agents = Arc::new(agents);
        self
    }

    pub fn with_events(mut self, events: RecordingEventBus) -> Self {
        self.events = Arc::new(events);
        self
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn context(&self) -> SchedulerContext {
        SchedulerContext {
            repo: self.store.clone(),
            wake: self.wake.clone(),
            events: self.events.clone(),
            hooks: self.hooks.clone(),
        }
    }

    pub fn handlers(&self) -> PromotionHandlerRegistry {
        PromotionHandlerRegistry::standard(self.context())
    }

    pub fn lifecycle(&self) -> LifecycleCoordinator {
        LifecycleCoordinator::new(self.store.clone(), self.locks.clone(), LOCK_TTL)
    }

    pub fn termination(&self) -> TerminationCoordinator {
        TerminationCoordinator::new(
            self.store.clone(),
            self.locks.clone(),
            self.wake.clone(),
            self.events.clone(),
            self.agents.clone(),
            self.hooks.clone(),
            LOCK_TTL,
            self.rpc_timeout,
        )
    }

    /// Decoded `session.status_changed` payloads, oldest first.
    pub fn status_changes(&self) -> Vec<SessionStatusChangedPayload> {
        self.events
            .events_of_type(sokovan_events::event_types::SESSION_STATUS_CHANGED)
            .into_iter()
            .map(|e| serde_json::from_value(e.payload).unwrap())
            .collect()
    }

    pub fn status_changes_to(&self, status: SessionStatus) -> Vec<SessionStatusChangedPayload> {
        self.status_changes()
            .into_iter()
            .filter(|p| p.to_status == status)
            .collect()
    }
}

pub fn cpu(value: Decimal) -> ResourceSlot {
    ResourceSlot::try_from_pairs([("cpu", value)]).unwrap()
}

pub fn access_key(name: &str) -> AccessKey {
    AccessKey::parse(name).unwrap()
}

pub fn session(status: SessionStatus, scaling_group: &str) -> SessionInfo {
    SessionInfo {
        id: SessionId::new(),
        creation_id: format!("cr-{}", ulid_suffix()),
        access_key: access_key("AKTEST"),
        user_id: UserId::new(),
        project_id: ProjectId::new(),
        domain_name: "default".to_string(),
        scaling_group: scaling_group.to_string(),
        status,
        status_info: None,
        requested_slots: ResourceSlot::new(),
        occupying_slots: None,
        created_at: Utc::now(),
        terminated_at: None,
    }
}

pub fn kernel(session_id: SessionId, status: KernelStatus, agent: Option<&AgentRecord>) -> KernelInfo {
    KernelInfo {
        id: KernelId::new(),
        session_id,
        status,
        agent_id: agent.map(|a| a.id.clone()),
        agent_addr: agent.map(|a| a.addr.clone()),
        container_id: agent.map(|_| format!("ctr-{}", ulid_suffix())),
        requested_slots: ResourceSlot::new(),
        occupied_slots: None,
    }
}

pub fn heartbeat(addr: &str, scaling_group: &str) -> AgentHeartbeat {
    AgentHeartbeat {
        addr: addr.to_string(),
        public_key: None,
        scaling_group: scaling_group.to_string(),
        region: "local".to_string(),
        architecture: "x86_64".to_string(),
        version: "24.03.0".to_string(),
        available_slots: cpu(Decimal::from(16)),
        compute_plugins: vec!["cpu".to_string()],
    }
}

pub fn agent(name: &str, scaling_group: &str) -> AgentRecord {
    let id = AgentId::parse(name).unwrap();
    let hb = heartbeat(&format!("http://{name}.agents.local:6001"), scaling_group);
    AgentRecord::from_heartbeat(id, &hb, Utc::now())
}

/// Inserts a session with one kernel per status, all on `agent`.
pub fn seed_session(
    store: &MemoryStore,
    status: SessionStatus,
    kernel_statuses: &[KernelStatus],
    agent: Option<&AgentRecord>,
) -> (SessionInfo, Vec<KernelInfo>) {
    let s = session(status, "default");
    store.insert_session(s.clone());
    let kernels: Vec<KernelInfo> = kernel_statuses
        .iter()
        .map(|status| kernel(s.id, *status, agent))
        .collect();
    for k in &kernels {
        store.insert_kernel(k.clone());
    }
    (s, kernels)
}

fn ulid_suffix() -> String {
    SessionId::new().to_string().chars().rev().take(8).collect()
}
