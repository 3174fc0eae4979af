//! Fleet agents: heartbeat reconciliation and RPC clients.

pub mod client;
pub mod registry;

pub use client::{
    AgentClientPool, AgentRpcError, DestroyKernelRequest, FakeAgentClientPool,
    HttpAgentClientPool,
};
pub use registry::{
    plan_heartbeat, AgentHeartbeat, AgentRecord, AgentRegistry, AgentRepository,
    HeartbeatOutcome, HeartbeatOutcomeKind, HeartbeatPlan,
};
