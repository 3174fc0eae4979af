//! Heartbeat-driven reconciliation of agent records.
//!
//! The decision about what a heartbeat changes is pure ([`plan_heartbeat`]);
//! repositories apply it inside a row-locked transaction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sokovan_events::{
    event_types, AgentJoinedPayload, AgentRejoinedPayload, AgentStatus, AgentUpdatedPayload,
    AggregateType,
};
use sokovan_id::AgentId;
use sokovan_resource::ResourceSlot;
use tracing::{debug, info, instrument};

use super::client::AgentClientPool;
use crate::db::DbResult;
use crate::events::{envelope, EventBus};
use crate::scheduler::hooks::best_effort;

/// What an agent reports about itself on every heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    pub addr: String,
    pub public_key: Option<String>,
    pub scaling_group: String,
    pub region: String,
    pub architecture: String,
    pub version: String,
    pub available_slots: ResourceSlot,
    #[serde(default)]
    pub compute_plugins: Vec<String>,
}

/// Persisted agent row.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRecord {
    pub id: AgentId,
    pub status: AgentStatus,
    pub addr: String,
    pub public_key: Option<String>,
    pub scaling_group: String,
    pub region: String,
    pub architecture: String,
    pub version: String,
    pub available_slots: ResourceSlot,
    pub occupied_slots: ResourceSlot,
    pub compute_plugins: Vec<String>,
    pub first_contact: DateTime<Utc>,
    pub status_changed: DateTime<Utc>,
}

impl AgentRecord {
    /// A fresh ALIVE agent built from its first heartbeat.
    pub fn from_heartbeat(id: AgentId, heartbeat: &AgentHeartbeat, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: AgentStatus::Alive,
            addr: heartbeat.addr.clone(),
            public_key: heartbeat.public_key.clone(),
            scaling_group: heartbeat.scaling_group.clone(),
            region: heartbeat.region.clone(),
            architecture: heartbeat.architecture.clone(),
            version: heartbeat.version.clone(),
            available_slots: heartbeat.available_slots.clone(),
            occupied_slots: ResourceSlot::new(),
            compute_plugins: heartbeat.compute_plugins.clone(),
            first_contact: now,
            status_changed: now,
        }
    }

    /// Copies every reported field, returning the names of those that changed.
    fn absorb(&mut self, heartbeat: &AgentHeartbeat) -> Vec<&'static str> {
        let mut changed = Vec::new();
        macro_rules! sync {
            ($field:ident) => {
                if self.$field != heartbeat.$field {
                    self.$field = heartbeat.$field.clone();
                    changed.push(stringify!($field));
                }
            };
        }
        sync!(addr);
        sync!(public_key);
        sync!(scaling_group);
        sync!(region);
        sync!(architecture);
        sync!(version);
        sync!(available_slots);
        sync!(compute_plugins);
        changed
    }
}

/// Write a heartbeat requires.
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatPlan {
    Insert(AgentRecord),
    Update {
        record: AgentRecord,
        changed_fields: Vec<&'static str>,
    },
    Rejoin {
        record: AgentRecord,
        previous_status: AgentStatus,
    },
    Unchanged,
}

impl HeartbeatPlan {
    /// Whether pooled RPC clients for the agent are stale afterwards.
    pub fn invalidates_cache(&self) -> bool {
        match self {
            HeartbeatPlan::Insert(_) | HeartbeatPlan::Rejoin { .. } => true,
            HeartbeatPlan::Update { changed_fields, .. } => changed_fields
                .iter()
                .any(|f| *f == "addr" || *f == "public_key"),
            HeartbeatPlan::Unchanged => false,
        }
    }

    /// The row to persist, if any.
    pub fn record(&self) -> Option<&AgentRecord> {
        match self {
            HeartbeatPlan::Insert(record)
            | HeartbeatPlan::Update { record, .. }
            | HeartbeatPlan::Rejoin { record, .. } => Some(record),
            HeartbeatPlan::Unchanged => None,
        }
    }

    pub fn outcome(&self, agent_id: &AgentId) -> HeartbeatOutcome {
        let kind = match self {
            HeartbeatPlan::Insert(_) => HeartbeatOutcomeKind::Registered,
            HeartbeatPlan::Update { changed_fields, .. } => HeartbeatOutcomeKind::Updated {
                changed_fields: changed_fields.iter().map(|f| f.to_string()).collect(),
            },
            HeartbeatPlan::Rejoin {
                previous_status, ..
            } => HeartbeatOutcomeKind::Rejoined {
                previous_status: *previous_status,
            },
            HeartbeatPlan::Unchanged => HeartbeatOutcomeKind::Unchanged,
        };
        HeartbeatOutcome {
            agent_id: agent_id.clone(),
            addr: self.record().map(|r| r.addr.clone()),
            scaling_group: self.record().map(|r| r.scaling_group.clone()),
            kind,
            invalidate_cache: self.invalidates_cache(),
        }
    }
}

/// Decides what a heartbeat does to the stored row.
///
/// A non-ALIVE agent rejoins: it becomes ALIVE again and its occupancy is
/// reset, to be recomputed from kernels by a separate pass.
pub fn plan_heartbeat(
    existing: Option<&AgentRecord>,
    agent_id: &AgentId,
    heartbeat: &AgentHeartbeat,
    now: DateTime<Utc>,
) -> HeartbeatPlan {
    let Some(existing) = existing else {
        return HeartbeatPlan::Insert(AgentRecord::from_heartbeat(
            agent_id.clone(),
            heartbeat,
            now,
        ));
    };

    let mut record = existing.clone();
    let changed_fields = record.absorb(heartbeat);
    if existing.status != AgentStatus::Alive {
        record.status = AgentStatus::Alive;
        record.status_changed = now;
        record.occupied_slots = ResourceSlot::new();
        return HeartbeatPlan::Rejoin {
            record,
            previous_status: existing.status,
        };
    }
    if changed_fields.is_empty() {
        HeartbeatPlan::Unchanged
    } else {
        HeartbeatPlan::Update {
            record,
            changed_fields,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcomeKind {
    Registered,
    Updated { changed_fields: Vec<String> },
    Rejoined { previous_status: AgentStatus },
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatOutcome {
    pub agent_id: AgentId,
    pub addr: Option<String>,
    pub scaling_group: Option<String>,
    pub kind: HeartbeatOutcomeKind,
    pub invalidate_cache: bool,
}

/// Persistent agent rows.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Locks the agent row, applies [`plan_heartbeat`] and commits.
    async fn apply_heartbeat(
        &self,
        agent_id: &AgentId,
        heartbeat: &AgentHeartbeat,
    ) -> DbResult<HeartbeatOutcome>;

    async fn get_agent(&self, agent_id: &AgentId) -> DbResult<Option<AgentRecord>>;
}

/// Entry point for agent heartbeats.
pub struct AgentRegistry {
    repo: Arc<dyn AgentRepository>,
    clients: Arc<dyn AgentClientPool>,
    events: Arc<dyn EventBus>,
}

impl AgentRegistry {
    pub fn new(
        repo: Arc<dyn AgentRepository>,
        clients: Arc<dyn AgentClientPool>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            repo,
            clients,
            events,
        }
    }

    #[instrument(skip(self, heartbeat), fields(agent_id = %agent_id))]
    pub async fn handle_agent_heartbeat(
        &self,
        agent_id: &AgentId,
        heartbeat: &AgentHeartbeat,
    ) -> DbResult<HeartbeatOutcome> {
        let outcome = self.repo.apply_heartbeat(agent_id, heartbeat).await?;

        if outcome.invalidate_cache {
            self.clients.invalidate(agent_id);
        }

        let event = match &outcome.kind {
            HeartbeatOutcomeKind::Unchanged => None,
            HeartbeatOutcomeKind::Registered => {
                info!(addr = %heartbeat.addr, "Agent joined");
                Some(envelope(
                    AggregateType::Agent,
                    agent_id.to_string(),
                    event_types::AGENT_JOINED,
                    AgentJoinedPayload {
                        agent_id: agent_id.clone(),
                        addr: heartbeat.addr.clone(),
                        scaling_group: heartbeat.scaling_group.clone(),
                    },
                ))
            }
            HeartbeatOutcomeKind::Rejoined { previous_status } => {
                info!(previous_status = %previous_status, "Agent rejoined");
                Some(envelope(
                    AggregateType::Agent,
                    agent_id.to_string(),
                    event_types::AGENT_REJOINED,
                    AgentRejoinedPayload {
                        agent_id: agent_id.clone(),
                        addr: heartbeat.addr.clone(),
                        previous_status: *previous_status,
                    },
                ))
            }
            HeartbeatOutcomeKind::Updated { changed_fields } => {
                debug!(changed = ?changed_fields, "Agent record updated");
                Some(envelope(
                    AggregateType::Agent,
                    agent_id.to_string(),
                    event_types::AGENT_UPDATED,
                    AgentUpdatedPayload {
                        agent_id: agent_id.clone(),
                        changed_fields: changed_fields.clone(),
                    },
                ))
            }
        };

        if let Some(event) = event {
            best_effort("agent event", async move { self.events.publish(event?).await }).await;
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn heartbeat() -> AgentHeartbeat {
        AgentHeartbeat {
            addr: "http://10.0.0.7:6001".to_string(),
            public_key: Some("pk-1".to_string()),
            scaling_group: "default".to_string(),
            region: "local".to_string(),
            architecture: "x86_64".to_string(),
            version: "24.09.0".to_string(),
            available_slots: ResourceSlot::try_from_pairs([("cpu", dec!(16)), ("mem", dec!(64))])
                .unwrap(),
            compute_plugins: vec!["cuda".to_string()],
        }
    }

    fn agent() -> AgentId {
        AgentId::parse("i-node-7").unwrap()
    }

    #[test]
    fn test_unknown_agent_is_inserted_alive() {
        let plan = plan_heartbeat(None, &agent(), &heartbeat(), Utc::now());

        let HeartbeatPlan::Insert(record) = &plan else {
            panic!("expected insert, got {plan:?}");
        };
        assert_eq!(record.status, AgentStatus::Alive);
        assert!(record.occupied_slots.is_empty());
        assert!(plan.invalidates_cache());
    }

    #[test]
    fn test_identical_heartbeat_is_unchanged() {
        let existing = AgentRecord::from_heartbeat(agent(), &heartbeat(), Utc::now());

        let plan = plan_heartbeat(Some(&existing), &agent(), &heartbeat(), Utc::now());

        assert_eq!(plan, HeartbeatPlan::Unchanged);
        assert!(!plan.invalidates_cache());
    }

    #[test]
    fn test_version_change_updates_without_invalidation() {
        let existing = AgentRecord::from_heartbeat(agent(), &heartbeat(), Utc::now());
        let mut hb = heartbeat();
        hb.version = "24.09.1".to_string();

        let plan = plan_heartbeat(Some(&existing), &agent(), &hb, Utc::now());

        let HeartbeatPlan::Update { changed_fields, .. } = &plan else {
            panic!("expected update, got {plan:?}");
        };
        assert_eq!(changed_fields, &vec!["version"]);
        assert!(!plan.invalidates_cache());
    }

    #[test]
    fn test_address_or_key_change_invalidates_cache() {
        let existing = AgentRecord::from_heartbeat(agent(), &heartbeat(), Utc::now());
        let mut moved = heartbeat();
        moved.addr = "http://10.0.0.8:6001".to_string();
        let mut rekeyed = heartbeat();
        rekeyed.public_key = Some("pk-2".to_string());

        assert!(plan_heartbeat(Some(&existing), &agent(), &moved, Utc::now()).invalidates_cache());
        assert!(
            plan_heartbeat(Some(&existing), &agent(), &rekeyed, Utc::now()).invalidates_cache()
        );
    }

    #[test]
    fn test_lost_agent_rejoins_with_empty_occupancy() {
        let mut existing = AgentRecord::from_heartbeat(agent(), &heartbeat(), Utc::now());
        existing.status = AgentStatus::Lost;
        existing.occupied_slots = ResourceSlot::try_from_pairs([("cpu", dec!(4))]).unwrap();

        let plan = plan_heartbeat(Some(&existing), &agent(), &heartbeat(), Utc::now());

        let HeartbeatPlan::Rejoin {
            record,
            previous_status,
        } = &plan
        else {
            panic!("expected rejoin, got {plan:?}");
        };
        assert_eq!(*previous_status, AgentStatus::Lost);
        assert_eq!(record.status, AgentStatus::Alive);
        assert!(record.occupied_slots.is_empty());
        assert!(plan.invalidates_cache());
    }
}
