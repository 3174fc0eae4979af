//! Point-in-time inputs to admission validators.
//!
//! A snapshot is built fresh for every scheduling decision and never mutated
//! afterwards.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sokovan_events::SessionStatus;
use sokovan_id::{AccessKey, AgentId, ProjectId, SessionId, UserId};
use sokovan_resource::{ResourceSlot, SlotName};

/// Current occupancy, aggregated per scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceOccupancySnapshot {
    pub by_keypair: HashMap<AccessKey, ResourceSlot>,
    pub by_user: HashMap<UserId, ResourceSlot>,
    pub by_group: HashMap<ProjectId, ResourceSlot>,
    pub by_domain: HashMap<String, ResourceSlot>,
    pub by_agent: HashMap<AgentId, ResourceSlot>,
}

/// How slots a keypair policy does not name are bounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DefaultForUnspecified {
    /// Unnamed slots are limited to zero.
    #[default]
    Limited,
    Unlimited,
}

impl std::str::FromStr for DefaultForUnspecified {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LIMITED" => Ok(Self::Limited),
            "UNLIMITED" => Ok(Self::Unlimited),
            other => Err(format!("unknown default_for_unspecified: {other}")),
        }
    }
}

/// Per-keypair limits. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeypairResourcePolicy {
    pub total_resource_slots: Option<ResourceSlot>,
    pub default_for_unspecified: DefaultForUnspecified,
    pub max_concurrent_sessions: Option<u32>,
    pub max_concurrent_sftp_sessions: Option<u32>,
    pub max_pending_session_count: Option<u32>,
    pub max_pending_session_resource_slots: Option<ResourceSlot>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourcePolicySnapshot {
    pub keypair_policies: HashMap<AccessKey, KeypairResourcePolicy>,
    pub user_limits: HashMap<UserId, ResourceSlot>,
    pub group_limits: HashMap<ProjectId, ResourceSlot>,
    pub domain_limits: HashMap<String, ResourceSlot>,
}

/// Live session counters per keypair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConcurrencySnapshot {
    pub sessions_by_keypair: HashMap<AccessKey, u32>,
    pub sftp_sessions_by_keypair: HashMap<AccessKey, u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingSessionInfo {
    pub session_id: SessionId,
    pub requested_slots: ResourceSlot,
    pub creation_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingSessionSnapshot {
    pub by_keypair: HashMap<AccessKey, Vec<PendingSessionInfo>>,
}

/// Outcome recorded for a finished session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionResult {
    #[default]
    Undefined,
    Success,
    Failure,
}

impl std::str::FromStr for SessionResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNDEFINED" => Ok(Self::Undefined),
            "SUCCESS" => Ok(Self::Success),
            "FAILURE" => Ok(Self::Failure),
            other => Err(format!("unknown session result: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDependencyInfo {
    pub depends_on: SessionId,
    pub status: SessionStatus,
    pub result: SessionResult,
}

impl SessionDependencyInfo {
    pub fn is_satisfied(&self) -> bool {
        self.status == SessionStatus::Terminated && self.result == SessionResult::Success
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDependencySnapshot {
    pub by_session: HashMap<SessionId, Vec<SessionDependencyInfo>>,
}

/// Unit class of a slot type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotType {
    Count,
    Bytes,
    Unique,
}

impl std::str::FromStr for SlotType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "count" => Ok(Self::Count),
            "bytes" => Ok(Self::Bytes),
            "unique" => Ok(Self::Unique),
            other => Err(format!("unknown slot type: {other}")),
        }
    }
}

/// Everything admission needs to decide on one workload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemSnapshot {
    pub total_capacity: ResourceSlot,
    pub resource_occupancy: ResourceOccupancySnapshot,
    pub resource_policy: ResourcePolicySnapshot,
    pub concurrency: ConcurrencySnapshot,
    pub pending_sessions: PendingSessionSnapshot,
    pub session_dependencies: SessionDependencySnapshot,
    pub known_slot_types: BTreeMap<SlotName, SlotType>,
}

impl SystemSnapshot {
    /// Slots in `requested` the cluster has never registered.
    pub fn unknown_slots<'a>(&self, requested: &'a ResourceSlot) -> Vec<&'a SlotName> {
        requested
            .iter()
            .filter(|(name, value)| !value.is_zero() && !self.known_slot_types.contains_key(*name))
            .map(|(name, _)| name)
            .collect()
    }

    /// Capacity not yet occupied by any agent.
    pub fn available_capacity(&self) -> ResourceSlot {
        let occupied: ResourceSlot = self.resource_occupancy.by_agent.values().sum();
        &self.total_capacity - &occupied
    }
}

/// A session asking to be admitted.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionWorkload {
    pub session_id: SessionId,
    pub access_key: AccessKey,
    pub requested_slots: ResourceSlot,
    pub user_uuid: UserId,
    pub group_id: ProjectId,
    pub domain_name: String,
    pub scaling_group: String,
    /// Private sessions (SFTP and other system sessions) count against the
    /// SFTP concurrency limit.
    pub is_private: bool,
}
