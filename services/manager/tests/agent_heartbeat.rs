//! Agent heartbeat reconciliation.
//!
//! Every heartbeat is applied under a row lock: unknown agents are
//! registered, lost agents rejoin with their occupancy reset, and changed
//! fields are copied over. Address or key changes drop pooled RPC clients.

mod common;

use std::sync::Arc;

use common::{agent, heartbeat, Harness};
use rust_decimal_macros::dec;
use sokovan_events::{event_types, AgentStatus};
use sokovan_id::AgentId;
use sokovan_manager::agents::{AgentRegistry, HeartbeatOutcomeKind};
use sokovan_manager::events::RecordingEventBus;

fn registry(h: &Harness) -> AgentRegistry {
    AgentRegistry::new(h.store.clone(), h.agents.clone(), h.events.clone())
}

fn agent_id(name: &str) -> AgentId {
    AgentId::parse(name).unwrap()
}

#[tokio::test]
async fn test_first_heartbeat_registers_agent() {
    let h = Harness::new();
    let id = agent_id("agent-1");
    let hb = heartbeat("http://10.0.0.1:6001", "default");

    let outcome = registry(&h).handle_agent_heartbeat(&id, &hb).await.unwrap();

    assert_eq!(outcome.kind, HeartbeatOutcomeKind::Registered);
    assert!(outcome.invalidate_cache);
    assert!(h.agents.was_invalidated(&id));
    let stored = h.store.agent(&id).unwrap();
    assert_eq!(stored.status, AgentStatus::Alive);
    assert_eq!(stored.addr, "http://10.0.0.1:6001");
    assert!(stored.occupied_slots.is_empty());
    assert_eq!(h.events.events_of_type(event_types::AGENT_JOINED).len(), 1);
}

#[tokio::test]
async fn test_identical_heartbeat_changes_nothing() {
    let h = Harness::new();
    let id = agent_id("agent-1");
    let hb = heartbeat("http://10.0.0.1:6001", "default");
    let registry = registry(&h);
    registry.handle_agent_heartbeat(&id, &hb).await.unwrap();
    let before = h.store.agent(&id).unwrap();

    let outcome = registry.handle_agent_heartbeat(&id, &hb).await.unwrap();

    assert_eq!(outcome.kind, HeartbeatOutcomeKind::Unchanged);
    assert!(!outcome.invalidate_cache);
    assert_eq!(h.store.agent(&id).unwrap(), before);
    assert_eq!(h.events.events().len(), 1);
}

#[tokio::test]
async fn test_address_change_updates_and_invalidates() {
    let h = Harness::new();
    let a1 = agent("agent-1", "default");
    h.store.insert_agent(a1.clone());
    let hb = heartbeat("http://10.0.0.9:6001", "default");

    let outcome = registry(&h)
        .handle_agent_heartbeat(&a1.id, &hb)
        .await
        .unwrap();

    assert_eq!(
        outcome.kind,
        HeartbeatOutcomeKind::Updated {
            changed_fields: vec!["addr".to_string()]
        }
    );
    assert!(h.agents.was_invalidated(&a1.id));
    assert_eq!(h.store.agent(&a1.id).unwrap().addr, "http://10.0.0.9:6001");
    assert_eq!(h.events.events_of_type(event_types::AGENT_UPDATED).len(), 1);
}

#[tokio::test]
async fn test_capacity_change_keeps_pooled_client() {
    let h = Harness::new();
    let a1 = agent("agent-1", "default");
    h.store.insert_agent(a1.clone());
    let mut hb = heartbeat(&a1.addr, "default");
    hb.available_slots = common::cpu(dec!(32));

    let outcome = registry(&h)
        .handle_agent_heartbeat(&a1.id, &hb)
        .await
        .unwrap();

    assert_eq!(
        outcome.kind,
        HeartbeatOutcomeKind::Updated {
            changed_fields: vec!["available_slots".to_string()]
        }
    );
    assert!(!outcome.invalidate_cache);
    assert!(!h.agents.was_invalidated(&a1.id));
    assert_eq!(
        h.store.agent(&a1.id).unwrap().available_slots,
        common::cpu(dec!(32))
    );
}

#[tokio::test]
async fn test_lost_agent_rejoins_with_reset_occupancy() {
    let h = Harness::new();
    let mut a1 = agent("agent-1", "default");
    a1.status = AgentStatus::Lost;
    a1.occupied_slots = common::cpu(dec!(4));
    h.store.insert_agent(a1.clone());
    let hb = heartbeat(&a1.addr, "default");

    let outcome = registry(&h)
        .handle_agent_heartbeat(&a1.id, &hb)
        .await
        .unwrap();

    assert_eq!(
        outcome.kind,
        HeartbeatOutcomeKind::Rejoined {
            previous_status: AgentStatus::Lost
        }
    );
    assert!(outcome.invalidate_cache);
    let stored = h.store.agent(&a1.id).unwrap();
    assert_eq!(stored.status, AgentStatus::Alive);
    assert!(stored.occupied_slots.is_empty());
    assert_eq!(stored.first_contact, a1.first_contact);
    assert_eq!(
        h.events.events_of_type(event_types::AGENT_REJOINED).len(),
        1
    );
}

#[tokio::test]
async fn test_event_failure_does_not_fail_heartbeat() {
    let h = Harness::new().with_events(RecordingEventBus::failing());
    let id = agent_id("agent-1");
    let hb = heartbeat("http://10.0.0.1:6001", "default");

    let outcome = registry(&h).handle_agent_heartbeat(&id, &hb).await.unwrap();

    assert_eq!(outcome.kind, HeartbeatOutcomeKind::Registered);
    assert!(h.store.agent(&id).is_some());
}

#[tokio::test]
async fn test_store_failure_is_returned() {
    let h = Harness::new();
    h.store.set_unavailable(true);
    let id = agent_id("agent-1");
    let hb = heartbeat("http://10.0.0.1:6001", "default");

    let result = registry(&h).handle_agent_heartbeat(&id, &hb).await;

    assert!(result.is_err());
    assert!(!h.agents.was_invalidated(&id));
}

#[tokio::test]
async fn test_concurrent_heartbeats_register_once() {
    let h = Harness::new();
    let registry = Arc::new(registry(&h));
    let id = agent_id("agent-1");
    let hb = heartbeat("http://10.0.0.1:6001", "default");

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            let id = id.clone();
            let hb = hb.clone();
            tokio::spawn(async move { registry.handle_agent_heartbeat(&id, &hb).await })
        })
        .collect();
    let mut registered = 0;
    for task in tasks {
        if task.await.unwrap().unwrap().kind == HeartbeatOutcomeKind::Registered {
            registered += 1;
        }
    }

    assert_eq!(registered, 1);
    assert_eq!(h.events.events_of_type(event_types::AGENT_JOINED).len(), 1);
}
