//! Termination flow against in-memory adapters.
//!
//! A termination request moves sessions to TERMINATING (or cancels them
//! outright), and the terminate tick destroys kernels on their agents. A
//! session only reaches TERMINATED once every one of its kernels is gone;
//! failed destroys are retried on the next tick.

mod common;

use std::time::Duration;

use common::{agent, cpu, seed_session, Harness, LOCK_TTL};
use rust_decimal_macros::dec;
use sokovan_events::{event_types, KernelStatus, SessionStatus};
use sokovan_id::SessionId;
use sokovan_manager::agents::FakeAgentClientPool;
use sokovan_manager::events::RecordingEventBus;
use sokovan_manager::scheduler::types::{LockId, ScheduleType};

#[tokio::test]
async fn test_partial_kernel_failure_keeps_session_terminating() {
    let h = Harness::new();
    let a1 = agent("agent-1", "default");
    h.store.insert_agent(a1.clone());
    let (s, kernels) = seed_session(
        &h.store,
        SessionStatus::Running,
        &[KernelStatus::Running, KernelStatus::Running],
        Some(&a1),
    );
    let coordinator = h.termination();

    coordinator
        .mark_sessions_for_termination(&[s.id], "user-requested")
        .await
        .unwrap();
    h.agents.fail_kernel(kernels[1].id, "Network error");

    let first = coordinator.terminate_sessions().await.unwrap();
    assert_eq!(first.sessions_processed, 1);
    assert_eq!(first.kernel_failures, 1);
    assert!(first.update.sessions_terminated.is_empty());
    assert_eq!(
        h.store.session(s.id).unwrap().status,
        SessionStatus::Terminating
    );
    assert_eq!(
        h.store.kernel(kernels[0].id).unwrap().status,
        KernelStatus::Terminated
    );
    assert_eq!(
        h.store.kernel(kernels[1].id).unwrap().status,
        KernelStatus::Terminating
    );
    let batches = h.store.terminated_batches();
    assert!(!batches[0][0].should_terminate_session());
    assert!(h.status_changes_to(SessionStatus::Terminated).is_empty());

    h.agents.clear_failures();
    let second = coordinator.terminate_sessions().await.unwrap();
    assert_eq!(second.kernel_failures, 0);
    assert_eq!(second.update.sessions_terminated, vec![s.id]);

    let stored = h.store.session(s.id).unwrap();
    assert_eq!(stored.status, SessionStatus::Terminated);
    assert!(stored.terminated_at.is_some());
    // The kernel already gone is not destroyed twice.
    assert_eq!(h.agents.destroyed(), vec![kernels[0].id, kernels[1].id]);
    assert_eq!(h.status_changes_to(SessionStatus::Terminated).len(), 1);
    assert!(h.wake.has_mark(ScheduleType::Schedule));
}

#[tokio::test]
async fn test_repeated_request_is_skipped() {
    let h = Harness::new();
    let (s, _) = seed_session(
        &h.store,
        SessionStatus::Running,
        &[KernelStatus::Running],
        None,
    );
    let coordinator = h.termination();

    let first = coordinator
        .mark_sessions_for_termination(&[s.id], "user-requested")
        .await
        .unwrap();
    let second = coordinator
        .mark_sessions_for_termination(&[s.id], "user-requested")
        .await
        .unwrap();

    assert_eq!(first.terminating, vec![s.id]);
    assert_eq!(second.skipped, vec![s.id]);
    assert!(!second.has_processed());
    let terminate_wakes = h
        .wake
        .published()
        .into_iter()
        .filter(|(t, _)| *t == ScheduleType::Terminate)
        .count();
    assert_eq!(terminate_wakes, 1);
    assert_eq!(
        h.events
            .events_of_type(event_types::SESSION_TERMINATION_REQUESTED)
            .len(),
        1
    );
}

#[tokio::test]
async fn test_request_splits_by_session_status() {
    let h = Harness::new();
    let (pending, pending_kernels) =
        seed_session(&h.store, SessionStatus::Pending, &[KernelStatus::Pending], None);
    let (running, _) = seed_session(
        &h.store,
        SessionStatus::Running,
        &[KernelStatus::Running],
        None,
    );
    let (done, _) = seed_session(
        &h.store,
        SessionStatus::Terminated,
        &[KernelStatus::Terminated],
        None,
    );
    let missing = SessionId::new();

    let result = h
        .termination()
        .mark_sessions_for_termination(&[pending.id, running.id, done.id, missing], "admin")
        .await
        .unwrap();

    assert_eq!(result.cancelled, vec![pending.id]);
    assert_eq!(result.terminating, vec![running.id]);
    assert_eq!(result.skipped, vec![done.id]);
    assert_eq!(result.not_found, vec![missing]);
    assert_eq!(result.processed_count(), 2);

    let cancelled = h.store.session(pending.id).unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);
    assert_eq!(cancelled.status_info.as_deref(), Some("admin"));
    assert_eq!(
        h.store.kernel(pending_kernels[0].id).unwrap().status,
        KernelStatus::Cancelled
    );
    assert_eq!(
        h.store.session(running.id).unwrap().status_info.as_deref(),
        Some("admin")
    );
    assert_eq!(h.wake.published(), vec![(ScheduleType::Terminate, true)]);
}

#[tokio::test]
async fn test_duplicate_ids_are_classified_once() {
    let h = Harness::new();
    let (running, _) = seed_session(
        &h.store,
        SessionStatus::Running,
        &[KernelStatus::Running],
        None,
    );
    let (pending, _) =
        seed_session(&h.store, SessionStatus::Pending, &[KernelStatus::Pending], None);

    let result = h
        .termination()
        .mark_sessions_for_termination(&[running.id, pending.id, running.id], "admin")
        .await
        .unwrap();

    assert_eq!(result.terminating, vec![running.id]);
    assert_eq!(result.cancelled, vec![pending.id]);
    assert!(result.skipped.is_empty());
    assert_eq!(result.processed_count(), 2);
}

#[tokio::test]
async fn test_cancelled_sessions_never_reach_agents() {
    let h = Harness::new();
    let a1 = agent("agent-1", "default");
    h.store.insert_agent(a1.clone());
    let (s, _) = seed_session(
        &h.store,
        SessionStatus::Pending,
        &[KernelStatus::Pending],
        Some(&a1),
    );
    let coordinator = h.termination();

    coordinator
        .mark_sessions_for_termination(&[s.id], "user-requested")
        .await
        .unwrap();
    let summary = coordinator.terminate_sessions().await.unwrap();

    assert_eq!(summary.sessions_processed, 0);
    assert!(h.agents.destroyed().is_empty());
    assert!(h.store.terminated_batches().is_empty());
}

#[tokio::test]
async fn test_kernels_without_agent_count_as_destroyed() {
    let h = Harness::new();
    let (s, _) = seed_session(
        &h.store,
        SessionStatus::Preparing,
        &[KernelStatus::Scheduled, KernelStatus::Scheduled],
        None,
    );
    let coordinator = h.termination();

    coordinator
        .mark_sessions_for_termination(&[s.id], "user-requested")
        .await
        .unwrap();
    let summary = coordinator.terminate_sessions().await.unwrap();

    assert_eq!(summary.update.sessions_terminated, vec![s.id]);
    assert_eq!(summary.update.kernels_terminated, 2);
    assert!(h.agents.destroyed().is_empty());
}

#[tokio::test]
async fn test_terminated_kernels_release_agent_occupancy() {
    let h = Harness::new();
    let mut a1 = agent("agent-1", "default");
    a1.occupied_slots = cpu(dec!(2));
    h.store.insert_agent(a1.clone());
    let (s, kernels) = seed_session(
        &h.store,
        SessionStatus::Running,
        &[KernelStatus::Running],
        Some(&a1),
    );
    let mut k = kernels[0].clone();
    k.occupied_slots = Some(cpu(dec!(2)));
    h.store.insert_kernel(k);
    let coordinator = h.termination();

    coordinator
        .mark_sessions_for_termination(&[s.id], "user-requested")
        .await
        .unwrap();
    let summary = coordinator.terminate_sessions().await.unwrap();

    assert_eq!(summary.update.agents_synced, 1);
    assert!(h.store.agent(&a1.id).unwrap().occupied_slots.is_zero());
}

#[tokio::test]
async fn test_held_lock_skips_tick() {
    let h = Harness::new();
    let a1 = agent("agent-1", "default");
    h.store.insert_agent(a1.clone());
    let (s, _) = seed_session(
        &h.store,
        SessionStatus::Running,
        &[KernelStatus::Running],
        Some(&a1),
    );
    let coordinator = h.termination();
    coordinator
        .mark_sessions_for_termination(&[s.id], "user-requested")
        .await
        .unwrap();
    h.locks
        .hold_externally(LockId::SokovanTargetTerminating, LOCK_TTL);

    let summary = coordinator.terminate_sessions().await.unwrap();

    assert!(summary.skipped);
    assert!(h.agents.destroyed().is_empty());
    assert_eq!(
        h.store.session(s.id).unwrap().status,
        SessionStatus::Terminating
    );
}

#[tokio::test]
async fn test_lock_released_after_tick() {
    let h = Harness::new();
    h.termination().terminate_sessions().await.unwrap();
    assert!(!h.locks.is_held(LockId::SokovanTargetTerminating));
}

#[tokio::test(start_paused = true)]
async fn test_destroys_fan_out_concurrently() {
    let h = Harness::new().with_agents(
        FakeAgentClientPool::new().with_delay(Duration::from_millis(100)),
    );
    let agents: Vec<_> = (0..10)
        .map(|i| agent(&format!("agent-{i}"), "default"))
        .collect();
    for a in &agents {
        h.store.insert_agent(a.clone());
    }
    let mut ids = Vec::new();
    for i in 0..100 {
        let (s, _) = seed_session(
            &h.store,
            SessionStatus::Running,
            &[KernelStatus::Running],
            Some(&agents[i % agents.len()]),
        );
        ids.push(s.id);
    }
    let coordinator = h.termination();
    coordinator
        .mark_sessions_for_termination(&ids, "user-requested")
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let summary = coordinator.terminate_sessions().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(summary.update.sessions_terminated.len(), 100);
    assert_eq!(h.agents.destroyed().len(), 100);
}

#[tokio::test(start_paused = true)]
async fn test_slow_agent_times_out_and_retries() {
    let h = Harness::new()
        .with_agents(FakeAgentClientPool::new().with_delay(Duration::from_secs(60)))
        .with_rpc_timeout(Duration::from_secs(1));
    let a1 = agent("agent-1", "default");
    h.store.insert_agent(a1.clone());
    let (s, _) = seed_session(
        &h.store,
        SessionStatus::Running,
        &[KernelStatus::Running],
        Some(&a1),
    );
    let coordinator = h.termination();
    coordinator
        .mark_sessions_for_termination(&[s.id], "user-requested")
        .await
        .unwrap();

    let summary = coordinator.terminate_sessions().await.unwrap();

    assert_eq!(summary.kernel_failures, 1);
    let batches = h.store.terminated_batches();
    let error = batches[0][0].kernel_results[0].error.clone().unwrap();
    assert!(error.contains("did not answer"), "unexpected error: {error}");
    assert_eq!(
        h.store.session(s.id).unwrap().status,
        SessionStatus::Terminating
    );
}

#[tokio::test]
async fn test_event_bus_failure_does_not_block_termination() {
    let h = Harness::new().with_events(RecordingEventBus::failing());
    let (s, _) = seed_session(
        &h.store,
        SessionStatus::Running,
        &[KernelStatus::Running],
        None,
    );
    let coordinator = h.termination();

    coordinator
        .mark_sessions_for_termination(&[s.id], "user-requested")
        .await
        .unwrap();
    let summary = coordinator.terminate_sessions().await.unwrap();

    assert_eq!(summary.update.sessions_terminated, vec![s.id]);
}

#[tokio::test]
async fn test_store_failure_surfaces_from_tick() {
    let h = Harness::new();
    let (s, _) = seed_session(
        &h.store,
        SessionStatus::Running,
        &[KernelStatus::Running],
        None,
    );
    let coordinator = h.termination();
    coordinator
        .mark_sessions_for_termination(&[s.id], "user-requested")
        .await
        .unwrap();
    h.store.fail_next("batch_update_terminated_status");

    assert!(coordinator.terminate_sessions().await.is_err());
    assert!(!h.locks.is_held(LockId::SokovanTargetTerminating));

    let retry = coordinator.terminate_sessions().await.unwrap();
    assert_eq!(retry.update.sessions_terminated, vec![s.id]);
}
