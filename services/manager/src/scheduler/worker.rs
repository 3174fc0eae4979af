//! Periodic and wake-driven scheduler ticks.
//!
//! Every task spec gets two loops: a short one that runs only when a
//! schedule mark is set, and a long one that always runs. Immediate wake
//! notifications run a tick right away.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::coordinator::LifecycleCoordinator;
use super::error::SchedulerResult;
use super::handlers::PromotionHandlerRegistry;
use super::termination::TerminationCoordinator;
use super::types::{ScheduleType, SchedulerTaskSpec};
use super::wake::WakeChannel;

pub struct SchedulerWorker {
    specs: Vec<SchedulerTaskSpec>,
    wake: Arc<dyn WakeChannel>,
    lifecycle: LifecycleCoordinator,
    termination: TerminationCoordinator,
    handlers: PromotionHandlerRegistry,
}

impl SchedulerWorker {
    pub fn new(
        specs: Vec<SchedulerTaskSpec>,
        wake: Arc<dyn WakeChannel>,
        lifecycle: LifecycleCoordinator,
        termination: TerminationCoordinator,
        handlers: PromotionHandlerRegistry,
    ) -> Self {
        Self {
            specs,
            wake,
            lifecycle,
            termination,
            handlers,
        }
    }

    /// Runs one tick for `schedule_type`. A non-forced tick only runs if it
    /// consumed a schedule mark. Returns whether anything was processed.
    pub async fn dispatch(&self, schedule_type: ScheduleType, force: bool) -> SchedulerResult<bool> {
        if !force && !self.wake.load_and_delete_mark(schedule_type).await? {
            return Ok(false);
        }
        match schedule_type {
            ScheduleType::Terminate => {
                self.termination.terminate_sessions().await?;
            }
            other => {
                let Some(handler) = self.handlers.get(other) else {
                    debug!(schedule_type = %other, "No local processor for schedule type");
                    return Ok(false);
                };
                self.lifecycle
                    .process_lifecycle_schedule(handler.as_ref())
                    .await?;
            }
        }
        Ok(true)
    }

    async fn tick(&self, schedule_type: ScheduleType, force: bool) {
        if let Err(e) = self.dispatch(schedule_type, force).await {
            error!(schedule_type = %schedule_type, force, error = %e, "Scheduler tick failed");
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(task_specs = self.specs.len(), "Starting scheduler worker");

        let mut tasks = Vec::new();
        for spec in self.specs.clone() {
            if spec.short_interval.is_some() {
                tasks.push(tokio::spawn(
                    self.clone().run_short(spec.clone(), shutdown.clone()),
                ));
            }
            tasks.push(tokio::spawn(self.clone().run_long(spec, shutdown.clone())));
        }
        match self.wake.subscribe().await {
            Ok(rx) => tasks.push(tokio::spawn(self.clone().run_wake(rx, shutdown.clone()))),
            Err(e) => warn!(error = %e, "Wake notifications unavailable, relying on ticks"),
        }

        for joined in join_all(tasks).await {
            if let Err(e) = joined {
                error!(error = %e, "Scheduler task panicked");
            }
        }
        info!("Scheduler worker stopped");
    }

    async fn run_short(self: Arc<Self>, spec: SchedulerTaskSpec, mut shutdown: watch::Receiver<bool>) {
        let Some(period) = spec.short_interval else {
            return;
        };
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick(spec.schedule_type, false).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn run_long(self: Arc<Self>, spec: SchedulerTaskSpec, mut shutdown: watch::Receiver<bool>) {
        let start = Instant::now() + spec.initial_delay;
        let mut interval = tokio::time::interval_at(start, spec.long_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick(spec.schedule_type, true).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn run_wake(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<ScheduleType>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(schedule_type) => self.tick(schedule_type, true).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Dropped wake notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
