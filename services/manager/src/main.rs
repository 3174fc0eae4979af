//! Sokovan manager
//!
//! Runs the session lifecycle scheduler: promotion ticks, termination
//! fan-out to agents, and wake-signal handling shared with other replicas
//! through Postgres.

use std::sync::Arc;

use anyhow::Result;
use sokovan_manager::{
    agents::HttpAgentClientPool,
    config,
    db::Database,
    scheduler::{
        types::SchedulerTaskSpec, HookRegistry, LifecycleCoordinator, PromotionHandlerRegistry,
        SchedulerContext, SchedulerWorker, TerminationCoordinator,
    },
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SOKOVAN_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting sokovan manager");
    info!(
        replica_id = %config.scheduler.replica_id,
        wake_channel = %config.wake_channel,
        "Configuration loaded"
    );

    // Connect to database
    let db = match Database::connect(&config.database).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    // Run migrations in dev mode
    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let scheduler_config = &config.scheduler;
    let repo = Arc::new(db.scheduler_repository());
    let locks = Arc::new(db.lock_service(scheduler_config.replica_id.clone()));
    let wake = Arc::new(db.wake_channel(config.wake_channel.clone()));
    let events = Arc::new(db.event_store());
    let clients = Arc::new(HttpAgentClientPool::new(scheduler_config.agent_rpc_timeout));
    let hooks = HookRegistry::new();

    let handlers = PromotionHandlerRegistry::standard(SchedulerContext {
        repo: repo.clone(),
        wake: wake.clone(),
        events: events.clone(),
        hooks: hooks.clone(),
    });
    let lifecycle =
        LifecycleCoordinator::new(repo.clone(), locks.clone(), scheduler_config.lock_ttl);
    let termination = TerminationCoordinator::new(
        repo,
        locks,
        wake.clone(),
        events,
        clients,
        hooks,
        scheduler_config.lock_ttl,
        scheduler_config.agent_rpc_timeout,
    );
    let specs = SchedulerTaskSpec::defaults(
        scheduler_config.short_tick,
        scheduler_config.long_tick,
        scheduler_config.initial_delay,
    );

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start scheduler worker in background
    let worker = Arc::new(SchedulerWorker::new(
        specs,
        wake,
        lifecycle,
        termination,
        handlers,
    ));
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    // Wait for shutdown signal (Ctrl+C)
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");

    // Signal shutdown to the worker
    let _ = shutdown_tx.send(true);

    info!("Waiting for scheduler worker to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, worker_handle).await {
        warn!(error = %e, "Scheduler worker did not shut down in time");
    }

    info!("Manager shutdown complete");
    Ok(())
}
