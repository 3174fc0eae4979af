use std::time::Duration;

use anyhow::{Context, Result};

use crate::db::DbConfig;

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Lease length for per-status-group locks.
    pub lock_ttl: Duration,
    /// Cadence of "process if needed" ticks.
    pub short_tick: Duration,
    /// Cadence of forced ticks.
    pub long_tick: Duration,
    /// Delay before the first forced tick.
    pub initial_delay: Duration,
    /// Per-call timeout for agent RPCs.
    pub agent_rpc_timeout: Duration,
    /// Identity recorded as lock holder.
    pub replica_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(60),
            short_tick: Duration::from_millis(2000),
            long_tick: Duration::from_secs(60),
            initial_delay: Duration::from_secs(30),
            agent_rpc_timeout: Duration::from_secs(30),
            replica_id: format!("manager-{}", uuid::Uuid::new_v4()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    pub wake_channel: String,
    pub scheduler: SchedulerConfig,
    pub database: DbConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("SOKOVAN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("SOKOVAN_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let wake_channel = std::env::var("SOKOVAN_WAKE_CHANNEL")
            .unwrap_or_else(|_| "sokovan_schedule".to_string());

        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            lock_ttl: env_duration("SOKOVAN_SCHEDULE_LOCK_TTL_SECS", Duration::from_secs)?
                .unwrap_or(defaults.lock_ttl),
            short_tick: env_duration("SOKOVAN_SHORT_TICK_MS", Duration::from_millis)?
                .unwrap_or(defaults.short_tick),
            long_tick: env_duration("SOKOVAN_LONG_TICK_SECS", Duration::from_secs)?
                .unwrap_or(defaults.long_tick),
            initial_delay: env_duration("SOKOVAN_INITIAL_DELAY_SECS", Duration::from_secs)?
                .unwrap_or(defaults.initial_delay),
            agent_rpc_timeout: env_duration("SOKOVAN_AGENT_RPC_TIMEOUT_SECS", Duration::from_secs)?
                .unwrap_or(defaults.agent_rpc_timeout),
            replica_id: std::env::var("SOKOVAN_REPLICA_ID").unwrap_or(defaults.replica_id),
        };

        let database = DbConfig::from_env();

        Ok(Self {
            log_level,
            dev_mode,
            wake_channel,
            scheduler,
            database,
        })
    }
}

fn env_duration(name: &str, unit: fn(u64) -> Duration) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) => {
            let value: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{name} must be a non-negative integer, got {raw:?}"))?;
            Ok(Some(unit(value)))
        }
        Err(_) => Ok(None),
    }
}
