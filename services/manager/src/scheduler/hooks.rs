//! Session lifecycle hooks and the best-effort call wrapper.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::error::HookError;
use super::types::ScheduledSessionData;

/// Integration invoked around lifecycle transitions.
///
/// Hooks never influence the transition itself; failures are logged.
#[async_trait]
pub trait SessionHook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_transition_to_running(&self, _session: &ScheduledSessionData) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_transition_to_terminated(
        &self,
        _session: &ScheduledSessionData,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

/// Ordered set of hooks.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn SessionHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(mut self, hook: Arc<dyn SessionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs every running-transition hook for `session`; returns the failure count.
    pub async fn run_on_running(&self, session: &ScheduledSessionData) -> usize {
        let mut failures = 0;
        for hook in &self.hooks {
            let label = format!("{}.on_transition_to_running", hook.name());
            if best_effort(&label, hook.on_transition_to_running(session))
                .await
                .is_none()
            {
                failures += 1;
            }
        }
        failures
    }

    /// Runs every terminated-transition hook for `session`; returns the failure count.
    pub async fn run_on_terminated(&self, session: &ScheduledSessionData) -> usize {
        let mut failures = 0;
        for hook in &self.hooks {
            let label = format!("{}.on_transition_to_terminated", hook.name());
            if best_effort(&label, hook.on_transition_to_terminated(session))
                .await
                .is_none()
            {
                failures += 1;
            }
        }
        failures
    }
}

/// Awaits `fut`, logging and discarding an error.
pub async fn best_effort<T, E, F>(what: &str, fut: F) -> Option<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    match fut.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(operation = what, error = %e, "Best-effort operation failed");
            None
        }
    }
}
