//! RPC clients for fleet agents.
//!
//! Clients are pooled per agent and reused across ticks until the registry
//! reports that the agent's address or identity changed.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sokovan_id::{AgentId, KernelId, SessionId};
use thiserror::Error;
use tracing::debug;

/// Agent call failures. All of them are retried on a later tick.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentRpcError {
    #[error("agent {agent_id} did not answer within {timeout:?}")]
    Timeout { agent_id: AgentId, timeout: Duration },

    #[error("transport error talking to agent {agent_id}: {reason}")]
    Transport { agent_id: AgentId, reason: String },

    #[error("agent {agent_id} rejected the request ({status}): {body}")]
    Rejected {
        agent_id: AgentId,
        status: u16,
        body: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestroyKernelRequest {
    pub kernel_id: KernelId,
    pub session_id: SessionId,
    pub reason: String,
}

/// Pooled access to agent RPC endpoints.
#[async_trait]
pub trait AgentClientPool: Send + Sync {
    async fn destroy_kernel(
        &self,
        agent_id: &AgentId,
        agent_addr: &str,
        request: &DestroyKernelRequest,
    ) -> Result<(), AgentRpcError>;

    /// Drops the pooled client so the next call reconnects.
    fn invalidate(&self, agent_id: &AgentId);
}

#[derive(Clone)]
struct PooledClient {
    addr: String,
    http: reqwest::Client,
}

/// HTTP implementation of [`AgentClientPool`].
pub struct HttpAgentClientPool {
    timeout: Duration,
    clients: Mutex<HashMap<AgentId, PooledClient>>,
}

impl HttpAgentClientPool {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn pooled_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn client_for(&self, agent_id: &AgentId, addr: &str) -> Result<PooledClient, AgentRpcError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(agent_id).filter(|c| c.addr == addr) {
            return Ok(client.clone());
        }
        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| AgentRpcError::Transport {
                agent_id: agent_id.clone(),
                reason: e.to_string(),
            })?;
        let client = PooledClient {
            addr: addr.to_string(),
            http,
        };
        debug!(agent_id = %agent_id, addr = %addr, "Created agent client");
        clients.insert(agent_id.clone(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl AgentClientPool for HttpAgentClientPool {
    async fn destroy_kernel(
        &self,
        agent_id: &AgentId,
        agent_addr: &str,
        request: &DestroyKernelRequest,
    ) -> Result<(), AgentRpcError> {
        let client = self.client_for(agent_id, agent_addr)?;
        let url = format!(
            "{}/v1/kernels/{}/destroy",
            client.addr.trim_end_matches('/'),
            request.kernel_id
        );
        debug!(url = %url, kernel_id = %request.kernel_id, "Destroying kernel");

        let response = client
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentRpcError::Timeout {
                        agent_id: agent_id.clone(),
                        timeout: self.timeout,
                    }
                } else {
                    AgentRpcError::Transport {
                        agent_id: agent_id.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentRpcError::Rejected {
                agent_id: agent_id.clone(),
                status,
                body,
            });
        }
        Ok(())
    }

    fn invalidate(&self, agent_id: &AgentId) {
        let removed = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_id);
        if removed.is_some() {
            debug!(agent_id = %agent_id, "Invalidated agent client");
        }
    }
}

/// Scriptable agent pool for tests and local runs.
#[derive(Default)]
pub struct FakeAgentClientPool {
    delay: Duration,
    failing_kernels: Mutex<HashMap<KernelId, String>>,
    destroyed: Mutex<Vec<KernelId>>,
    invalidated: Mutex<HashSet<AgentId>>,
}

impl FakeAgentClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Destroying `kernel_id` fails with `reason` until cleared.
    pub fn fail_kernel(&self, kernel_id: KernelId, reason: impl Into<String>) {
        self.failing_kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kernel_id, reason.into());
    }

    pub fn clear_failures(&self) {
        self.failing_kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn destroyed(&self) -> Vec<KernelId> {
        self.destroyed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn was_invalidated(&self, agent_id: &AgentId) -> bool {
        self.invalidated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(agent_id)
    }
}

#[async_trait]
impl AgentClientPool for FakeAgentClientPool {
    async fn destroy_kernel(
        &self,
        agent_id: &AgentId,
        _agent_addr: &str,
        request: &DestroyKernelRequest,
    ) -> Result<(), AgentRpcError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failure = self
            .failing_kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.kernel_id)
            .cloned();
        if let Some(reason) = failure {
            return Err(AgentRpcError::Transport {
                agent_id: agent_id.clone(),
                reason,
            });
        }
        self.destroyed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.kernel_id);
        Ok(())
    }

    fn invalidate(&self, agent_id: &AgentId) {
        self.invalidated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_id.clone());
    }
}
