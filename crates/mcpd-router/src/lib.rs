//! Request router: resolves a public name against the aggregation indices,
//! acquires an instance with a deadline, forwards the call, and releases on
//! every exit path. Holds no state of its own beyond the route timeout.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use rmcp::model::{
    CallToolRequestParams, CallToolResult, GetPromptRequestParams, GetPromptResult,
    ReadResourceRequestParams, ReadResourceResult,
};
use rmcp::service::ServiceError;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use mcpd_core::{Catalog, HostError};
use mcpd_index::{IndexSet, Target};
use mcpd_pool::{Lease, Scheduler};

pub struct Router {
    scheduler: Arc<Scheduler>,
    indices: Arc<IndexSet>,
    route_timeout: RwLock<Duration>,
}

impl Router {
    pub fn new(scheduler: Arc<Scheduler>, indices: Arc<IndexSet>) -> Self {
        Self {
            scheduler,
            indices,
            route_timeout: RwLock::new(Duration::from_secs(30)),
        }
    }

    pub fn reconfigure(&self, catalog: &Catalog) {
        *self.route_timeout.write().expect("route timeout poisoned") =
            catalog.runtime.route_timeout();
    }

    fn deadline(&self) -> Instant {
        Instant::now() + *self.route_timeout.read().expect("route timeout poisoned")
    }

    /// Forwards a tool call. The response body passes through verbatim,
    /// including MCP tool-level `isError` payloads.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        routing_key: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<CallToolResult, HostError> {
        let target = self
            .indices
            .tools
            .resolve(name)
            .ok_or_else(|| HostError::MethodNotFound(format!("unknown tool '{name}'")))?;
        if !target.capabilities.tools {
            return Err(HostError::MethodNotFound(format!(
                "server behind '{name}' does not expose tools"
            )));
        }

        let mut request = CallToolRequestParams::new(target.original.clone());
        request.arguments = arguments;
        self.forward(&target, routing_key, cancel, move |peer| async move {
            peer.call_tool(request).await
        })
        .await
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        cancel: CancellationToken,
    ) -> Result<ReadResourceResult, HostError> {
        let target = self
            .indices
            .resources
            .resolve(uri)
            .ok_or_else(|| HostError::MethodNotFound(format!("unknown resource '{uri}'")))?;
        if !target.capabilities.resources {
            return Err(HostError::MethodNotFound(format!(
                "server behind '{uri}' does not expose resources"
            )));
        }

        let request = ReadResourceRequestParams::new(target.original.clone());
        self.forward(&target, None, cancel, move |peer| async move {
            peer.read_resource(request).await
        })
        .await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        cancel: CancellationToken,
    ) -> Result<GetPromptResult, HostError> {
        let target = self
            .indices
            .prompts
            .resolve(name)
            .ok_or_else(|| HostError::MethodNotFound(format!("unknown prompt '{name}'")))?;
        if !target.capabilities.prompts {
            return Err(HostError::MethodNotFound(format!(
                "server behind '{name}' does not expose prompts"
            )));
        }

        let mut request = GetPromptRequestParams::new(target.original.clone());
        request.arguments = arguments;
        self.forward(&target, None, cancel, move |peer| async move {
            peer.get_prompt(request).await
        })
        .await
    }

    /// Acquire → forward → release, with the release guaranteed on every
    /// path (the lease's drop guard backstops a panicking forward).
    async fn forward<T, F, Fut>(
        &self,
        target: &Target,
        routing_key: Option<&str>,
        cancel: CancellationToken,
        call: F,
    ) -> Result<T, HostError>
    where
        F: FnOnce(rmcp::Peer<rmcp::RoleClient>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ServiceError>>,
    {
        let deadline = self.deadline();
        let mut lease = self
            .scheduler
            .acquire(&target.fingerprint, routing_key, deadline)
            .await?;
        let peer = lease.peer().clone();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(HostError::Canceled),
            forwarded = tokio::time::timeout_at(deadline, call(peer)) => match forwarded {
                Err(_) => Err(HostError::Timeout),
                Ok(Ok(response)) => Ok(response),
                Ok(Err(error)) => Err(classify_service_error(error, &mut lease)),
            },
        };

        lease.release().await;
        outcome
    }
}

/// MCP protocol errors map onto the nearest JSON-RPC code with their
/// message preserved; transport-level failures poison the instance so
/// release stops and replaces it.
fn classify_service_error(error: ServiceError, lease: &mut Lease) -> HostError {
    match error {
        ServiceError::McpError(data) => {
            match data.code.0 {
                -32601 => HostError::MethodNotFound(data.message.to_string()),
                -32602 => HostError::InvalidParams(data.message.to_string()),
                _ => HostError::RouteFailed(data.message.to_string()),
            }
        }
        other => {
            lease.mark_failed();
            HostError::RouteFailed(other.to_string())
        }
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
