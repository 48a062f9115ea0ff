//! Instance lifecycle: drives one MCP session through
//! `Starting → Ready ⇄ Busy → Draining → Stopped` with a `Failed` side
//! branch, verifying the protocol version and recording capabilities at
//! start.

mod instance;

use std::sync::Arc;
use std::time::Duration;

use mcpd_core::{HostError, LogLevel, ServerSpec, SpecFingerprint};
use mcpd_transport::{TransportContext, open_session};

pub use instance::{Instance, InstanceState, InstanceStatus};

/// Grace given to a child process between SIGTERM and SIGKILL.
const CHILD_TERM_GRACE: Duration = Duration::from_secs(3);
/// Poll step while waiting for in-flight calls to drain.
const DRAIN_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub init_timeout: Duration,
    pub drain_timeout: Duration,
    pub ping_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(5),
        }
    }
}

/// Opens a session, verifies the handshake, and returns a Ready instance.
///
/// Every failure is classified: transport spawn errors are `StartFailed`,
/// missing or timed-out initialize results are `HandshakeFailed`, a version
/// mismatch is `UnsupportedProtocol`, and a whitelist that names a
/// capability the server does not declare is `CapabilityRejected`.
pub async fn start_instance(
    spec: &ServerSpec,
    fingerprint: &SpecFingerprint,
    transport: &TransportContext,
    cfg: &LifecycleConfig,
) -> Result<Arc<Instance>, HostError> {
    let session = match tokio::time::timeout(
        cfg.init_timeout,
        open_session(spec, fingerprint, transport),
    )
    .await
    {
        Err(_) => {
            return Err(HostError::HandshakeFailed(format!(
                "server '{}': initialize timed out after {}s",
                spec.name,
                cfg.init_timeout.as_secs()
            )));
        }
        Ok(Err(error)) => return Err(error),
        Ok(Ok(session)) => session,
    };

    let handshake = match session.handshake() {
        Ok(handshake) => handshake,
        Err(error) => {
            session.close(CHILD_TERM_GRACE).await;
            return Err(error);
        }
    };

    if handshake.protocol_version != spec.protocol_version {
        let error = HostError::UnsupportedProtocol {
            required: spec.protocol_version.clone(),
            offered: handshake.protocol_version,
        };
        session.close(CHILD_TERM_GRACE).await;
        return Err(error);
    }

    if let Some(missing) = missing_capability(spec, &handshake.capabilities) {
        let error = HostError::CapabilityRejected(format!(
            "server '{}' does not declare '{missing}' but the spec whitelists it",
            spec.name
        ));
        session.close(CHILD_TERM_GRACE).await;
        return Err(error);
    }

    let instance = Arc::new(Instance::from_session(spec, fingerprint.clone(), session, &handshake));
    transport.logs.publish(
        "core/lifecycle",
        LogLevel::Info,
        format!(
            "instance {} ready (server '{}', {} {})",
            instance.id, spec.name, handshake.server_product, handshake.server_version
        ),
    );
    tracing::info!(
        server = %spec.name,
        instance = %instance.id,
        fingerprint = %fingerprint,
        protocol = %instance.protocol_version,
        "instance ready"
    );
    Ok(instance)
}

fn missing_capability(
    spec: &ServerSpec,
    caps: &mcpd_core::CapabilityFlags,
) -> Option<&'static str> {
    if spec.expose.tools.is_some() && !caps.tools {
        return Some("tools");
    }
    if spec.expose.resources.is_some() && !caps.resources {
        return Some("resources");
    }
    if spec.expose.prompts.is_some() && !caps.prompts {
        return Some("prompts");
    }
    None
}

/// Health probe: a bounded `tools/list` round-trip. rmcp exposes no
/// client-side ping request, and every server answers list calls, so this
/// is the cheap capability probe the health sweep relies on.
pub async fn ping(instance: &Instance, timeout: Duration) -> Result<(), HostError> {
    match tokio::time::timeout(timeout, instance.peer().list_tools(None)).await {
        Err(_) => Err(HostError::Timeout),
        Ok(Err(error)) => Err(HostError::RouteFailed(format!(
            "ping of instance {} failed: {error}",
            instance.id
        ))),
        Ok(Ok(_)) => Ok(()),
    }
}

/// Drains and closes one instance.
///
/// Ready/Busy instances enter Draining and get up to the drain timeout for
/// in-flight calls to finish; Failed instances skip the wait entirely.
pub async fn stop_instance(instance: &Arc<Instance>, reason: &str, cfg: &LifecycleConfig) {
    let skip_drain = matches!(
        instance.state(),
        InstanceState::Failed | InstanceState::Stopped | InstanceState::Starting
    );
    if !skip_drain {
        instance.set_state(InstanceState::Draining);
        let deadline = tokio::time::Instant::now() + cfg.drain_timeout;
        while instance.busy_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        if instance.busy_count() > 0 {
            tracing::warn!(
                instance = %instance.id,
                busy = instance.busy_count(),
                "drain deadline elapsed with calls in flight"
            );
        }
    }

    if let Some(session) = instance.take_session() {
        session.close(CHILD_TERM_GRACE).await;
    }
    instance.set_state(InstanceState::Stopped);
    tracing::info!(instance = %instance.id, server = %instance.server_name, reason, "instance stopped");
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
