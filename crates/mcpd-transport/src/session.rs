use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use rmcp::service::RunningService;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::{Peer, RoleClient, ServiceExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use mcpd_core::{
    CapabilityFlags, HostError, LogBus, LogLevel, ServerSpec, SpecFingerprint, TransportSpec,
    format_env,
};

use crate::handler::{HostClientHandler, ListChangedEvent};

/// Shared wiring every open session needs.
#[derive(Clone)]
pub struct TransportContext {
    pub logs: Arc<LogBus>,
    pub list_changed_tx: mpsc::UnboundedSender<ListChangedEvent>,
}

/// What the downstream server reported during `initialize`.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub protocol_version: String,
    pub capabilities: CapabilityFlags,
    pub server_product: String,
    pub server_version: String,
}

/// One live MCP session plus the resources backing it.
///
/// For stdio sessions the child process handle stays here so close can
/// escalate SIGTERM → SIGKILL after the rmcp service is cancelled.
pub struct SessionHandle {
    service: RunningService<RoleClient, HostClientHandler>,
    child: Option<ChildGuard>,
    transport_label: &'static str,
    server_name: String,
}

impl SessionHandle {
    /// Cheap clonable handle for issuing requests.
    pub fn peer(&self) -> Peer<RoleClient> {
        self.service.peer().clone()
    }

    pub fn transport_label(&self) -> &'static str {
        self.transport_label
    }

    pub fn handshake(&self) -> Result<HandshakeInfo, HostError> {
        let init = self.service.peer().peer_info();
        let Some(init) = init else {
            return Err(HostError::HandshakeFailed(format!(
                "server '{}' did not report an initialize result",
                self.server_name
            )));
        };
        Ok(HandshakeInfo {
            protocol_version: init.protocol_version.to_string(),
            capabilities: capability_flags(&init.capabilities),
            server_product: init.server_info.name.clone(),
            server_version: init.server_info.version.clone(),
        })
    }

    /// Closes the session: cancel the rmcp service (which closes the wire),
    /// then SIGTERM the child, wait out the grace period, then SIGKILL.
    pub async fn close(self, grace: Duration) {
        let SessionHandle {
            service,
            child,
            server_name,
            ..
        } = self;
        if let Err(error) = service.cancel().await {
            tracing::debug!(server = %server_name, error = %error, "mcp service cancel failed");
        }
        if let Some(guard) = child {
            guard.terminate(grace, &server_name).await;
        }
    }
}

struct ChildGuard {
    child: tokio::process::Child,
}

impl ChildGuard {
    async fn terminate(mut self, grace: Duration, server_name: &str) {
        if let Some(pid) = self.child.id() {
            // SAFETY: sending SIGTERM to our own child; pid is live because
            // `wait` has not been awaited yet.
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(_status)) => {}
            Ok(Err(error)) => {
                tracing::debug!(server = %server_name, error = %error, "failed to wait for child");
            }
            Err(_) => {
                tracing::debug!(server = %server_name, "drain grace elapsed, killing child");
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Opens one MCP session for the spec. The rmcp `initialize` handshake runs
/// inside; the caller bounds the whole call with its init timeout.
pub async fn open_session(
    spec: &ServerSpec,
    fingerprint: &SpecFingerprint,
    ctx: &TransportContext,
) -> Result<SessionHandle, HostError> {
    let handler = HostClientHandler::new(
        &spec.name,
        fingerprint.clone(),
        ctx.list_changed_tx.clone(),
        Arc::clone(&ctx.logs),
    );

    match &spec.transport {
        TransportSpec::Stdio {
            command,
            args,
            env,
            cwd,
        } => {
            tracing::debug!(
                server = %spec.name,
                command = %command,
                env = %format_env(env),
                "spawning stdio MCP server"
            );

            let mut cmd = Command::new(command);
            cmd.args(args);
            for (key, value) in env {
                cmd.env(key, value);
            }
            if let Some(dir) = cwd {
                cmd.current_dir(dir);
            }
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            // Own process group so terminal signals aimed at the host don't
            // reach downstream servers.
            #[cfg(unix)]
            cmd.process_group(0);

            let mut child = cmd.spawn().map_err(|error| {
                HostError::StartFailed(format!(
                    "server '{}': failed to spawn '{command}': {error}",
                    spec.name
                ))
            })?;

            let stdout = child.stdout.take().ok_or_else(|| {
                HostError::StartFailed(format!("server '{}': no stdout pipe", spec.name))
            })?;
            let stdin = child.stdin.take().ok_or_else(|| {
                HostError::StartFailed(format!("server '{}': no stdin pipe", spec.name))
            })?;
            if let Some(stderr) = child.stderr.take() {
                spawn_stderr_capture(stderr, &spec.name, Arc::clone(&ctx.logs));
            }

            let service = handler.serve((stdout, stdin)).await.map_err(|error| {
                HostError::HandshakeFailed(format!("server '{}': {error}", spec.name))
            })?;

            Ok(SessionHandle {
                service,
                child: Some(ChildGuard { child }),
                transport_label: "stdio",
                server_name: spec.name.clone(),
            })
        }
        TransportSpec::StreamableHttp {
            url,
            headers,
            proxy,
        } => {
            tracing::debug!(server = %spec.name, url = %url, "connecting streamable-http MCP server");

            let transport = if headers.is_empty() && proxy.is_none() {
                StreamableHttpClientTransport::from_uri(url.clone())
            } else {
                // A fresh client per session: the per-spec header map is
                // copied into the builder, never mutated in place.
                let mut header_map = reqwest::header::HeaderMap::new();
                for (key, value) in headers {
                    let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                        .map_err(|_| {
                            HostError::StartFailed(format!(
                                "server '{}': invalid header name '{key}'",
                                spec.name
                            ))
                        })?;
                    let value = reqwest::header::HeaderValue::from_str(value).map_err(|_| {
                        HostError::StartFailed(format!(
                            "server '{}': invalid value for header '{key}'",
                            spec.name
                        ))
                    })?;
                    header_map.insert(name, value);
                }
                let mut builder = reqwest::Client::builder().default_headers(header_map);
                if let Some(proxy_url) = proxy {
                    let proxy = reqwest::Proxy::all(proxy_url).map_err(|error| {
                        HostError::StartFailed(format!(
                            "server '{}': invalid proxy '{proxy_url}': {error}",
                            spec.name
                        ))
                    })?;
                    builder = builder.proxy(proxy);
                }
                let client = builder.build().map_err(|error| {
                    HostError::StartFailed(format!(
                        "server '{}': failed to build http client: {error}",
                        spec.name
                    ))
                })?;
                StreamableHttpClientTransport::with_client(
                    client,
                    StreamableHttpClientTransportConfig::with_uri(url.clone()),
                )
            };

            let service = handler.serve(transport).await.map_err(|error| {
                HostError::HandshakeFailed(format!("server '{}': {error}", spec.name))
            })?;

            Ok(SessionHandle {
                service,
                child: None,
                transport_label: "streamable-http",
                server_name: spec.name.clone(),
            })
        }
    }
}

/// Downstream stderr becomes a named log source; one line per record.
fn spawn_stderr_capture(
    stderr: tokio::process::ChildStderr,
    server_name: &str,
    logs: Arc<LogBus>,
) {
    let source = format!("server/{server_name}");
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.trim().is_empty() {
                logs.publish(&source, LogLevel::Info, line);
            }
        }
    });
}

fn capability_flags(caps: &rmcp::model::ServerCapabilities) -> CapabilityFlags {
    CapabilityFlags {
        tools: caps.tools.is_some(),
        tools_list_changed: caps
            .tools
            .as_ref()
            .and_then(|c| c.list_changed)
            .unwrap_or(false),
        resources: caps.resources.is_some(),
        resources_subscribe: caps
            .resources
            .as_ref()
            .and_then(|c| c.subscribe)
            .unwrap_or(false),
        resources_list_changed: caps
            .resources
            .as_ref()
            .and_then(|c| c.list_changed)
            .unwrap_or(false),
        prompts: caps.prompts.is_some(),
        prompts_list_changed: caps
            .prompts
            .as_ref()
            .and_then(|c| c.list_changed)
            .unwrap_or(false),
        logging: caps.logging.is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::capability_flags;

    #[test]
    fn capability_bits_decode_from_wire_shape() {
        let caps: rmcp::model::ServerCapabilities = serde_json::from_value(serde_json::json!({
            "tools": {"listChanged": true},
            "resources": {"subscribe": true},
            "logging": {},
        }))
        .expect("capabilities json");

        let flags = capability_flags(&caps);
        assert!(flags.tools);
        assert!(flags.tools_list_changed);
        assert!(flags.resources);
        assert!(flags.resources_subscribe);
        assert!(!flags.resources_list_changed);
        assert!(!flags.prompts);
        assert!(flags.logging);
    }

    #[test]
    fn empty_capabilities_decode_to_all_false() {
        let caps: rmcp::model::ServerCapabilities =
            serde_json::from_value(serde_json::json!({})).expect("capabilities json");
        assert_eq!(capability_flags(&caps), mcpd_core::CapabilityFlags::default());
    }
}
