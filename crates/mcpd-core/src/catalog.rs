use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HostError;
use crate::spec::{ServerSpec, SpecFingerprint};

/// How public tool and prompt names are derived from downstream names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceStrategy {
    /// `{serverName}.{originalName}`.
    #[default]
    Prefix,
    /// Original names published as-is; conflicts keep the first seen.
    Flat,
}

/// Whether pools and indices warm up at startup or on first use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapMode {
    #[default]
    Eager,
    Lazy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ObservabilityConfig {
    pub listen_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RpcConfig {
    /// `unix://<path>`, `tcp://<addr>:<port>`, or a bare socket path.
    /// `None` falls back to the per-user runtime directory default.
    pub listen_address: Option<String>,
    /// Octal file-mode literal applied to the Unix socket after listen.
    pub socket_mode: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
            socket_mode: "0600".to_string(),
        }
    }
}

impl RpcConfig {
    /// Where the control plane listens: the configured address, or the
    /// per-user default socket when `listenAddress` is unset.
    pub fn resolve_addr(&self) -> Result<RpcAddr, HostError> {
        match &self.listen_address {
            Some(raw) => RpcAddr::parse(raw),
            None => Ok(RpcAddr::Unix(Self::default_socket_path())),
        }
    }

    /// `mcpd/control.sock` under the user's runtime directory, with the
    /// system temp directory as the last resort. The bind path creates the
    /// leaf directory private to the user, so a shared fallback root is
    /// still single-owner.
    pub fn default_socket_path() -> PathBuf {
        directories::BaseDirs::new()
            .and_then(|dirs| dirs.runtime_dir().map(|dir| dir.join("mcpd")))
            .unwrap_or_else(|| std::env::temp_dir().join("mcpd"))
            .join("control.sock")
    }

    pub fn socket_mode_bits(&self) -> Result<u32, HostError> {
        let raw = self.socket_mode.trim_start_matches("0o");
        let mode = u32::from_str_radix(raw, 8).map_err(|_| {
            HostError::InvalidConfig(format!(
                "rpc.socketMode '{}' is not an octal file mode",
                self.socket_mode
            ))
        })?;
        if mode > 0o777 {
            return Err(HostError::InvalidConfig(format!(
                "rpc.socketMode '{}' exceeds 0777",
                self.socket_mode
            )));
        }
        Ok(mode)
    }
}

/// Resolved control-plane listen address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcAddr {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl RpcAddr {
    pub fn parse(raw: &str) -> Result<Self, HostError> {
        if let Some(path) = raw.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(HostError::InvalidConfig(
                    "rpc.listenAddress unix path is empty".to_string(),
                ));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = raw.strip_prefix("tcp://") {
            let parsed = addr.parse::<SocketAddr>().map_err(|_| {
                HostError::InvalidConfig(format!(
                    "rpc.listenAddress '{raw}' is not a valid tcp address"
                ))
            })?;
            return Ok(Self::Tcp(parsed));
        }
        if raw.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(raw)));
        }
        Err(HostError::InvalidConfig(format!(
            "rpc.listenAddress '{raw}' must start with unix://, tcp://, or /"
        )))
    }
}

/// Global runtime knobs.
///
/// These are exactly the recognized options; the schema check rejects
/// anything else up-front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RuntimeConfig {
    /// Per-request deadline for routed calls.
    pub route_timeout_seconds: u64,
    /// Health sweep cadence; 0 disables the sweep.
    pub ping_interval_seconds: u64,
    /// Aggregation refresh cadence; 0 disables the timer (event-driven only).
    pub tool_refresh_seconds: u64,
    pub tool_refresh_concurrency: usize,
    pub client_check_seconds: u64,
    pub client_inactive_seconds: u64,
    pub server_init_retry_base_seconds: u64,
    pub server_init_retry_max_seconds: u64,
    pub server_init_max_retries: u32,
    pub bootstrap: BootstrapMode,
    /// Global off switch for tool exposure.
    pub expose_tools: bool,
    pub tool_namespace_strategy: NamespaceStrategy,
    pub observability: ObservabilityConfig,
    pub rpc: RpcConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            route_timeout_seconds: 30,
            ping_interval_seconds: 60,
            tool_refresh_seconds: 300,
            tool_refresh_concurrency: 4,
            client_check_seconds: 30,
            client_inactive_seconds: 300,
            server_init_retry_base_seconds: 1,
            server_init_retry_max_seconds: 60,
            server_init_max_retries: 5,
            bootstrap: BootstrapMode::Eager,
            expose_tools: true,
            tool_namespace_strategy: NamespaceStrategy::Prefix,
            observability: ObservabilityConfig::default(),
            rpc: RpcConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn route_timeout(&self) -> Duration {
        Duration::from_secs(self.route_timeout_seconds.max(1))
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_seconds > 0).then(|| Duration::from_secs(self.ping_interval_seconds))
    }

    pub fn tool_refresh_interval(&self) -> Option<Duration> {
        (self.tool_refresh_seconds > 0).then(|| Duration::from_secs(self.tool_refresh_seconds))
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_secs(self.server_init_retry_base_seconds.max(1))
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_secs(
            self.server_init_retry_max_seconds
                .max(self.server_init_retry_base_seconds.max(1)),
        )
    }

    /// Backoff before retry attempt `attempts + 1`.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let base = self.retry_base();
        let capped = base.saturating_mul(2u32.saturating_pow(attempts.min(16)));
        capped.min(self.retry_max())
    }
}

/// Immutable snapshot of every server spec plus the runtime config.
///
/// Produced whole by the catalog loader; never mutated in place. A reload
/// builds a fresh catalog and re-plans the world against it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Catalog {
    pub runtime: RuntimeConfig,
    pub servers: Vec<ServerSpec>,
}

impl Catalog {
    pub fn new(runtime: RuntimeConfig, servers: Vec<ServerSpec>) -> Self {
        Self { runtime, servers }
    }

    /// Enabled specs in catalog order.
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerSpec> {
        self.servers.iter().filter(|spec| !spec.disabled)
    }

    /// `(spec, fingerprint)` pairs for enabled servers, catalog order.
    pub fn fingerprinted(&self) -> Vec<(&ServerSpec, SpecFingerprint)> {
        self.enabled_servers()
            .map(|spec| (spec, spec.fingerprint()))
            .collect()
    }

    pub fn server_named(&self, name: &str) -> Option<&ServerSpec> {
        self.servers.iter().find(|spec| spec.name == name)
    }
}
