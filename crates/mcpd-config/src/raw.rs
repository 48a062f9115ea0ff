//! Schema-checked raw catalog shapes.
//!
//! The raw structs are flat with `deny_unknown_fields`, so unknown keys and
//! type mismatches fail deserialization up-front; transport-kind dispatch
//! and field-consistency checks happen when converting into [`ServerSpec`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use mcpd_core::{
    Catalog, DEFAULT_PROTOCOL_VERSION, ExposeSpec, HostError, RuntimeConfig, ServerSpec, Strategy,
    TransportSpec,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct RawCatalog {
    #[serde(default)]
    runtime: RuntimeConfig,
    #[serde(default)]
    servers: Vec<RawServer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum RawTransportKind {
    Stdio,
    StreamableHttp,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawServer {
    name: String,
    transport: RawTransportKind,

    // stdio fields
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    cwd: Option<PathBuf>,

    // streamable-http fields
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    proxy: Option<String>,

    #[serde(default = "default_protocol_version")]
    protocol_version: String,
    #[serde(default = "default_strategy")]
    strategy: Strategy,
    #[serde(default = "default_max_concurrent")]
    max_concurrent: u32,
    #[serde(default = "default_idle_seconds")]
    idle_seconds: u64,
    #[serde(default = "default_session_ttl_seconds")]
    session_ttl_seconds: u64,
    #[serde(default)]
    min_ready: u32,
    #[serde(default)]
    expose: ExposeSpec,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    disabled: bool,
}

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}

fn default_strategy() -> Strategy {
    Strategy::Stateless
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_idle_seconds() -> u64 {
    300
}

fn default_session_ttl_seconds() -> u64 {
    300
}

impl RawCatalog {
    pub(crate) fn into_catalog(self) -> Result<Catalog, HostError> {
        let mut servers = Vec::with_capacity(self.servers.len());
        for raw in self.servers {
            servers.push(raw.into_spec()?);
        }
        Ok(Catalog::new(self.runtime, servers))
    }
}

impl RawServer {
    fn into_spec(self) -> Result<ServerSpec, HostError> {
        let transport = match self.transport {
            RawTransportKind::Stdio => {
                if self.url.is_some() || !self.headers.is_empty() || self.proxy.is_some() {
                    return Err(HostError::InvalidConfig(format!(
                        "server '{}': url/headers/proxy are not valid for a stdio transport",
                        self.name
                    )));
                }
                let command = self.command.ok_or_else(|| {
                    HostError::InvalidConfig(format!(
                        "server '{}': stdio transport requires 'command'",
                        self.name
                    ))
                })?;
                TransportSpec::Stdio {
                    command,
                    args: self.args,
                    env: self.env,
                    cwd: self.cwd,
                }
            }
            RawTransportKind::StreamableHttp => {
                if self.command.is_some()
                    || !self.args.is_empty()
                    || !self.env.is_empty()
                    || self.cwd.is_some()
                {
                    return Err(HostError::InvalidConfig(format!(
                        "server '{}': command/args/env/cwd are not valid for a streamable-http transport",
                        self.name
                    )));
                }
                let url = self.url.ok_or_else(|| {
                    HostError::InvalidConfig(format!(
                        "server '{}': streamable-http transport requires 'url'",
                        self.name
                    ))
                })?;
                TransportSpec::StreamableHttp {
                    url,
                    headers: self.headers,
                    proxy: self.proxy,
                }
            }
        };

        Ok(ServerSpec {
            name: self.name,
            transport,
            protocol_version: self.protocol_version,
            strategy: self.strategy,
            max_concurrent: self.max_concurrent,
            idle_seconds: self.idle_seconds,
            session_ttl_seconds: self.session_ttl_seconds,
            min_ready: self.min_ready,
            expose: self.expose,
            tags: self.tags,
            disabled: self.disabled,
        })
    }
}
