use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Protocol version expected from downstream servers unless a spec overrides it.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-11-25";

/// How instances of a server are pooled and handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Any ready instance may serve any call.
    Stateless,
    /// Calls carrying the same routing key stick to one instance.
    Stateful,
    /// Warm pool that is never idle-reaped.
    Persistent,
    /// At most one instance ever exists.
    Singleton,
}

impl Strategy {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stateless => "stateless",
            Self::Stateful => "stateful",
            Self::Persistent => "persistent",
            Self::Singleton => "singleton",
        }
    }

    /// Pools with these strategies are exempt from idle reaping.
    pub fn idle_exempt(&self) -> bool {
        matches!(self, Self::Persistent | Self::Singleton)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Transport half of a server spec.
///
/// Env and header maps are `BTreeMap` so iteration order is deterministic:
/// fingerprints and spawn-time env formatting must not depend on insertion
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum TransportSpec {
    #[serde(rename_all = "camelCase")]
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    #[serde(rename_all = "camelCase")]
    StreamableHttp {
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proxy: Option<String>,
    },
}

impl TransportSpec {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::StreamableHttp { .. } => "streamable-http",
        }
    }
}

/// Optional per-server exposure whitelist. `None` exposes everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExposeSpec {
    pub tools: Option<Vec<String>>,
    pub resources: Option<Vec<String>>,
    pub prompts: Option<Vec<String>>,
}

impl ExposeSpec {
    pub fn allows_tool(&self, name: &str) -> bool {
        allows(&self.tools, name)
    }

    pub fn allows_resource(&self, uri: &str) -> bool {
        allows(&self.resources, uri)
    }

    pub fn allows_prompt(&self, name: &str) -> bool {
        allows(&self.prompts, name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_none() && self.resources.is_none() && self.prompts.is_none()
    }
}

fn allows(list: &Option<Vec<String>>, name: &str) -> bool {
    match list {
        Some(entries) => entries.iter().any(|entry| entry == name),
        None => true,
    }
}

/// Declarative description of one logical downstream MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerSpec {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportSpec,
    pub protocol_version: String,
    pub strategy: Strategy,
    pub max_concurrent: u32,
    pub idle_seconds: u64,
    pub session_ttl_seconds: u64,
    pub min_ready: u32,
    #[serde(skip_serializing_if = "ExposeSpec::is_empty")]
    pub expose: ExposeSpec,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub disabled: bool,
}

impl ServerSpec {
    pub fn fingerprint(&self) -> SpecFingerprint {
        SpecFingerprint::compute(self)
    }
}

/// Stable hash of a spec's behavioral fields.
///
/// Excludes the display name and tags: two specs that behave identically
/// share one pool even when named differently. Map and list orderings are
/// normalized before hashing so permutations produce the same fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SpecFingerprint(String);

const FIELD_SEP: char = '\u{1f}';
const ITEM_SEP: char = '\u{1e}';

impl SpecFingerprint {
    pub fn compute(spec: &ServerSpec) -> Self {
        let mut buf = String::new();
        match &spec.transport {
            TransportSpec::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                push_field(&mut buf, "stdio");
                push_field(&mut buf, command);
                push_list(&mut buf, args.iter());
                push_map(&mut buf, env);
                push_field(&mut buf, &cwd.as_deref().map(|p| p.display().to_string()).unwrap_or_default());
            }
            TransportSpec::StreamableHttp {
                url,
                headers,
                proxy,
            } => {
                push_field(&mut buf, "streamable-http");
                push_field(&mut buf, url);
                push_map(&mut buf, headers);
                push_field(&mut buf, proxy.as_deref().unwrap_or_default());
            }
        }
        push_field(&mut buf, &spec.protocol_version);
        push_field(&mut buf, spec.strategy.label());
        push_field(&mut buf, &spec.max_concurrent.to_string());
        push_field(&mut buf, &spec.idle_seconds.to_string());
        push_field(&mut buf, &spec.session_ttl_seconds.to_string());
        push_field(&mut buf, &spec.min_ready.to_string());
        push_sorted_list(&mut buf, &spec.expose.tools);
        push_sorted_list(&mut buf, &spec.expose.resources);
        push_sorted_list(&mut buf, &spec.expose.prompts);

        let mut hasher = Sha256::new();
        hasher.update(buf.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Full hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form used in logs and status payloads.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    /// Matches a caller-supplied full or abbreviated fingerprint.
    pub fn matches(&self, needle: &str) -> bool {
        !needle.is_empty() && self.0.starts_with(needle)
    }
}

impl fmt::Display for SpecFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

fn push_field(buf: &mut String, value: &str) {
    buf.push_str(value);
    buf.push(FIELD_SEP);
}

fn push_list<'a>(buf: &mut String, items: impl Iterator<Item = &'a String>) {
    for item in items {
        buf.push_str(item);
        buf.push(ITEM_SEP);
    }
    buf.push(FIELD_SEP);
}

fn push_sorted_list(buf: &mut String, list: &Option<Vec<String>>) {
    match list {
        Some(entries) => {
            let mut sorted: Vec<&String> = entries.iter().collect();
            sorted.sort();
            for item in sorted {
                buf.push_str(item);
                buf.push(ITEM_SEP);
            }
        }
        None => buf.push('*'),
    }
    buf.push(FIELD_SEP);
}

fn push_map(buf: &mut String, map: &BTreeMap<String, String>) {
    for (key, value) in map {
        buf.push_str(key);
        buf.push('=');
        buf.push_str(value);
        buf.push(ITEM_SEP);
    }
    buf.push(FIELD_SEP);
}

#[cfg(test)]
#[path = "spec_tests.rs"]
mod tests;
