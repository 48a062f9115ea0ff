//! Semantic validation that runs after the schema check.

use std::collections::HashSet;

use mcpd_core::{Catalog, HostError, RpcAddr, Strategy, TransportSpec};

pub fn validate_catalog(catalog: &Catalog) -> Result<(), HostError> {
    validate_runtime(catalog)?;

    let mut seen = HashSet::new();
    for spec in &catalog.servers {
        if spec.name.trim().is_empty() {
            return Err(HostError::InvalidConfig(
                "server name must not be empty".to_string(),
            ));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(HostError::InvalidConfig(format!(
                "duplicate server name '{}'",
                spec.name
            )));
        }
        validate_server(spec)?;
    }
    Ok(())
}

fn validate_runtime(catalog: &Catalog) -> Result<(), HostError> {
    let runtime = &catalog.runtime;
    if runtime.route_timeout_seconds == 0 {
        return Err(HostError::InvalidConfig(
            "runtime.routeTimeoutSeconds must be at least 1".to_string(),
        ));
    }
    if runtime.tool_refresh_concurrency == 0 {
        return Err(HostError::InvalidConfig(
            "runtime.toolRefreshConcurrency must be at least 1".to_string(),
        ));
    }
    if runtime.server_init_retry_base_seconds == 0 {
        return Err(HostError::InvalidConfig(
            "runtime.serverInitRetryBaseSeconds must be at least 1".to_string(),
        ));
    }
    runtime.rpc.socket_mode_bits()?;
    if let Some(addr) = &runtime.rpc.listen_address {
        RpcAddr::parse(addr)?;
    }
    if let Some(addr) = &runtime.observability.listen_address {
        addr.parse::<std::net::SocketAddr>().map_err(|_| {
            HostError::InvalidConfig(format!(
                "observability.listenAddress '{addr}' is not a valid socket address"
            ))
        })?;
    }
    Ok(())
}

fn validate_server(spec: &mcpd_core::ServerSpec) -> Result<(), HostError> {
    if spec.max_concurrent == 0 {
        return Err(HostError::InvalidConfig(format!(
            "server '{}': maxConcurrent must be at least 1",
            spec.name
        )));
    }
    if !is_protocol_version_format(&spec.protocol_version) {
        return Err(HostError::InvalidConfig(format!(
            "server '{}': protocolVersion '{}' is not in YYYY-MM-DD form",
            spec.name, spec.protocol_version
        )));
    }
    match spec.strategy {
        Strategy::Singleton if spec.min_ready > 1 => {
            return Err(HostError::InvalidConfig(format!(
                "server '{}': a singleton pool cannot require minReady > 1",
                spec.name
            )));
        }
        Strategy::Persistent if spec.min_ready == 0 => {
            return Err(HostError::InvalidConfig(format!(
                "server '{}': a persistent pool requires minReady >= 1",
                spec.name
            )));
        }
        _ => {}
    }
    match &spec.transport {
        TransportSpec::Stdio { command, .. } => {
            if command.trim().is_empty() {
                return Err(HostError::InvalidConfig(format!(
                    "server '{}': command must not be empty",
                    spec.name
                )));
            }
        }
        TransportSpec::StreamableHttp { url, .. } => {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(HostError::InvalidConfig(format!(
                    "server '{}': url '{}' must be http:// or https://",
                    spec.name, url
                )));
            }
        }
    }
    Ok(())
}

/// `YYYY-MM-DD` without pulling in a date parser; the value is an opaque
/// protocol revision, not a calendar date.
fn is_protocol_version_format(version: &str) -> bool {
    let bytes = version.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| matches!(i, 4 | 7) || b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::is_protocol_version_format;

    #[test]
    fn protocol_version_format() {
        assert!(is_protocol_version_format("2025-11-25"));
        assert!(is_protocol_version_format("2024-01-01"));
        assert!(!is_protocol_version_format("2025-11-5"));
        assert!(!is_protocol_version_format("2025/11/25"));
        assert!(!is_protocol_version_format("latest"));
        assert!(!is_protocol_version_format(""));
    }
}
