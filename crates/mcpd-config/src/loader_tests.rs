use mcpd_core::{BootstrapMode, NamespaceStrategy, Strategy, TransportSpec};

use super::parse_catalog;

fn no_env(_name: &str) -> Option<String> {
    None
}

const FULL_CATALOG: &str = r#"
runtime:
  routeTimeoutSeconds: 20
  pingIntervalSeconds: 30
  toolRefreshSeconds: 120
  toolRefreshConcurrency: 2
  serverInitMaxRetries: 3
  bootstrap: lazy
  toolNamespaceStrategy: flat
  rpc:
    listenAddress: unix:///tmp/mcpd-test/control.sock
    socketMode: "0660"
servers:
  - name: echo
    transport: stdio
    command: mock-echo
    args: ["--mcp"]
    env:
      MODE: fast
    strategy: stateless
    maxConcurrent: 2
    idleSeconds: 60
    minReady: 0
  - name: remote
    transport: streamable-http
    url: https://mcp.example.test/mcp
    headers:
      Authorization: Bearer abc
    strategy: singleton
    protocolVersion: "2025-06-18"
"#;

#[test]
fn full_catalog_parses() {
    let catalog = parse_catalog(FULL_CATALOG, &no_env).unwrap();
    assert_eq!(catalog.runtime.route_timeout_seconds, 20);
    assert_eq!(catalog.runtime.bootstrap, BootstrapMode::Lazy);
    assert_eq!(
        catalog.runtime.tool_namespace_strategy,
        NamespaceStrategy::Flat
    );
    assert_eq!(catalog.runtime.rpc.socket_mode_bits().unwrap(), 0o660);
    assert_eq!(catalog.servers.len(), 2);

    let echo = catalog.server_named("echo").unwrap();
    assert_eq!(echo.strategy, Strategy::Stateless);
    assert_eq!(echo.max_concurrent, 2);
    assert!(matches!(&echo.transport, TransportSpec::Stdio { command, .. } if command == "mock-echo"));

    let remote = catalog.server_named("remote").unwrap();
    assert_eq!(remote.strategy, Strategy::Singleton);
    assert_eq!(remote.protocol_version, "2025-06-18");
}

#[test]
fn defaults_fill_in() {
    let catalog = parse_catalog(
        "servers:\n  - name: s\n    transport: stdio\n    command: run\n",
        &no_env,
    )
    .unwrap();
    let spec = &catalog.servers[0];
    assert_eq!(spec.protocol_version, mcpd_core::DEFAULT_PROTOCOL_VERSION);
    assert_eq!(spec.strategy, Strategy::Stateless);
    assert_eq!(spec.max_concurrent, 1);
    assert!(!spec.disabled);
    assert_eq!(catalog.runtime.route_timeout_seconds, 30);
}

#[test]
fn unknown_top_level_key_is_rejected() {
    let err = parse_catalog("runtime: {}\nservers: []\nextra: 1\n", &no_env).unwrap_err();
    assert!(err.to_string().contains("catalog schema"), "{err}");
}

#[test]
fn unknown_runtime_key_is_rejected() {
    let err = parse_catalog("runtime:\n  nope: true\n", &no_env).unwrap_err();
    assert!(err.to_string().contains("catalog schema"), "{err}");
}

#[test]
fn type_mismatch_is_rejected() {
    let err = parse_catalog(
        "servers:\n  - name: s\n    transport: stdio\n    command: run\n    maxConcurrent: lots\n",
        &no_env,
    )
    .unwrap_err();
    assert!(err.to_string().contains("catalog schema"), "{err}");
}

#[test]
fn stdio_server_with_url_is_rejected() {
    let err = parse_catalog(
        "servers:\n  - name: s\n    transport: stdio\n    command: run\n    url: https://x\n",
        &no_env,
    )
    .unwrap_err();
    assert!(err.to_string().contains("not valid for a stdio"), "{err}");
}

#[test]
fn http_server_requires_url() {
    let err = parse_catalog(
        "servers:\n  - name: s\n    transport: streamable-http\n",
        &no_env,
    )
    .unwrap_err();
    assert!(err.to_string().contains("requires 'url'"), "{err}");
}

#[test]
fn duplicate_names_are_rejected() {
    let doc = "servers:\n  - name: s\n    transport: stdio\n    command: a\n  - name: s\n    transport: stdio\n    command: b\n";
    let err = parse_catalog(doc, &no_env).unwrap_err();
    assert!(err.to_string().contains("duplicate server name"), "{err}");
}

#[test]
fn bad_protocol_version_is_rejected() {
    let doc = "servers:\n  - name: s\n    transport: stdio\n    command: a\n    protocolVersion: latest\n";
    let err = parse_catalog(doc, &no_env).unwrap_err();
    assert!(err.to_string().contains("YYYY-MM-DD"), "{err}");
}

#[test]
fn persistent_requires_min_ready() {
    let doc =
        "servers:\n  - name: s\n    transport: stdio\n    command: a\n    strategy: persistent\n";
    let err = parse_catalog(doc, &no_env).unwrap_err();
    assert!(err.to_string().contains("minReady >= 1"), "{err}");
}

#[test]
fn env_reference_expands_into_typed_scalar() {
    let lookup = |name: &str| match name {
        "POOL" => Some("4".to_string()),
        "TOKEN" => Some("tok-123".to_string()),
        _ => None,
    };
    let doc = "servers:\n  - name: s\n    transport: streamable-http\n    url: https://x.test/mcp\n    headers:\n      Authorization: Bearer ${TOKEN}\n    maxConcurrent: ${POOL}\n";
    let catalog = parse_catalog(doc, &lookup).unwrap();
    let spec = &catalog.servers[0];
    assert_eq!(spec.max_concurrent, 4);
    if let TransportSpec::StreamableHttp { headers, .. } = &spec.transport {
        assert_eq!(headers["Authorization"], "Bearer tok-123");
    } else {
        panic!("expected streamable-http transport");
    }
}

#[test]
fn permuted_env_yields_identical_fingerprints() {
    let a = parse_catalog(
        "servers:\n  - name: s\n    transport: stdio\n    command: run\n    env:\n      A: '1'\n      B: '2'\n",
        &no_env,
    )
    .unwrap();
    let b = parse_catalog(
        "servers:\n  - name: renamed\n    transport: stdio\n    command: run\n    env:\n      B: '2'\n      A: '1'\n",
        &no_env,
    )
    .unwrap();
    assert_eq!(
        a.servers[0].fingerprint(),
        b.servers[0].fingerprint()
    );
}

#[test]
fn reparsing_identical_text_yields_equal_catalogs() {
    let first = parse_catalog(FULL_CATALOG, &no_env).unwrap();
    let second = parse_catalog(FULL_CATALOG, &no_env).unwrap();
    assert_eq!(first, second);
}
