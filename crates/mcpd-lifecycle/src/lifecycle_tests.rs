use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mcpd_core::{
    DEFAULT_PROTOCOL_VERSION, ExposeSpec, HostError, LogBus, ServerSpec, Strategy, TransportSpec,
};
use mcpd_transport::TransportContext;

use super::*;

/// Minimal line-delimited JSON-RPC MCP server used by these tests.
pub(crate) fn write_mock_script(dir: &Path, protocol_version: &str) -> PathBuf {
    let path = dir.join("mock-mcp.sh");
    let body = format!(
        r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([0-9]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"protocolVersion":"{protocol_version}","capabilities":{{"tools":{{"listChanged":true}},"prompts":{{}}}},"serverInfo":{{"name":"mock","version":"0.1.0"}}}}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"tools":[{{"name":"echo_tool","description":"echo","inputSchema":{{"type":"object","properties":{{}}}}}}]}}}}\n' "$id"
      ;;
    *\"tools/call\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"content":[{{"type":"text","text":"pong"}}]}}}}\n' "$id"
      ;;
  esac
done
"#
    );
    fs::write(&path, body).expect("write mock script");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path).expect("stat mock script").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod mock script");
    }

    path
}

pub(crate) fn mock_spec(script: &Path) -> ServerSpec {
    ServerSpec {
        name: "mock".to_string(),
        transport: TransportSpec::Stdio {
            command: "sh".to_string(),
            args: vec![script.to_string_lossy().into_owned()],
            env: BTreeMap::new(),
            cwd: None,
        },
        protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
        strategy: Strategy::Stateless,
        max_concurrent: 2,
        idle_seconds: 60,
        session_ttl_seconds: 300,
        min_ready: 0,
        expose: ExposeSpec::default(),
        tags: Vec::new(),
        disabled: false,
    }
}

fn transport_ctx() -> TransportContext {
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    TransportContext {
        logs: Arc::new(LogBus::new()),
        list_changed_tx: tx,
    }
}

#[tokio::test]
async fn start_reaches_ready_and_records_capabilities() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_mock_script(temp.path(), DEFAULT_PROTOCOL_VERSION);
    let spec = mock_spec(&script);
    let ctx = transport_ctx();
    let cfg = LifecycleConfig::default();

    let instance = start_instance(&spec, &spec.fingerprint(), &ctx, &cfg)
        .await
        .unwrap();

    assert_eq!(instance.state(), InstanceState::Ready);
    assert_eq!(instance.busy_count(), 0);
    assert_eq!(instance.protocol_version, DEFAULT_PROTOCOL_VERSION);
    assert!(instance.capabilities.tools);
    assert!(instance.capabilities.tools_list_changed);
    assert!(instance.capabilities.prompts);
    assert!(!instance.capabilities.resources);

    stop_instance(&instance, "test done", &cfg).await;
    assert_eq!(instance.state(), InstanceState::Stopped);
}

#[tokio::test]
async fn protocol_mismatch_fails_with_unsupported_protocol() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_mock_script(temp.path(), "2024-01-01");
    let spec = mock_spec(&script);
    let ctx = transport_ctx();

    let err = start_instance(&spec, &spec.fingerprint(), &ctx, &LifecycleConfig::default())
        .await
        .unwrap_err();

    match err {
        HostError::UnsupportedProtocol { required, offered } => {
            assert_eq!(required, DEFAULT_PROTOCOL_VERSION);
            assert_eq!(offered, "2024-01-01");
        }
        other => panic!("expected UnsupportedProtocol, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_command_fails_with_start_failed() {
    let spec = ServerSpec {
        transport: TransportSpec::Stdio {
            command: "/nonexistent/mcpd-test-binary".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        },
        ..mock_spec(Path::new("unused"))
    };
    let ctx = transport_ctx();

    let err = start_instance(&spec, &spec.fingerprint(), &ctx, &LifecycleConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::StartFailed(_)), "{err:?}");
}

#[tokio::test]
async fn whitelist_against_missing_capability_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_mock_script(temp.path(), DEFAULT_PROTOCOL_VERSION);
    let mut spec = mock_spec(&script);
    // The mock declares tools and prompts but not resources.
    spec.expose.resources = Some(vec!["file:///allowed".to_string()]);
    let ctx = transport_ctx();

    let err = start_instance(&spec, &spec.fingerprint(), &ctx, &LifecycleConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::CapabilityRejected(_)), "{err:?}");
}

#[tokio::test]
async fn ping_round_trips_against_a_live_instance() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_mock_script(temp.path(), DEFAULT_PROTOCOL_VERSION);
    let spec = mock_spec(&script);
    let ctx = transport_ctx();
    let cfg = LifecycleConfig::default();

    let instance = start_instance(&spec, &spec.fingerprint(), &ctx, &cfg)
        .await
        .unwrap();
    ping(&instance, Duration::from_secs(5)).await.unwrap();
    stop_instance(&instance, "test done", &cfg).await;
}

#[test]
fn slot_accounting_enforces_max_concurrent() {
    // Pure state-machine checks exercised through acquire/release; no
    // session is needed because capacity gating happens before any I/O.
    // Constructing an Instance requires a session, so these invariants are
    // covered against a live mock in the async tests above; here we check
    // the state labels stay stable for status payloads.
    assert_eq!(InstanceState::Ready.label(), "ready");
    assert_eq!(InstanceState::Draining.label(), "draining");
}

#[tokio::test]
async fn acquire_and_release_pair_leaves_state_ready() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_mock_script(temp.path(), DEFAULT_PROTOCOL_VERSION);
    let spec = mock_spec(&script);
    let ctx = transport_ctx();
    let cfg = LifecycleConfig::default();

    let instance = start_instance(&spec, &spec.fingerprint(), &ctx, &cfg)
        .await
        .unwrap();

    assert!(instance.acquire_slot());
    assert_eq!(instance.state(), InstanceState::Busy);
    assert!(instance.acquire_slot());
    // max_concurrent = 2: a third slot must be refused.
    assert!(!instance.acquire_slot());
    assert_eq!(instance.busy_count(), 2);

    assert_eq!(instance.release_slot(), 1);
    assert_eq!(instance.state(), InstanceState::Busy);
    assert_eq!(instance.release_slot(), 0);
    assert_eq!(instance.state(), InstanceState::Ready);

    stop_instance(&instance, "test done", &cfg).await;
}

#[tokio::test]
async fn draining_instance_refuses_new_slots() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_mock_script(temp.path(), DEFAULT_PROTOCOL_VERSION);
    let spec = mock_spec(&script);
    let ctx = transport_ctx();
    let cfg = LifecycleConfig::default();

    let instance = start_instance(&spec, &spec.fingerprint(), &ctx, &cfg)
        .await
        .unwrap();
    instance.set_state(InstanceState::Draining);
    assert!(!instance.acquire_slot());
    stop_instance(&instance, "test done", &cfg).await;
}
