use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mcpd_core::{
    Catalog, DEFAULT_PROTOCOL_VERSION, ExposeSpec, HostError, LogBus, RuntimeConfig, ServerSpec,
    Strategy, TransportSpec,
};
use mcpd_index::IndexSet;
use mcpd_pool::{Scheduler, SchedulerConfig};
use mcpd_transport::TransportContext;

use super::Router;

fn write_mock_script(dir: &Path) -> PathBuf {
    let path = dir.join("mock-mcp.sh");
    fs::write(
        &path,
        r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([0-9]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-11-25","capabilities":{"tools":{}},"serverInfo":{"name":"mock","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo_tool","description":"echo","inputSchema":{"type":"object","properties":{}}}]}}\n' "$id"
      ;;
    *\"tools/call\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id"
      ;;
  esac
done
"#,
    )
    .expect("write mock script");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path).expect("stat script").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod script");
    }

    path
}

fn mock_catalog(script: &Path) -> Catalog {
    let spec = ServerSpec {
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
    };
    Catalog::new(RuntimeConfig::default(), vec![spec])
}

struct Harness {
    scheduler: Arc<Scheduler>,
    indices: Arc<IndexSet>,
    router: Router,
    cancel: CancellationToken,
}

async fn harness(script: &Path) -> Harness {
    let catalog = mock_catalog(script);
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let transport = TransportContext {
        logs: Arc::new(LogBus::new()),
        list_changed_tx: tx,
    };
    let scheduler = Scheduler::new(SchedulerConfig::default(), transport);
    scheduler.reconcile(&catalog).await;

    let indices = IndexSet::new(Arc::clone(&scheduler));
    let cancel = CancellationToken::new();
    indices.spawn_workers(2, cancel.clone());
    indices.reconfigure(&catalog);
    indices.refresh_all();

    // Wait for the refresh worker to publish the mock's tool.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while indices.tools.snapshot().items.is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "tool index never populated"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let router = Router::new(Arc::clone(&scheduler), Arc::clone(&indices));
    router.reconfigure(&catalog);
    Harness {
        scheduler,
        indices,
        router,
        cancel,
    }
}

#[tokio::test]
async fn call_tool_resolves_namespaced_name_and_forwards() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_mock_script(temp.path());
    let h = harness(&script).await;

    let snapshot = h.indices.tools.snapshot();
    assert_eq!(snapshot.items[0].public_name, "mock.echo_tool");

    let result = h
        .router
        .call_tool("mock.echo_tool", None, None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        result.content[0].as_text().map(|t| t.text.as_str()),
        Some("pong")
    );

    h.cancel.cancel();
    h.scheduler.stop_all().await;
}

#[tokio::test]
async fn unknown_tool_is_method_not_found() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_mock_script(temp.path());
    let h = harness(&script).await;

    let err = h
        .router
        .call_tool("mock.nope", None, None, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::MethodNotFound(_)), "{err:?}");
    assert_eq!(err.jsonrpc_code(), -32601);

    h.cancel.cancel();
    h.scheduler.stop_all().await;
}

#[tokio::test]
async fn resource_reads_without_resource_capability_are_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_mock_script(temp.path());
    let h = harness(&script).await;

    // The mock never declares resources, so nothing is indexed.
    let err = h
        .router
        .read_resource("file:///anything", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::MethodNotFound(_)), "{err:?}");

    h.cancel.cancel();
    h.scheduler.stop_all().await;
}

#[tokio::test]
async fn cancelled_caller_gets_canceled_and_slot_is_released() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_mock_script(temp.path());
    let h = harness(&script).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h
        .router
        .call_tool("mock.echo_tool", None, None, cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::Canceled), "{err:?}");

    // The busy slot must be back regardless of the canceled forward.
    let statuses = h.scheduler.pool_statuses().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let fingerprint = statuses[0].fingerprint.clone();
    loop {
        let statuses = h.scheduler.pool_statuses().await;
        let busy: u32 = statuses[0].instances.iter().map(|i| i.busy).sum();
        if busy == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "slot never released for pool {fingerprint}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.cancel.cancel();
    h.scheduler.stop_all().await;
}
