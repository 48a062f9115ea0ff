use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use rmcp::model::{Prompt, Resource, Tool};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use mcpd_core::{
    BootstrapMode, Catalog, HostError, LogBus, LogLevel, LogStream, SpecFingerprint,
};
use mcpd_index::{IndexSet, PAGE_SIZE, Page, Snapshot, SnapshotStream, page};
use mcpd_pool::{InitStatus, PoolStatus, Scheduler};
use mcpd_router::Router;

use crate::callers::{ActiveCaller, CallerTable};

#[derive(Debug, Clone, Serialize)]
pub struct ReloadSummary {
    pub servers: usize,
    pub pools: usize,
}

/// The transport-agnostic method surface. In-process consumers call these
/// directly; the RPC listener maps wire methods onto them one-to-one.
pub struct ControlPlane {
    scheduler: Arc<Scheduler>,
    indices: Arc<IndexSet>,
    router: Router,
    logs: Arc<LogBus>,
    callers: CallerTable,
    catalog: ArcSwap<Catalog>,
    catalog_path: PathBuf,
    reload_lock: tokio::sync::Mutex<()>,
    started_at: DateTime<Utc>,
}

impl ControlPlane {
    pub fn new(
        scheduler: Arc<Scheduler>,
        indices: Arc<IndexSet>,
        router: Router,
        logs: Arc<LogBus>,
        catalog: Catalog,
        catalog_path: PathBuf,
    ) -> Self {
        Self {
            scheduler,
            indices,
            router,
            logs,
            callers: CallerTable::default(),
            catalog: ArcSwap::from_pointee(catalog),
            catalog_path,
            reload_lock: tokio::sync::Mutex::new(()),
            started_at: Utc::now(),
        }
    }

    pub fn info(&self) -> Value {
        json!({
            "name": "mcpd",
            "version": env!("CARGO_PKG_VERSION"),
            "startedAt": self.started_at.to_rfc3339(),
            "uptimeSeconds": (Utc::now() - self.started_at).num_seconds(),
        })
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog.load_full()
    }

    pub fn logs(&self) -> &Arc<LogBus> {
        &self.logs
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn register_caller(&self, id: &str, pid: u32, tags: &[String]) {
        self.callers.touch(id, pid, tags);
    }

    pub fn list_active_clients(&self) -> Vec<ActiveCaller> {
        self.callers.list()
    }

    pub fn prune_callers(&self, inactive_after: Duration) -> usize {
        self.callers.prune(inactive_after)
    }

    pub fn active_caller_count(&self) -> usize {
        self.callers.len()
    }

    // ---- tools ----------------------------------------------------------

    pub fn list_tools(&self) -> Arc<Snapshot<Tool>> {
        self.indices.tools.snapshot()
    }

    pub fn watch_tools(&self) -> SnapshotStream<Tool> {
        self.indices.tools.subscribe()
    }

    /// Raw JSON pass-through of the MCP result, tool-level `isError`
    /// included.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        routing_key: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<Value, HostError> {
        let arguments = parse_arguments(arguments)?;
        let result = self
            .router
            .call_tool(name, arguments, routing_key, cancel)
            .await?;
        serde_json::to_value(result)
            .map_err(|error| HostError::RouteFailed(format!("unencodable tool result: {error}")))
    }

    // ---- resources ------------------------------------------------------

    pub fn list_resources(&self, cursor: Option<&str>) -> Result<Page<Resource>, HostError> {
        page(&self.indices.resources.snapshot(), cursor, PAGE_SIZE)
    }

    pub fn watch_resources(&self) -> SnapshotStream<Resource> {
        self.indices.resources.subscribe()
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        cancel: CancellationToken,
    ) -> Result<Value, HostError> {
        let result = self.router.read_resource(uri, cancel).await?;
        serde_json::to_value(result).map_err(|error| {
            HostError::RouteFailed(format!("unencodable resource result: {error}"))
        })
    }

    // ---- prompts --------------------------------------------------------

    pub fn list_prompts(&self, cursor: Option<&str>) -> Result<Page<Prompt>, HostError> {
        page(&self.indices.prompts.snapshot(), cursor, PAGE_SIZE)
    }

    pub fn watch_prompts(&self) -> SnapshotStream<Prompt> {
        self.indices.prompts.subscribe()
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value, HostError> {
        let arguments = parse_arguments(arguments)?;
        let result = self.router.get_prompt(name, arguments, cancel).await?;
        serde_json::to_value(result)
            .map_err(|error| HostError::RouteFailed(format!("unencodable prompt result: {error}")))
    }

    // ---- observability & lifecycle --------------------------------------

    pub fn stream_logs(&self, min_level: LogLevel) -> LogStream {
        self.logs
            .subscribe(min_level, mcpd_core::DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub async fn get_pool_status(&self) -> Vec<PoolStatus> {
        self.scheduler.pool_statuses().await
    }

    pub async fn get_server_init_status(&self) -> Vec<InitStatus> {
        self.scheduler.init_statuses().await
    }

    pub async fn retry_server_init(&self, fingerprint: &str) -> Result<SpecFingerprint, HostError> {
        let fingerprint = self.scheduler.retry_server_init(fingerprint).await?;
        self.indices.enqueue(mcpd_index::RefreshJob {
            fingerprint: fingerprint.clone(),
            kind: None,
        });
        Ok(fingerprint)
    }

    /// Reloads the catalog and re-plans the world. Idempotent and safe
    /// under active traffic; a broken catalog leaves the previous one in
    /// force and surfaces the error.
    pub async fn reload_config(&self) -> Result<ReloadSummary, HostError> {
        let _guard = self.reload_lock.lock().await;
        let catalog = mcpd_config::load_catalog(&self.catalog_path)?;

        self.catalog.store(Arc::new(catalog.clone()));
        self.scheduler.reconcile(&catalog).await;
        self.indices.reconfigure(&catalog);
        self.router.reconfigure(&catalog);
        if catalog.runtime.bootstrap == BootstrapMode::Eager {
            self.indices.refresh_all();
        }

        self.logs.publish(
            "core/control",
            LogLevel::Info,
            format!("catalog reloaded ({} servers)", catalog.servers.len()),
        );
        Ok(ReloadSummary {
            servers: catalog.servers.len(),
            pools: self.scheduler.pool_count(),
        })
    }

    /// Plain-text metric exposition for the observability endpoint.
    pub async fn render_metrics(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "mcpd_uptime_seconds {}\n",
            (Utc::now() - self.started_at).num_seconds()
        ));
        out.push_str(&format!("mcpd_pools {}\n", self.scheduler.pool_count()));
        for (state, count) in self.scheduler.instance_counts().await {
            out.push_str(&format!("mcpd_instances{{state=\"{state}\"}} {count}\n"));
        }
        out.push_str(&format!(
            "mcpd_tools_published {}\n",
            self.indices.tools.snapshot().items.len()
        ));
        out.push_str(&format!(
            "mcpd_log_records_dropped_total {}\n",
            self.logs.dropped_total()
        ));
        out.push_str(&format!(
            "mcpd_active_callers {}\n",
            self.active_caller_count()
        ));
        out
    }
}

fn parse_arguments(value: Option<Value>) -> Result<Option<Map<String, Value>>, HostError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(HostError::InvalidParams(format!(
            "arguments must be a JSON object, got {}",
            type_label(&other)
        ))),
    }
}

fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
