//! Line-delimited JSON RPC over the control socket.
//!
//! Unary methods answer `{id, result}` or `{id, error}`; streaming methods
//! (`*/watch`, `logs/stream`) answer once and then emit one `{id, event}`
//! line per update until the client hangs up. MCP payloads pass through
//! opaquely; only envelope fields are structured.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use mcpd_core::{HostError, LogLevel};
use serde::Serialize;

use crate::plane::ControlPlane;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    caller: Option<CallerInfo>,
}

#[derive(Debug, Deserialize)]
struct CallerInfo {
    id: String,
    #[serde(default)]
    pid: u32,
    #[serde(default)]
    tags: Vec<String>,
}

pub(crate) async fn handle_connection<S>(
    stream: S,
    control: Arc<ControlPlane>,
    shutdown_tx: watch::Sender<bool>,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = reader.read_line(&mut line) => read.context("failed to read request line")?,
        };
        if bytes == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }

        let envelope: Envelope = match serde_json::from_str(line.trim()) {
            Ok(envelope) => envelope,
            Err(error) => {
                write_line(
                    &mut write_half,
                    &error_envelope(Value::Null, -32700, &format!("invalid request: {error}")),
                )
                .await?;
                continue;
            }
        };

        if let Some(caller) = &envelope.caller {
            control.register_caller(&caller.id, caller.pid, &caller.tags);
        }

        match envelope.method.as_str() {
            "tools/watch" => {
                let snapshot = control.list_tools();
                let initial = serde_json::to_value(&*snapshot).unwrap_or(Value::Null);
                return run_snapshot_watch(
                    envelope.id,
                    initial,
                    control.watch_tools(),
                    &mut reader,
                    &mut write_half,
                    cancel,
                )
                .await;
            }
            "resources/watch" => {
                let snapshot = control.list_resources(None).map(|p| {
                    serde_json::to_value(&p).unwrap_or(Value::Null)
                });
                let initial = match snapshot {
                    Ok(value) => value,
                    Err(error) => {
                        write_host_error(&mut write_half, envelope.id, &error).await?;
                        continue;
                    }
                };
                return run_snapshot_watch(
                    envelope.id,
                    initial,
                    control.watch_resources(),
                    &mut reader,
                    &mut write_half,
                    cancel,
                )
                .await;
            }
            "prompts/watch" => {
                let snapshot = control.list_prompts(None).map(|p| {
                    serde_json::to_value(&p).unwrap_or(Value::Null)
                });
                let initial = match snapshot {
                    Ok(value) => value,
                    Err(error) => {
                        write_host_error(&mut write_half, envelope.id, &error).await?;
                        continue;
                    }
                };
                return run_snapshot_watch(
                    envelope.id,
                    initial,
                    control.watch_prompts(),
                    &mut reader,
                    &mut write_half,
                    cancel,
                )
                .await;
            }
            "logs/stream" => {
                return run_log_stream(
                    envelope.id,
                    envelope.params,
                    control,
                    &mut reader,
                    &mut write_half,
                    cancel,
                )
                .await;
            }
            "host/stop" => {
                let _ = shutdown_tx.send(true);
                write_line(
                    &mut write_half,
                    &result_envelope(envelope.id, json!({"stopping": true})),
                )
                .await?;
                return Ok(());
            }
            _ => {
                let response =
                    dispatch_unary(&control, &envelope.method, envelope.params, &cancel).await;
                match response {
                    Ok(result) => {
                        write_line(&mut write_half, &result_envelope(envelope.id, result)).await?;
                    }
                    Err(error) => {
                        write_host_error(&mut write_half, envelope.id, &error).await?;
                    }
                }
            }
        }
    }
}

async fn dispatch_unary(
    control: &ControlPlane,
    method: &str,
    params: Value,
    cancel: &CancellationToken,
) -> Result<Value, HostError> {
    match method {
        "host/info" => Ok(control.info()),
        "tools/list" => {
            let snapshot = control.list_tools();
            serde_json::to_value(&*snapshot)
                .map_err(|error| HostError::RouteFailed(error.to_string()))
        }
        "tools/call" => {
            let name = require_str(&params, "name")?;
            let routing_key = optional_str(&params, "routingKey");
            control
                .call_tool(
                    name,
                    params.get("arguments").cloned(),
                    routing_key.as_deref(),
                    cancel.clone(),
                )
                .await
        }
        "resources/list" => {
            let cursor = optional_str(&params, "cursor");
            let page = control.list_resources(cursor.as_deref())?;
            serde_json::to_value(page).map_err(|error| HostError::RouteFailed(error.to_string()))
        }
        "resources/read" => {
            let uri = require_str(&params, "uri")?;
            control.read_resource(uri, cancel.clone()).await
        }
        "prompts/list" => {
            let cursor = optional_str(&params, "cursor");
            let page = control.list_prompts(cursor.as_deref())?;
            serde_json::to_value(page).map_err(|error| HostError::RouteFailed(error.to_string()))
        }
        "prompts/get" => {
            let name = require_str(&params, "name")?;
            control
                .get_prompt(name, params.get("arguments").cloned(), cancel.clone())
                .await
        }
        "pool/status" => {
            let statuses = control.get_pool_status().await;
            serde_json::to_value(statuses)
                .map_err(|error| HostError::RouteFailed(error.to_string()))
        }
        "init/status" => {
            let statuses = control.get_server_init_status().await;
            serde_json::to_value(statuses)
                .map_err(|error| HostError::RouteFailed(error.to_string()))
        }
        "init/retry" => {
            let fingerprint = require_str(&params, "fingerprint")?;
            let fingerprint = control.retry_server_init(fingerprint).await?;
            Ok(json!({"fingerprint": fingerprint.as_str()}))
        }
        "clients/list" => {
            let callers = control.list_active_clients();
            serde_json::to_value(callers)
                .map_err(|error| HostError::RouteFailed(error.to_string()))
        }
        "config/reload" => {
            let summary = control.reload_config().await?;
            serde_json::to_value(summary)
                .map_err(|error| HostError::RouteFailed(error.to_string()))
        }
        other => Err(HostError::MethodNotFound(format!(
            "unknown control method '{other}'"
        ))),
    }
}

async fn run_snapshot_watch<T, S>(
    id: Value,
    initial: Value,
    mut events: mcpd_index::SnapshotStream<T>,
    reader: &mut BufReader<ReadHalf<S>>,
    writer: &mut WriteHalf<S>,
    cancel: CancellationToken,
) -> Result<()>
where
    T: Serialize,
    S: AsyncRead + AsyncWrite,
{
    write_line(writer, &result_envelope(id.clone(), initial)).await?;
    let mut sink = String::new();
    loop {
        sink.clear();
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            snapshot = events.recv() => {
                let Some(snapshot) = snapshot else { return Ok(()) };
                let event = serde_json::to_value(&*snapshot).unwrap_or(Value::Null);
                write_line(writer, &json!({"id": id, "event": event})).await?;
            }
            read = reader.read_line(&mut sink) => {
                if read.context("failed to read from watch client")? == 0 {
                    return Ok(());
                }
            }
        }
    }
}

async fn run_log_stream<S>(
    id: Value,
    params: Value,
    control: Arc<ControlPlane>,
    reader: &mut BufReader<ReadHalf<S>>,
    writer: &mut WriteHalf<S>,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let min_level = match optional_str(&params, "minLevel") {
        None => LogLevel::Info,
        Some(raw) => match LogLevel::from_str(&raw) {
            Ok(level) => level,
            Err(message) => {
                write_host_error(writer, id, &HostError::InvalidParams(message)).await?;
                return Ok(());
            }
        },
    };
    let mut stream = control.stream_logs(min_level);

    write_line(writer, &result_envelope(id.clone(), json!({"streaming": true}))).await?;
    let mut sink = String::new();
    loop {
        sink.clear();
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            record = stream.recv() => {
                let event = json!({
                    "id": id,
                    "event": record,
                    "dropped": stream.dropped(),
                });
                write_line(writer, &event).await?;
            }
            read = reader.read_line(&mut sink) => {
                if read.context("failed to read from log client")? == 0 {
                    return Ok(());
                }
            }
        }
    }
}

fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, HostError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| HostError::InvalidParams(format!("missing string param '{key}'")))
}

fn optional_str(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

async fn write_host_error<W: AsyncWrite + Unpin>(
    writer: &mut W,
    id: Value,
    error: &HostError,
) -> Result<()> {
    write_line(
        writer,
        &error_envelope(id, error.jsonrpc_code(), &error.to_string()),
    )
    .await
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, value: &Value) -> Result<()> {
    let payload = serde_json::to_string(value).context("failed to serialize response")?;
    writer
        .write_all(payload.as_bytes())
        .await
        .context("failed to write response")?;
    writer
        .write_all(b"\n")
        .await
        .context("failed to write response delimiter")?;
    writer.flush().await.context("failed to flush response")
}

fn result_envelope(id: Value, result: Value) -> Value {
    json!({"id": id, "result": result})
}

fn error_envelope(id: Value, code: i64, message: &str) -> Value {
    json!({"id": id, "error": {"code": code, "message": message}})
}
