//! Optional observability endpoints, gated by `MCPD_HEALTHZ_ENABLED` /
//! `MCPD_METRICS_ENABLED` and the configured listen address.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::plane::ControlPlane;

#[derive(Clone, Copy)]
struct Gates {
    healthz: bool,
    metrics: bool,
}

pub(crate) fn env_enabled(name: &str) -> bool {
    std::env::var(name)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Starts the observability server when an address is configured and at
/// least one endpoint is enabled. Returns `None` otherwise.
pub(crate) async fn spawn_observability(
    listen_address: Option<&str>,
    control: Arc<ControlPlane>,
    cancel: CancellationToken,
) -> Result<Option<JoinHandle<()>>> {
    let Some(raw_addr) = listen_address else {
        return Ok(None);
    };
    let gates = Gates {
        healthz: env_enabled("MCPD_HEALTHZ_ENABLED"),
        metrics: env_enabled("MCPD_METRICS_ENABLED"),
    };
    if !gates.healthz && !gates.metrics {
        return Ok(None);
    }

    let addr: SocketAddr = raw_addr
        .parse()
        .with_context(|| format!("invalid observability address '{raw_addr}'"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind observability endpoint at {addr}"))?;
    let local = listener.local_addr().context("observability local addr")?;
    tracing::info!(addr = %local, healthz = gates.healthz, metrics = gates.metrics, "observability listening");

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state((control, gates));

    let task = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            tracing::warn!(error = %error, "observability server stopped with error");
        }
    });
    Ok(Some(task))
}

async fn healthz(
    State((control, gates)): State<(Arc<ControlPlane>, Gates)>,
) -> impl IntoResponse {
    if !gates.healthz {
        return (StatusCode::NOT_FOUND, String::new()).into_response();
    }
    axum::Json(control.info()).into_response()
}

async fn metrics(
    State((control, gates)): State<(Arc<ControlPlane>, Gates)>,
) -> impl IntoResponse {
    if !gates.metrics {
        return (StatusCode::NOT_FOUND, String::new()).into_response();
    }
    (StatusCode::OK, control.render_metrics().await).into_response()
}
