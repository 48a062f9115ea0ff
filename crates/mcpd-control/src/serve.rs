//! Host bootstrap and the control-socket accept loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;

use mcpd_core::{BootstrapMode, Catalog, LogBus, RpcAddr};
use mcpd_index::IndexSet;
use mcpd_pool::{Scheduler, SchedulerConfig};
use mcpd_router::Router;
use mcpd_transport::TransportContext;

use crate::plane::ControlPlane;
use crate::socket::ControlSocket;
use crate::{observe, rpc};

const MAX_CONNECTIONS: usize = 64;

#[derive(Debug, Clone)]
pub struct HostOptions {
    pub catalog_path: PathBuf,
    pub socket_override: Option<PathBuf>,
}

/// The pid file sits next to the socket, swapping the `.sock` suffix.
fn pid_file_beside(socket_path: &Path) -> PathBuf {
    socket_path.with_extension("pid")
}

/// Brings the whole host up and serves the control plane until a stop
/// signal (SIGINT or `host/stop`) arrives, then drains everything.
pub async fn run_host(options: HostOptions) -> Result<()> {
    let catalog = mcpd_config::load_catalog(&options.catalog_path)
        .with_context(|| format!("loading catalog {}", options.catalog_path.display()))?;

    let logs = Arc::new(LogBus::new());
    let (list_changed_tx, list_changed_rx) = tokio::sync::mpsc::unbounded_channel();
    let transport = TransportContext {
        logs: Arc::clone(&logs),
        list_changed_tx,
    };

    let scheduler = Scheduler::new(SchedulerConfig::from_runtime(&catalog.runtime), transport);
    scheduler.reconcile(&catalog).await;

    let cancel = CancellationToken::new();
    let indices = IndexSet::new(Arc::clone(&scheduler));
    indices.reconfigure(&catalog);
    let worker_handles =
        indices.spawn_workers(catalog.runtime.tool_refresh_concurrency, cancel.clone());
    let pump_handle = indices.spawn_event_pump(list_changed_rx, cancel.clone());
    let timer_handle = indices.spawn_refresh_timer(cancel.clone());
    if catalog.runtime.bootstrap == BootstrapMode::Eager {
        indices.refresh_all();
    }
    let maintenance_handle = scheduler.spawn_maintenance(cancel.clone());

    let router = Router::new(Arc::clone(&scheduler), Arc::clone(&indices));
    router.reconfigure(&catalog);
    let control = Arc::new(ControlPlane::new(
        Arc::clone(&scheduler),
        Arc::clone(&indices),
        router,
        Arc::clone(&logs),
        catalog.clone(),
        options.catalog_path.clone(),
    ));

    spawn_caller_pruner(Arc::clone(&control), &catalog, cancel.clone());
    let observability = observe::spawn_observability(
        catalog.runtime.observability.listen_address.as_deref(),
        Arc::clone(&control),
        cancel.clone(),
    )
    .await?;

    let rpc_addr = resolve_rpc_addr(&options, &catalog)?;
    let socket_mode = catalog.runtime.rpc.socket_mode_bits()?;
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let connection_slots = Arc::new(Semaphore::new(MAX_CONNECTIONS));

    let endpoint = match &rpc_addr {
        RpcAddr::Unix(path) => {
            let socket = ControlSocket::bind(path, socket_mode).await?;
            tracing::info!(socket = %path.display(), "mcpd control plane listening");
            println!("mcpd listening on unix://{}", path.display());
            Endpoint::Unix(socket)
        }
        RpcAddr::Tcp(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind control endpoint at {addr}"))?;
            tracing::info!(addr = %addr, "mcpd control plane listening");
            println!("mcpd listening on tcp://{addr}");
            Endpoint::Tcp(listener)
        }
    };

    let pid_path = match &endpoint {
        Endpoint::Unix(socket) => {
            let pid_path = pid_file_beside(socket.path());
            write_pid_file(&pid_path).await?;
            Some(pid_path)
        }
        Endpoint::Tcp(_) => None,
    };

    accept_loop(
        &endpoint,
        Arc::clone(&control),
        shutdown_tx,
        &mut shutdown_rx,
        connection_slots,
        cancel.clone(),
    )
    .await?;

    if let Some(pid_path) = pid_path {
        cleanup_pid_file(&pid_path).await?;
    }
    if let Endpoint::Unix(socket) = endpoint {
        socket.close().await;
    }

    // Shutdown: stop refresh/maintenance work, then drain all pools.
    cancel.cancel();
    scheduler.stop_all().await;
    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = pump_handle.await;
    let _ = timer_handle.await;
    let _ = maintenance_handle.await;
    if let Some(handle) = observability {
        let _ = handle.await;
    }
    Ok(())
}

fn resolve_rpc_addr(options: &HostOptions, catalog: &Catalog) -> Result<RpcAddr> {
    if let Some(path) = &options.socket_override {
        return Ok(RpcAddr::Unix(path.clone()));
    }
    Ok(catalog.runtime.rpc.resolve_addr()?)
}

enum Endpoint {
    Unix(ControlSocket),
    Tcp(tokio::net::TcpListener),
}

async fn accept_loop(
    endpoint: &Endpoint,
    control: Arc<ControlPlane>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: &mut watch::Receiver<bool>,
    connection_slots: Arc<Semaphore>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let _ = shutdown_tx.send(true);
            }
            changed = shutdown_rx.changed() => {
                if changed.is_ok() && *shutdown_rx.borrow() {
                    return Ok(());
                }
            }
            accepted = accept_one(endpoint) => {
                let stream = accepted.context("failed to accept control client")?;
                let Ok(permit) = Arc::clone(&connection_slots).try_acquire_owned() else {
                    tracing::warn!(
                        max_connections = MAX_CONNECTIONS,
                        "rejecting control connection: limit reached"
                    );
                    continue;
                };
                let control = Arc::clone(&control);
                let shutdown_tx = shutdown_tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let result = match stream {
                        AcceptedStream::Unix(s) => {
                            rpc::handle_connection(s, control, shutdown_tx, cancel).await
                        }
                        AcceptedStream::Tcp(s) => {
                            rpc::handle_connection(s, control, shutdown_tx, cancel).await
                        }
                    };
                    if let Err(error) = result {
                        tracing::debug!(error = %error, "control connection ended with error");
                    }
                });
            }
        }
    }
}

enum AcceptedStream {
    Unix(tokio::net::UnixStream),
    Tcp(tokio::net::TcpStream),
}

async fn accept_one(endpoint: &Endpoint) -> std::io::Result<AcceptedStream> {
    match endpoint {
        Endpoint::Unix(socket) => socket.accept().await.map(AcceptedStream::Unix),
        Endpoint::Tcp(listener) => listener
            .accept()
            .await
            .map(|(stream, _)| AcceptedStream::Tcp(stream)),
    }
}

fn spawn_caller_pruner(control: Arc<ControlPlane>, catalog: &Catalog, cancel: CancellationToken) {
    let check_every = Duration::from_secs(catalog.runtime.client_check_seconds.max(1));
    let inactive_after = Duration::from_secs(catalog.runtime.client_inactive_seconds.max(1));
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(check_every) => {
                    let removed = control.prune_callers(inactive_after);
                    if removed > 0 {
                        tracing::debug!(removed, "pruned inactive callers");
                    }
                }
            }
        }
    });
}

/// Records the host pid beside the socket. The socket bind already created
/// the directory, so this is a plain write.
async fn write_pid_file(pid_path: &Path) -> Result<()> {
    tokio::fs::write(pid_path, format!("{}\n", std::process::id()))
        .await
        .with_context(|| format!("recording host pid at {}", pid_path.display()))
}

async fn cleanup_pid_file(pid_path: &Path) -> Result<()> {
    match tokio::fs::remove_file(pid_path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => {
            Err(error).with_context(|| format!("removing pid file {}", pid_path.display()))
        }
    }
}
