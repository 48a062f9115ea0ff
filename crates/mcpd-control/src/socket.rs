//! The Unix-socket endpoint of the control plane.
//!
//! The file mode comes from `runtime.rpc.socketMode` and is applied after
//! listen; a leftover socket from a crashed host is unlinked and the path
//! reclaimed. The socket file is the only filesystem artifact the host
//! leaves, and [`ControlSocket::close`] removes it on clean shutdown.

#[cfg(not(unix))]
compile_error!("mcpd requires Unix domain sockets; Windows is not supported");

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// A bound control socket. Owns the listener and the path it must unlink.
pub(crate) struct ControlSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlSocket {
    /// Binds at `path` with the catalog's `socketMode` bits.
    pub(crate) async fn bind(path: &Path, mode: u32) -> Result<Self> {
        prepare_parent(path).await?;
        reclaim_path(path).await?;

        let listener = UnixListener::bind(path)
            .with_context(|| format!("control socket bind at {}", path.display()))?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .with_context(|| {
                format!(
                    "applying rpc.socketMode {mode:o} to {}",
                    path.display()
                )
            })?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub(crate) async fn accept(&self) -> std::io::Result<UnixStream> {
        self.listener.accept().await.map(|(stream, _)| stream)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Shuts the listener and unlinks the socket file.
    pub(crate) async fn close(self) {
        let ControlSocket { listener, path } = self;
        drop(listener);
        if let Err(error) = tokio::fs::remove_file(&path).await {
            if error.kind() != ErrorKind::NotFound {
                tracing::warn!(
                    socket = %path.display(),
                    error = %error,
                    "control socket was not removed"
                );
            }
        }
    }
}

/// Makes sure the socket's directory exists. A directory this call creates
/// is restricted to the owning user; a pre-existing one (a custom
/// `rpc.listenAddress` pointing somewhere shared) keeps whatever mode it
/// already has.
async fn prepare_parent(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if tokio::fs::metadata(parent).await.is_ok() {
        return Ok(());
    }
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("control socket directory {}", parent.display()))?;
    tokio::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
        .await
        .with_context(|| format!("restricting {}", parent.display()))
}

/// Unlinks whatever currently sits at the socket path. A missing file is
/// the normal case; anything else that cannot be removed blocks the bind.
async fn reclaim_path(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!(socket = %path.display(), "reclaimed stale control socket");
            Ok(())
        }
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error)
            .with_context(|| format!("reclaiming control socket path {}", path.display())),
    }
}

/// One-shot control request; used by the CLI subcommands.
pub async fn send_control_request(
    socket_path: &Path,
    method: &str,
    params: Value,
) -> Result<Value> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("no control socket at {}", socket_path.display()))?;
    let request = json!({
        "id": 1,
        "method": method,
        "params": params,
        "caller": {
            "id": format!("cli-{}", std::process::id()),
            "pid": std::process::id(),
            "tags": ["cli"],
        },
    });

    let payload = serde_json::to_string(&request).context("failed to serialize control request")?;
    stream
        .write_all(payload.as_bytes())
        .await
        .context("failed to write control request")?;
    stream
        .write_all(b"\n")
        .await
        .context("failed to write control request delimiter")?;
    stream
        .flush()
        .await
        .context("failed to flush control request")?;

    let mut line = String::new();
    let mut reader = BufReader::new(stream);
    let bytes = reader
        .read_line(&mut line)
        .await
        .context("failed to read control response")?;
    if bytes == 0 {
        bail!("mcpd closed the connection before responding");
    }

    serde_json::from_str(line.trim()).context("failed to parse control response")
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use anyhow::Result;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::ControlSocket;

    #[tokio::test]
    async fn request_round_trip_over_the_control_socket() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("control.sock");
        let socket = ControlSocket::bind(&socket_path, 0o600).await?;

        let server = tokio::spawn(async move {
            let stream = socket.accept().await.expect("accept client");
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.expect("read request");
            let request: serde_json::Value =
                serde_json::from_str(line.trim()).expect("parse request");
            assert_eq!(request["method"], "host/info");
            write_half
                .write_all(b"{\"id\":1,\"result\":{\"name\":\"mcpd\"}}\n")
                .await
                .expect("write response");
            socket.close().await;
        });

        let response =
            super::send_control_request(&socket_path, "host/info", json!({})).await?;
        assert_eq!(response["result"]["name"], "mcpd");

        server.await?;
        assert!(!socket_path.exists(), "close unlinks the socket file");
        Ok(())
    }

    #[tokio::test]
    async fn socket_mode_comes_from_the_configured_literal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("nested").join("control.sock");
        let _socket = ControlSocket::bind(&socket_path, 0o660).await?;

        let socket_mode = std::fs::metadata(&socket_path)?.permissions().mode() & 0o777;
        assert_eq!(socket_mode, 0o660);

        // The directory the bind created is private to the user.
        let parent_mode = std::fs::metadata(socket_path.parent().unwrap())?
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(parent_mode, 0o700);
        Ok(())
    }

    #[tokio::test]
    async fn pre_existing_directory_keeps_its_own_mode() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let shared = dir.path().join("shared");
        std::fs::create_dir(&shared)?;
        std::fs::set_permissions(&shared, std::fs::Permissions::from_mode(0o755))?;

        let _socket = ControlSocket::bind(&shared.join("control.sock"), 0o600).await?;

        let mode = std::fs::metadata(&shared)?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
        Ok(())
    }

    #[tokio::test]
    async fn stale_socket_file_is_reclaimed_on_bind() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("control.sock");

        // A crashed host leaves the file behind; a new bind must succeed.
        let first = ControlSocket::bind(&socket_path, 0o600).await?;
        drop(first.listener);

        let second = ControlSocket::bind(&socket_path, 0o600).await?;
        assert_eq!(second.path(), socket_path.as_path());
        second.close().await;
        Ok(())
    }
}
