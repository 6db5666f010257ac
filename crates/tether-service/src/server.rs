use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tether_core::ipc::ControlHandler;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Control socket: local-only Unix domain socket, owner read/write only. One
/// task per connection.
#[cfg(unix)]
pub fn spawn_control_server(
    socket_path: PathBuf,
    handler: Arc<dyn ControlHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    use anyhow::Context;
    use std::os::unix::fs::PermissionsExt;
    use tokio::net::UnixListener;
    use tracing::{info, warn};

    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("bind control socket {}", socket_path.display()))?;
    std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
    info!(path = %socket_path.display(), "control socket listening");

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(err) = tether_core::ipc::handle_connection(stream, handler).await {
                                warn!(error = %err, "control connection error");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "control socket accept error");
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        let _ = std::fs::remove_file(&socket_path);
    });

    Ok(task)
}

#[cfg(not(unix))]
pub fn spawn_control_server(
    _socket_path: PathBuf,
    _handler: Arc<dyn ControlHandler>,
    _shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    Err(anyhow::anyhow!(
        "control server is only available on unix via UDS transport"
    ))
}
