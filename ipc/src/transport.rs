//! Same-host delivery over Unix domain sockets, one socket per endpoint name.

use crate::codec::{self, read_frame, write_frame};
use crate::errors::{IpcError, IpcResult};
use crate::handlers::HandlerTable;
use crate::message::Message;
use forge_core::{Shutdown, ShutdownListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Rejects names that cannot be used as a socket file name.
pub fn validate_endpoint_name(name: &str) -> IpcResult<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(IpcError::InvalidEndpointName(name.to_string()))
    }
}

/// Socket path for an endpoint name
pub fn endpoint_path(socket_dir: &Path, name: &str) -> IpcResult<PathBuf> {
    validate_endpoint_name(name)?;
    Ok(socket_dir.join(format!("{name}.sock")))
}

/// Receive side of an endpoint: an accept loop that hands each connection to its own task.
#[derive(Debug)]
pub struct ChannelServer {
    name: String,
    path: PathBuf,
    shutdown: Shutdown,
    task: JoinHandle<()>,
}

impl ChannelServer {
    /// Binds `<socket_dir>/<name>.sock` and starts accepting. Must be called inside a Tokio runtime.
    pub fn open(
        name: &str,
        socket_dir: &Path,
        handlers: Arc<HandlerTable>,
        max_frame_bytes: usize,
    ) -> IpcResult<Self> {
        let path = endpoint_path(socket_dir, name)?;
        std::fs::create_dir_all(socket_dir)?;

        // A socket someone still listens on belongs to a live endpoint; only stale files go.
        if path.exists() {
            if std::os::unix::net::UnixStream::connect(&path).is_ok() {
                return Err(IpcError::EndpointInUse(name.to_string()));
            }
            warn!(path = %path.display(), "Removing stale endpoint socket");
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        info!(endpoint = name, path = %path.display(), "Opened channel endpoint");

        let shutdown = Shutdown::new();
        let task = tokio::spawn(accept_loop(
            listener,
            name.to_string(),
            handlers,
            max_frame_bytes,
            shutdown.subscribe(),
        ));

        Ok(Self {
            name: name.to_string(),
            path,
            shutdown,
            task,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops the accept loop and releases the socket. Connections already accepted finish on
    /// their own.
    pub fn dispose(&self) {
        if self.shutdown.is_triggered() {
            return;
        }
        self.shutdown.trigger();
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(endpoint = %self.name, error = %e, "Failed to remove endpoint socket");
            }
        }
        debug!(endpoint = %self.name, "Disposed channel endpoint");
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn accept_loop(
    listener: UnixListener,
    name: String,
    handlers: Arc<HandlerTable>,
    max_frame_bytes: usize,
    mut shutdown: ShutdownListener,
) {
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    debug!(endpoint = %name, "Accepted new IPC connection");
                    let handlers = Arc::clone(&handlers);
                    let name = name.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, &name, &handlers, max_frame_bytes).await;
                    });
                }
                Err(e) => {
                    warn!(endpoint = %name, error = %e, "Failed to accept IPC connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
    debug!(endpoint = %name, "Accept loop stopped");
}

#[instrument(skip(stream, handlers), name = "ipc_connection")]
async fn handle_connection(
    mut stream: UnixStream,
    endpoint: &str,
    handlers: &HandlerTable,
    max_frame_bytes: usize,
) {
    loop {
        let frame = match read_frame(&mut stream, max_frame_bytes).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Dropping IPC connection");
                break;
            }
        };

        let message = match codec::decode(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, len = frame.len(), "Dropping malformed IPC message");
                continue;
            }
        };

        if message.to != endpoint {
            debug!(to = %message.to, "Message addressed to another endpoint, dispatching anyway");
        }
        let invoked = handlers.dispatch(&message);
        debug!(
            from = %message.from,
            kind = ?message.kind,
            body = %message.body,
            invoked,
            "Dispatched IPC message"
        );
    }
}

/// Opens a short-lived connection to `message.to`, writes one frame and closes.
pub async fn send(socket_dir: &Path, message: &Message, connect_timeout: Duration) -> IpcResult<()> {
    let path = endpoint_path(socket_dir, &message.to)?;
    let delivery_failed = |reason: String| IpcError::DeliveryFailed {
        to: message.to.clone(),
        reason,
    };

    let mut stream = match tokio::time::timeout(connect_timeout, UnixStream::connect(&path)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(delivery_failed(e.to_string())),
        Err(_) => {
            return Err(delivery_failed(format!(
                "connect timed out after {connect_timeout:?}"
            )))
        }
    };

    write_frame(&mut stream, message)
        .await
        .map_err(|e| delivery_failed(e.to_string()))?;
    if let Err(e) = stream.shutdown().await {
        error!(to = %message.to, error = %e, "Failed to close IPC connection");
    }
    Ok(())
}
