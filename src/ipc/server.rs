// IPC Server - Listens for client connections and handles requests

use crate::error::{Result, ShepherdError};
use crate::ipc::{Command, Request, Response, ResponseData, DEFAULT_SOCKET_PATH};
use std::future::Future;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for open connections to finish
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// IPC server for handling client connections
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    /// Inode of the socket file this server bound
    bound_inode: Option<u64>,
}

impl IpcServer {
    /// Create a new IPC server with the default socket path
    pub fn new() -> Self {
        Self::with_socket_path(DEFAULT_SOCKET_PATH)
    }

    /// Create a new IPC server with a custom socket path
    pub fn with_socket_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            listener: None,
            bound_inode: None,
        }
    }

    /// Bind to the Unix socket. Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        self.remove_stale_socket()?;

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| ShepherdError::IpcError(format!("Failed to bind to socket: {}", e)))?;

        // Only the owner may talk to the daemon
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, permissions).map_err(|e| {
                ShepherdError::IpcError(format!("Failed to set socket permissions: {}", e))
            })?;
        }

        self.bound_inode = std::fs::symlink_metadata(&self.socket_path)
            .ok()
            .map(|meta| meta.ino());

        info!(socket = %self.socket_path.display(), "IPC server listening");
        self.listener = Some(listener);
        Ok(())
    }

    /// Remove a socket file left by a daemon that is gone. Fails when a
    /// daemon still answers on it.
    fn remove_stale_socket(&self) -> Result<()> {
        match std::os::unix::net::UnixStream::connect(&self.socket_path) {
            Ok(_) => Err(ShepherdError::DaemonAlreadyRunning(
                self.socket_path.display().to_string(),
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                warn!(socket = %self.socket_path.display(), "Removing stale socket");
                std::fs::remove_file(&self.socket_path).map_err(|e| {
                    ShepherdError::IpcError(format!("Failed to remove existing socket: {}", e))
                })
            }
            Err(e) => Err(ShepherdError::IpcError(format!(
                "Failed to check existing socket {}: {}",
                self.socket_path.display(),
                e
            ))),
        }
    }

    /// Serve connections until `shutdown` resolves.
    ///
    /// Each connection runs on its own task, so a slow command never
    /// blocks `status` requests from other clients.
    pub async fn run<F, Fut, S>(&self, handler: F, shutdown: S) -> Result<()>
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseData>> + Send + 'static,
        S: Future<Output = ()>,
    {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| ShepherdError::IpcError("Server not started".to_string()))?;
        let handler = Arc::new(handler);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _addr)) => stream,
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    let handler = Arc::clone(&handler);
                    connections.spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, handler).await {
                            warn!(error = %e, "Connection ended with an error");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = &mut shutdown => break,
            }
        }

        info!(connections = connections.len(), "IPC server shutting down");

        // Let in-flight responses reach their clients; the rest are aborted
        // when the set is dropped
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("Dropping connections still open after shutdown");
        }
        Ok(())
    }

    /// Answer newline-delimited requests until the client hangs up
    async fn handle_connection<F, Fut>(stream: UnixStream, handler: Arc<F>) -> Result<()>
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseData>> + Send + 'static,
    {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| ShepherdError::IpcError(format!("Failed to read request: {}", e)))?
        {
            if line.trim().is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<Request>(&line) {
                Ok(request) => {
                    debug!(id = request.id, command = ?request.command, "Handling request");
                    match handler(request.command).await {
                        Ok(data) => Response::success(request.id, data),
                        Err(e) => Response::error(request.id, e.to_string()),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Received a malformed request");
                    Response::error(0, format!("Failed to deserialize request: {}", e))
                }
            };

            let mut response_json = serde_json::to_string(&response).map_err(|e| {
                ShepherdError::SerializationError(format!("Failed to serialize response: {}", e))
            })?;
            response_json.push('\n');

            write_half
                .write_all(response_json.as_bytes())
                .await
                .map_err(|e| ShepherdError::IpcError(format!("Failed to write response: {}", e)))?;
            write_half
                .flush()
                .await
                .map_err(|e| ShepherdError::IpcError(format!("Failed to flush stream: {}", e)))?;
        }

        Ok(())
    }

    /// Stop the server and clean up the socket file
    pub fn stop(&mut self) -> Result<()> {
        if self.listener.take().is_none() {
            return Ok(());
        }

        // Leave the file alone if it is no longer the socket we bound
        match std::fs::symlink_metadata(&self.socket_path) {
            Ok(meta) if Some(meta.ino()) == self.bound_inode => {
                std::fs::remove_file(&self.socket_path).map_err(|e| {
                    ShepherdError::IpcError(format!("Failed to remove socket file: {}", e))
                })?;
            }
            Ok(_) => {
                warn!(socket = %self.socket_path.display(), "Socket was replaced, not removing it");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ShepherdError::IpcError(format!(
                    "Failed to inspect socket file: {}",
                    e
                )))
            }
        }

        Ok(())
    }

    /// Get the socket path being used
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Default for IpcServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
