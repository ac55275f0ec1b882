//! Unix socket listener.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;
use trove_kernel::{IndexConfig, IndexHandle};

use crate::connection::{self, Shared};
use crate::constants::SOCKET_MODE;

/// The index server: one listener, one task per connection, one index.
pub struct TroveServer {
    socket_path: PathBuf,
    listener: UnixListener,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TroveServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TroveServer")
            .field("socket_path", &self.socket_path)
            .finish()
    }
}

impl TroveServer {
    /// Open the index described by `config` and bind its socket.
    pub async fn bind(config: IndexConfig) -> anyhow::Result<Self> {
        let depth = config.event_queue_depth;
        let socket_path = config.socket_path.clone();
        let index = trove_kernel::start(config).await?;
        Self::with_index(index, &socket_path, depth).await
    }

    /// Serve an already running index on `socket_path`.
    pub async fn with_index(index: IndexHandle, socket_path: &Path, event_queue_depth: usize) -> anyhow::Result<Self> {
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Remove stale socket
        if socket_path.exists() {
            tokio::fs::remove_file(socket_path).await?;
        }

        let listener = UnixListener::bind(socket_path)?;
        tokio::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE)).await?;
        tracing::info!(path = %socket_path.display(), "index socket listening");

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            listener,
            shared: Arc::new(Shared::new(index, event_queue_depth)),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn index(&self) -> &IndexHandle {
        &self.shared.index
    }

    /// Accept connections until the process is cancelled.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves, then stop the index and
    /// remove the socket file.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let shared = Arc::clone(&self.shared);
                        tokio::spawn(async move {
                            if let Err(e) = connection::serve(shared, stream).await {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                },
                () = &mut shutdown => break,
            }
        }

        tracing::info!("shutting down");
        if let Err(e) = self.shared.index.shutdown().await {
            tracing::debug!(error = %e, "index already stopped");
        }
        let _ = tokio::fs::remove_file(&self.socket_path).await;
        Ok(())
    }
}
