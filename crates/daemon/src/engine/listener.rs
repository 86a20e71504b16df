//! TCP accept loop.
//!
//! The listener expects the secure transport to be terminated in front of
//! it; each accepted stream carries the authentication exchange directly.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::connection::serve_connection;
use super::EngineContext;
use crate::devices::DeviceDirectory;

/// Accepts connections and serves each on its own task.
pub struct Listener {
    listener: TcpListener,
    max_connections: usize,
}

impl Listener {
    /// Bind to `addr`.
    pub async fn bind(addr: SocketAddr, max_connections: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            max_connections,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled, then wait for every
    /// connection to finish its teardown.
    pub async fn run<D: DeviceDirectory>(
        self,
        context: Arc<EngineContext<D>>,
        shutdown: CancellationToken,
    ) {
        let slots = Arc::new(Semaphore::new(self.max_connections));
        let tracker = TaskTracker::new();

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Listener received shutdown signal");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let Ok(slot) = Arc::clone(&slots).try_acquire_owned() else {
                tracing::warn!(
                    peer = %peer,
                    max_connections = self.max_connections,
                    "Connection limit reached, dropping connection"
                );
                drop(stream);
                continue;
            };

            let context = Arc::clone(&context);
            let shutdown = shutdown.clone();
            tracker.spawn(async move {
                handle_stream(stream, peer, context, shutdown).await;
                drop(slot);
            });
        }

        tracker.close();
        tracker.wait().await;
        tracing::info!("All connections closed");
    }
}

async fn handle_stream<D: DeviceDirectory>(
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<EngineContext<D>>,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }
    tracing::debug!(peer = %peer, "Accepted connection");

    match serve_connection(stream, context, peer.to_string(), shutdown).await {
        Ok(summary) => {
            tracing::debug!(peer = %peer, requests = summary.requests, "Connection finished");
        }
        Err(e) if e.is_disconnect() => {
            tracing::debug!(peer = %peer, error = %e, "Peer disconnected");
        }
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "Connection failed");
        }
    }
}
