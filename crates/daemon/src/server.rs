//! Depot server lifecycle.
//!
//! This module provides the `DepotServer` that prepares the storage root,
//! binds the listener and coordinates graceful shutdown of every connection.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::devices::{CredentialVerifier, DeviceDirectory};
use crate::engine::{EngineContext, EngineSettings, Listener};

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Initial state, not started.
    Stopped,
    /// Binding the listener.
    Starting,
    /// Accepting connections.
    Running,
    /// Draining connections.
    ShuttingDown,
}

/// Events emitted by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Server state changed.
    StateChanged(ServerState),
    /// A device authenticated.
    DeviceConnected { device_id: Uuid, peer: String },
    /// An authenticated device's connection ended.
    DeviceDisconnected { device_id: Uuid, reason: String },
    /// A connection presented a credential that was refused.
    AuthenticationRejected { peer: String },
}

/// Depot server that owns the listener and shared connection state.
pub struct DepotServer<D: DeviceDirectory> {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<ServerState>>,
    /// Shared state handed to connections.
    context: Arc<EngineContext<D>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<ServerEvent>,
    /// Listener task, present while running.
    listener_task: Option<JoinHandle<()>>,
    /// Bound address, present while running.
    local_addr: Option<SocketAddr>,
}

impl<D: DeviceDirectory> DepotServer<D> {
    /// Creates a new server over the given device directory.
    ///
    /// A relative storage root is resolved against the working directory.
    pub fn new(config: Config, directory: Arc<D>) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let storage_root = std::path::absolute(&config.storage.root).with_context(|| {
            format!(
                "Failed to resolve storage root: {}",
                config.storage.root.display()
            )
        })?;

        let (event_tx, _) = broadcast::channel(256);
        let settings = EngineSettings::from_config(&config, storage_root);
        let context = Arc::new(EngineContext::new(
            CredentialVerifier::new(directory),
            settings,
            event_tx.clone(),
        ));

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(ServerState::Stopped)),
            context,
            shutdown_token: CancellationToken::new(),
            event_tx,
            listener_task: None,
            local_addr: None,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Returns a receiver for server events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    /// The absolute storage root.
    pub fn storage_root(&self) -> &PathBuf {
        &self.context.settings.storage_root
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Starts accepting connections. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        {
            let mut state = self.state.write().await;
            if *state != ServerState::Stopped {
                anyhow::bail!("Server is already running");
            }
            *state = ServerState::Starting;
        }
        self.emit_event(ServerEvent::StateChanged(ServerState::Starting));

        info!("Starting depot server...");

        match self.bind().await {
            Ok(addr) => {
                *self.state.write().await = ServerState::Running;
                self.emit_event(ServerEvent::StateChanged(ServerState::Running));
                info!(addr = %addr, root = %self.storage_root().display(), "Depot server listening");
                Ok(addr)
            }
            Err(e) => {
                *self.state.write().await = ServerState::Stopped;
                self.emit_event(ServerEvent::StateChanged(ServerState::Stopped));
                Err(e)
            }
        }
    }

    async fn bind(&mut self) -> Result<SocketAddr> {
        let root = self.storage_root().clone();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create storage root: {}", root.display()))?;

        let addr = self.config.listen_addr()?;
        let listener = Listener::bind(addr, self.config.server.max_connections)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        let local_addr = listener.local_addr()?;

        // A fresh token per run allows restarting after stop().
        self.shutdown_token = CancellationToken::new();
        let context = Arc::clone(&self.context);
        let shutdown = self.shutdown_token.clone();
        self.listener_task = Some(tokio::spawn(listener.run(context, shutdown)));
        self.local_addr = Some(local_addr);

        Ok(local_addr)
    }

    /// Stops accepting connections and waits for every connection to close
    /// its handles.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != ServerState::Running {
                return Ok(());
            }
            *state = ServerState::ShuttingDown;
        }
        self.emit_event(ServerEvent::StateChanged(ServerState::ShuttingDown));

        info!("Stopping depot server...");
        self.shutdown_token.cancel();

        if let Some(task) = self.listener_task.take() {
            if let Err(e) = task.await {
                warn!("Listener task ended abnormally: {}", e);
            }
        }
        self.local_addr = None;

        *self.state.write().await = ServerState::Stopped;
        self.emit_event(ServerEvent::StateChanged(ServerState::Stopped));

        info!("Depot server stopped");
        Ok(())
    }

    /// Emits a server event.
    fn emit_event(&self, event: ServerEvent) {
        let _ = self.event_tx.send(event);
    }
}
