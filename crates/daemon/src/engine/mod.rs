//! Protocol engine.
//!
//! Accepts connections, drives the authentication exchange and SFTP version
//! negotiation, then feeds pipelined file requests to the connection's
//! [`Session`](crate::session::Session).
//!
//! ```text
//! TcpListener ──accept──> serve_connection
//!                           ├─ authenticate      (engine::auth)
//!                           ├─ ensure_device_root
//!                           ├─ INIT / VERSION
//!                           └─ request loop ──spawn──> Session::dispatch
//!                                   │                        │
//!                                   └──── writer task <──────┘
//! ```

pub mod auth;
pub mod connection;
pub mod listener;
pub mod transport;

use std::path::PathBuf;
use std::time::Duration;

use protocol::ProtocolError;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::devices::{CredentialVerifier, DeviceDirectory};
use crate::files::DeviceRootError;
use crate::server::ServerEvent;
use crate::session::{InvalidTransition, SessionLimits};

pub use auth::authenticate;
pub use connection::{serve_connection, ConnectionSummary};
pub use listener::Listener;
pub use transport::{PacketReader, PacketWriter};

/// Connection-fatal errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The presented credential was refused.
    #[error("authentication rejected")]
    AuthenticationRejected,

    /// Authentication and negotiation did not finish in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The device's storage directory could not be prepared.
    #[error("confinement failed: {0}")]
    ConfinementFailed(#[from] DeviceRootError),

    /// The connection tried to move to an illegal state.
    #[error(transparent)]
    InvalidState(#[from] InvalidTransition),
}

impl EngineError {
    /// Whether this is an ordinary disconnect rather than a failure.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, EngineError::Protocol(e) if e.is_disconnect())
    }
}

/// Tunables applied to every connection.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Absolute base directory for device storage.
    pub storage_root: PathBuf,
    /// Time allowed for authentication and version negotiation.
    pub handshake_timeout: Duration,
    /// Non-credential authentication requests tolerated per connection.
    pub max_auth_retries: u32,
    /// Requests processed concurrently per connection.
    pub max_inflight_requests: usize,
    /// Per-session limits.
    pub limits: SessionLimits,
}

impl EngineSettings {
    /// Derive settings from configuration with an already-absolute storage root.
    pub fn from_config(config: &Config, storage_root: PathBuf) -> Self {
        Self {
            storage_root,
            handshake_timeout: Duration::from_secs(config.server.handshake_timeout_secs),
            max_auth_retries: config.server.max_auth_retries,
            max_inflight_requests: config.server.max_inflight_requests,
            limits: SessionLimits::from(&config.storage),
        }
    }
}

/// Shared, read-only state handed to every connection.
pub struct EngineContext<D: DeviceDirectory> {
    /// Credential verifier.
    pub verifier: CredentialVerifier<D>,
    /// Connection tunables.
    pub settings: EngineSettings,
    /// Lifecycle event sink.
    pub events: broadcast::Sender<ServerEvent>,
}

impl<D: DeviceDirectory> EngineContext<D> {
    /// Bundle the shared connection state.
    pub fn new(
        verifier: CredentialVerifier<D>,
        settings: EngineSettings,
        events: broadcast::Sender<ServerEvent>,
    ) -> Self {
        Self {
            verifier,
            settings,
            events,
        }
    }

    pub(crate) fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }
}
