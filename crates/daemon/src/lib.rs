//! # Depot Daemon Library
//!
//! Per-device file storage served over SFTP.
//!
//! ## Overview
//!
//! Each device authenticates with its identifier and access token, then
//! opens, reads, writes and closes files inside its own directory:
//!
//! - **Device Directory**: credential records, in SQLite or in memory
//! - **Path Sandbox**: confines every requested path to the device root
//! - **Sessions**: per-connection handle tables, torn down with the connection
//! - **Protocol Engine**: authentication, version negotiation and pipelined
//!   request dispatch
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        DepotServer                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────┐      ┌───────────────────────────┐  │
//! │  │      Listener      │────> │   Connection (per peer)   │  │
//! │  └────────────────────┘      │  auth ─> Session ─> files │  │
//! │                              └───────────────────────────┘  │
//! │  ┌────────────────────┐      ┌───────────────────────────┐  │
//! │  │ CredentialVerifier │      │       Path Sandbox        │  │
//! │  │ (DeviceDirectory)  │      │  <root>/<device id>/...   │  │
//! │  └────────────────────┘      └───────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use daemon::{Config, DepotServer, SqliteDirectory};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let directory = Arc::new(SqliteDirectory::open(&config.directory.database_path)?);
//!
//!     let mut server = DepotServer::new(config, directory)?;
//!     server.start().await?;
//!
//!     // Wait for shutdown signal...
//!
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`files`]: Path confinement and device storage layout
//! - [`devices`]: Device directory and credential verification
//! - [`session`]: Connection state machine, handle table and file session
//! - [`engine`]: Listener and per-connection protocol driver
//! - [`server`]: Server lifecycle and events

pub mod config;
pub mod devices;
pub mod engine;
pub mod files;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export device types for convenience
pub use devices::{
    CredentialVerifier, DeviceCredential, DeviceDirectory, DeviceRecord, DirectoryError,
    MemoryDirectory, SqliteDirectory,
};

// Re-export file types for convenience
pub use files::{confine, ConfinedPath, SandboxViolation};

// Re-export session types for convenience
pub use session::{ConnectionState, HandleTable, Session, SessionError, SessionLimits};

// Re-export engine types for convenience
pub use engine::{serve_connection, ConnectionSummary, EngineContext, EngineError, EngineSettings};

// Re-export server types for convenience
pub use server::{DepotServer, ServerEvent, ServerState};
