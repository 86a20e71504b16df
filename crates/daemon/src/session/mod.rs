//! Per-connection session state.
//!
//! This module provides the connection state machine, the handle table and
//! the authenticated [`Session`] that serves file requests. Each session owns
//! its handle table; nothing here is shared between connections.

pub mod dispatch;
pub mod handles;
pub mod state;

pub use dispatch::{Session, SessionError, SessionLimits};
pub use handles::{HandleTable, OpenFile, OpenMode};
pub use state::{ConnectionState, InvalidTransition, StateMachine};
