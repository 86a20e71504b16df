//! Connection state machine.
//!
//! ```text
//! Unauthenticated ──> Authenticating ──> Ready ──> Closed
//!        │                  │  ▲                     ▲
//!        │                  └──┘ (non-credential     │
//!        │                        retries)           │
//!        └──────────────────┴────────────────────────┘
//! ```
//!
//! File requests are only dispatched in `Ready`. `Closed` is terminal.

use thiserror::Error;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted; no authentication request seen yet.
    Unauthenticated,
    /// Authentication exchange in progress.
    Authenticating,
    /// Authenticated; file requests are accepted.
    Ready,
    /// Torn down; every handle has been closed.
    Closed,
}

impl ConnectionState {
    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Unauthenticated, Authenticating)
                | (Authenticating, Authenticating)
                | (Authenticating, Ready)
                | (Unauthenticated | Authenticating | Ready, Closed)
        )
    }

    /// Whether file requests may be dispatched.
    pub fn accepts_requests(self) -> bool {
        self == ConnectionState::Ready
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Unauthenticated => "unauthenticated",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// An illegal state change was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid connection state transition from {from} to {to}")]
pub struct InvalidTransition {
    /// State before the attempted change.
    pub from: ConnectionState,
    /// Requested state.
    pub to: ConnectionState,
}

/// Tracks one connection's state and enforces legal transitions.
#[derive(Debug)]
pub struct StateMachine {
    state: ConnectionState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Start in `Unauthenticated`.
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Unauthenticated,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`, or fail without changing state.
    pub fn transition(&mut self, next: ConnectionState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::trace!(from = %self.state, to = %next, "Connection state change");
        self.state = next;
        Ok(())
    }

    /// Enter `Closed` from any state. Returns whether the state changed.
    pub fn close(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        self.state = ConnectionState::Closed;
        true
    }
}
