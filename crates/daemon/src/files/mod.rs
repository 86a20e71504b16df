//! Device storage layout.
//!
//! Each device owns `<storage root>/<device id>/`. Paths supplied by a peer
//! are confined beneath that directory before any filesystem call.
//!
//! # Security
//!
//! Confinement is lexical: `.` and `..` are resolved without touching the
//! filesystem, and the result must remain under the root component by
//! component.

pub mod sandbox;

pub use sandbox::{confine, ensure_device_root, ConfinedPath, DeviceRootError, SandboxViolation};
