//! Device directory and credential verification.
//!
//! Devices authenticate with their identifier as the user name and their
//! access token as the password. This module provides the directory those
//! credentials are checked against and the verifier that checks them.

pub mod directory;
pub mod sqlite;
pub mod verifier;

pub use directory::{
    validate_device_name, DeviceCredential, DeviceDirectory, DeviceRecord, DirectoryError,
    MemoryDirectory,
};
pub use sqlite::SqliteDirectory;
pub use verifier::{tokens_match, CredentialVerifier};
