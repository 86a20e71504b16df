//! Device directory abstraction.
//!
//! The directory maps device identifiers to their access tokens. The
//! protocol engine only ever reads from it.

use std::fmt;

use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while querying or administering the directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The backing store cannot be reached.
    #[error("device directory unavailable: {0}")]
    Unavailable(String),

    /// The backing store reported an error.
    #[error("device directory storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A device name failed validation.
    #[error("invalid device name: {0}")]
    InvalidName(String),
}

/// A device as stored in the directory.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Device identifier.
    pub identifier: Uuid,
    /// Human-readable device name.
    pub name: String,
    /// Stored access token, compared byte for byte.
    pub access_token: String,
}

impl fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("identifier", &self.identifier)
            .field("name", &self.name)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// A freshly issued device credential.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DeviceCredential {
    /// Device identifier (the authentication user name).
    pub device_id: Uuid,
    /// Access token (the authentication password).
    pub access_token: Uuid,
}

impl fmt::Debug for DeviceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredential")
            .field("device_id", &self.device_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

impl DeviceCredential {
    /// Issue a random identifier and token.
    pub fn generate() -> Self {
        Self {
            device_id: Uuid::new_v4(),
            access_token: Uuid::new_v4(),
        }
    }
}

/// Read access to device records.
///
/// Lookups are synchronous; async callers run them on the blocking pool.
pub trait DeviceDirectory: Send + Sync + 'static {
    /// Find a device by identifier. A missing device is `Ok(None)`.
    fn lookup(&self, identifier: &Uuid) -> Result<Option<DeviceRecord>, DirectoryError>;
}

/// Validate a device name: 3 to 15 characters of `[A-Za-z0-9 ]`.
pub fn validate_device_name(name: &str) -> Result<(), DirectoryError> {
    let len = name.chars().count();
    if !(3..=15).contains(&len) {
        return Err(DirectoryError::InvalidName(format!(
            "must be 3 to 15 characters, got {len}"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == ' '))
    {
        return Err(DirectoryError::InvalidName(format!(
            "character {bad:?} is not allowed"
        )));
    }
    Ok(())
}

/// In-memory directory, used by tests and embedders.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    devices: DashMap<Uuid, DeviceRecord>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub fn insert(&self, record: DeviceRecord) {
        self.devices.insert(record.identifier, record);
    }

    /// Register a device with a generated credential.
    pub fn register(&self, name: &str) -> Result<DeviceCredential, DirectoryError> {
        validate_device_name(name)?;
        let credential = DeviceCredential::generate();
        self.insert(DeviceRecord {
            identifier: credential.device_id,
            name: name.to_string(),
            access_token: credential.access_token.to_string(),
        });
        Ok(credential)
    }

    /// Remove a device. Returns whether it existed.
    pub fn remove(&self, identifier: &Uuid) -> bool {
        self.devices.remove(identifier).is_some()
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no devices are registered.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceDirectory for MemoryDirectory {
    fn lookup(&self, identifier: &Uuid) -> Result<Option<DeviceRecord>, DirectoryError> {
        Ok(self.devices.get(identifier).map(|entry| entry.value().clone()))
    }
}
