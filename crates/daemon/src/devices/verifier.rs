//! Credential verification against the device directory.

use std::sync::Arc;

use subtle::{Choice, ConstantTimeEq};
use uuid::Uuid;

use super::directory::DeviceDirectory;

/// Verifies presented device credentials.
///
/// Every failure mode (malformed input, unknown device, wrong token,
/// directory fault) answers `None`; callers never learn which one occurred.
pub struct CredentialVerifier<D: DeviceDirectory> {
    directory: Arc<D>,
}

impl<D: DeviceDirectory> Clone for CredentialVerifier<D> {
    fn clone(&self) -> Self {
        Self {
            directory: Arc::clone(&self.directory),
        }
    }
}

impl<D: DeviceDirectory> CredentialVerifier<D> {
    /// Create a verifier over a shared directory.
    pub fn new(directory: Arc<D>) -> Self {
        Self { directory }
    }

    /// The underlying directory.
    pub fn directory(&self) -> &Arc<D> {
        &self.directory
    }

    /// Verify `username`/`password` as a device identifier and access token.
    ///
    /// Returns the authenticated device identifier on success.
    pub async fn verify(&self, username: &str, password: &str) -> Option<Uuid> {
        let Ok(device_id) = Uuid::parse_str(username) else {
            tracing::debug!("Rejecting credential: identifier is not a UUID");
            return None;
        };
        if Uuid::parse_str(password).is_err() {
            tracing::debug!(device_id = %device_id, "Rejecting credential: token is not a UUID");
            return None;
        }

        let directory = Arc::clone(&self.directory);
        let lookup = tokio::task::spawn_blocking(move || directory.lookup(&device_id)).await;

        let record = match lookup {
            Ok(Ok(Some(record))) => record,
            Ok(Ok(None)) => {
                tracing::debug!(device_id = %device_id, "Rejecting credential: unknown device");
                return None;
            }
            Ok(Err(e)) => {
                tracing::warn!(device_id = %device_id, error = %e, "Device lookup failed");
                return None;
            }
            Err(e) => {
                tracing::warn!(device_id = %device_id, error = %e, "Device lookup task failed");
                return None;
            }
        };

        if tokens_match(password.as_bytes(), record.access_token.as_bytes()) {
            Some(device_id)
        } else {
            tracing::debug!(device_id = %device_id, "Rejecting credential: token mismatch");
            None
        }
    }
}

/// Constant-time token comparison.
///
/// When lengths differ the stored token is compared against itself so the
/// work done matches a same-length mismatch, and the length check is folded
/// in without branching on the result.
pub fn tokens_match(presented: &[u8], stored: &[u8]) -> bool {
    let same_len = presented.len() == stored.len();
    let candidate = if same_len { presented } else { stored };
    let equal = candidate.ct_eq(stored) & Choice::from(same_len as u8);
    bool::from(equal)
}
