//! Path confinement for device storage.
//!
//! Every path a peer names is resolved through [`confine`] before it reaches
//! the filesystem. The character filter narrows what a peer may send, but the
//! containment check after lexical normalization is what keeps a device
//! inside its root.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

/// Reasons a path is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxViolation {
    /// The path contains a NUL byte.
    #[error("path contains a NUL byte")]
    NulByte,

    /// The path is empty.
    #[error("path is empty")]
    Empty,

    /// The path contains a character outside the allowed set.
    #[error("path contains disallowed character {0:?}")]
    DisallowedCharacter(char),

    /// The normalized path lies outside the root.
    #[error("path escapes its root")]
    EscapesRoot,

    /// The root itself is not an absolute path.
    #[error("root must be an absolute path")]
    InvalidRoot,
}

/// Errors preparing a device's storage directory.
#[derive(Debug, Error)]
pub enum DeviceRootError {
    /// The device identifier did not confine under the storage root.
    #[error("device root rejected: {0}")]
    Confinement(#[from] SandboxViolation),

    /// The directory could not be created.
    #[error("failed to create device root: {0}")]
    Io(#[from] std::io::Error),
}

/// An absolute path proven to lie within a root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfinedPath(PathBuf);

impl ConfinedPath {
    /// Borrow the confined path.
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Take ownership of the confined path.
    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl AsRef<Path> for ConfinedPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ConfinedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.')
}

/// Lexically resolve `.` and `..` in an absolute path.
///
/// `..` at the filesystem root stays at the root.
fn normalize(path: &Path) -> Result<PathBuf, SandboxViolation> {
    if !path.is_absolute() {
        return Err(SandboxViolation::InvalidRoot);
    }

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(segment) => out.push(segment),
        }
    }
    Ok(out)
}

/// Confine `raw` beneath `root`.
///
/// `raw` is always treated as relative to `root`, even with a leading `/`.
/// The result is normalized and guaranteed to start with the normalized root.
/// No filesystem access happens here.
pub fn confine(root: &Path, raw: &str) -> Result<ConfinedPath, SandboxViolation> {
    if raw.contains('\0') {
        return Err(SandboxViolation::NulByte);
    }
    if raw.is_empty() {
        return Err(SandboxViolation::Empty);
    }
    if let Some(bad) = raw.chars().find(|c| !is_allowed(*c)) {
        return Err(SandboxViolation::DisallowedCharacter(bad));
    }

    let root = normalize(root)?;

    let mut joined = root.clone();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                joined.pop();
            }
            name => joined.push(name),
        }
    }

    // Path::starts_with compares whole components, which also implies the
    // string-prefix property.
    if !joined.starts_with(&root) {
        return Err(SandboxViolation::EscapesRoot);
    }

    Ok(ConfinedPath(joined))
}

/// Confine a device's directory under the storage root and create it if absent.
pub async fn ensure_device_root(
    storage_root: &Path,
    device_id: &Uuid,
) -> Result<ConfinedPath, DeviceRootError> {
    let root = confine(storage_root, &device_id.hyphenated().to_string())?;
    tokio::fs::create_dir_all(root.as_path()).await?;
    Ok(root)
}
