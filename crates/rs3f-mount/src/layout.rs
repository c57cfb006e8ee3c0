//! Per-target paths under the user's runtime directory.
//!
//! Each target is identified by a short key, the first 8 hex digits of the SHA-256 of its
//! absolute path. The transport of `/home/alice/vol` is mounted on
//! `$XDG_RUNTIME_DIR/rs3f_<key>`, next to `uidfile_<key>` and `gidfile_<key>`.

use std::io;
use std::path::{Component, Path, PathBuf};

use directories::BaseDirs;
use sha2::{Digest, Sha256};
use thiserror::Error;

const STAGING_PREFIX: &str = "rs3f_";

/// Errors from locating the runtime directory.
#[derive(Debug, Error)]
pub enum LayoutError {
    /// `$XDG_RUNTIME_DIR` is not set.
    #[error("$XDG_RUNTIME_DIR is not set, cannot determine where to mount the transport layer")]
    NoRuntimeDir,
}

/// Paths belonging to one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPaths {
    /// Transport mountpoint.
    pub staging: PathBuf,
    /// sshfs `uidfile`.
    pub uid_file: PathBuf,
    /// sshfs `gidfile`.
    pub gid_file: PathBuf,
}

/// The runtime directory all staging paths live in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLayout {
    runtime_dir: PathBuf,
}

impl RuntimeLayout {
    /// Use `$XDG_RUNTIME_DIR`.
    pub fn from_env() -> Result<Self, LayoutError> {
        let dirs = BaseDirs::new().ok_or(LayoutError::NoRuntimeDir)?;
        let runtime_dir = dirs.runtime_dir().ok_or(LayoutError::NoRuntimeDir)?;
        Ok(Self::new(runtime_dir))
    }

    /// Use an explicit directory.
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
        }
    }

    /// The runtime directory.
    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// Paths for `target`, which may be relative to the working directory.
    pub fn paths_for(&self, target: &Path) -> io::Result<MountPaths> {
        Ok(self.paths_for_key(&mount_key(target)?))
    }

    /// Paths sharing the key of an existing staging directory.
    pub fn paths_for_staging(&self, staging: &Path) -> Option<MountPaths> {
        let key = staging.file_name()?.to_str()?.strip_prefix(STAGING_PREFIX)?;
        Some(self.paths_for_key(key))
    }

    fn paths_for_key(&self, key: &str) -> MountPaths {
        MountPaths {
            staging: self.runtime_dir.join(format!("{STAGING_PREFIX}{key}")),
            uid_file: self.runtime_dir.join(format!("uidfile_{key}")),
            gid_file: self.runtime_dir.join(format!("gidfile_{key}")),
        }
    }
}

/// Key identifying `target`.
pub fn mount_key(target: &Path) -> io::Result<String> {
    let absolute = normalize_absolute(target)?;
    let digest = Sha256::digest(absolute.to_string_lossy().as_bytes());
    let mut hex = format!("{digest:x}");
    hex.truncate(8);
    Ok(hex)
}

/// Absolute, lexically normalized form of `path`: `.` is dropped and `..` removes the
/// preceding component. Symlinks are not resolved.
pub fn normalize_absolute(path: &Path) -> io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}
