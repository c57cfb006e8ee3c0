use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::{Credential, MountSpec};

/// Errors reported by a [`ProcessSupervisor`].
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A required external tool is not on `PATH`.
    #[error("required tool '{0}' was not found in PATH")]
    MissingTool(String),

    /// The SSH server did not answer.
    #[error("cannot reach {server}:{port}: {diagnostic}")]
    Unreachable {
        /// Server name.
        server: String,
        /// SSH port.
        port: u16,
        /// What ssh reported.
        diagnostic: String,
    },

    /// The SSH server refused the login.
    #[error("authentication as {destination} failed: {diagnostic}")]
    Authentication {
        /// `volume@server`.
        destination: String,
        /// What the tool reported.
        diagnostic: String,
    },

    /// The remote account has no `gocryptfs_root` directory.
    #[error("{0} has no gocryptfs_root directory; is it an rs3f volume?")]
    NotAnRs3fVolume(String),

    /// The remote volume has no gocryptfs configuration and initialisation was not allowed.
    #[error("volume at {} is not initialised (no gocryptfs.conf); rerun with --allow-init to create it", .0.display())]
    VolumeNotInitialized(PathBuf),

    /// gocryptfs rejected the passphrase.
    #[error("wrong or empty passphrase")]
    InvalidPassphrase,

    /// An external tool exited unsuccessfully.
    #[error("{tool} failed with status {code:?}: {diagnostic}")]
    ProcessFailed {
        /// Tool name.
        tool: String,
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// Trimmed stderr.
        diagnostic: String,
    },

    /// An operation did not complete in time.
    #[error("{operation} timed out after {}s", after.as_secs())]
    Timeout {
        /// What was being waited for.
        operation: String,
        /// The bound that was exceeded.
        after: Duration,
    },

    /// The invocation was interrupted by a signal.
    #[error("interrupted")]
    Cancelled,

    /// The tool reported success but the mount never showed up in the mount table.
    #[error("{} did not appear in the mount table", .0.display())]
    NotMountedAfterStart(PathBuf),

    /// Local filesystem or process I/O failed.
    #[error("{context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl SupervisorError {
    /// Wrap an I/O error with a short description of the failed operation.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Adapter to the external mount tools.
///
/// The mount table is the only state: implementations must not remember what they
/// mounted, [`query_mounted`](Self::query_mounted) always asks the OS.
pub trait ProcessSupervisor {
    /// Internal mountpoint of the transport layer for a given target.
    fn staging_dir_for(&self, target: &Path) -> Result<PathBuf, SupervisorError>;

    /// Mount the remote volume `spec.identity` on `staging`.
    fn start_transport(&self, spec: &MountSpec, staging: &Path) -> Result<(), SupervisorError>;

    /// Mount the decrypted view of `staging` on `spec.local_target`.
    fn start_overlay(
        &self,
        spec: &MountSpec,
        staging: &Path,
        credential: &Credential,
    ) -> Result<(), SupervisorError>;

    /// Unmount whatever is mounted at `mount_path` and wait for it to leave the mount
    /// table, reporting [`SupervisorError::Timeout`] when it does not.
    fn stop(&self, mount_path: &Path) -> Result<(), SupervisorError>;

    /// Whether something is mounted at `mount_path`.
    fn query_mounted(&self, mount_path: &Path) -> Result<bool, SupervisorError>;

    /// Remove the staging directory and its helper files once the transport is stopped.
    fn discard_staging(&self, _staging: &Path) -> Result<(), SupervisorError> {
        Ok(())
    }
}
