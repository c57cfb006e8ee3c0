use std::path::PathBuf;

use crate::{FetcherKind, VolumeIdentity};

/// Everything one `mount` invocation needs, after defaults, config file and command line
/// have been merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Remote volume to mount.
    pub identity: VolumeIdentity,
    /// User-visible mountpoint of the decrypted volume.
    pub local_target: PathBuf,
    /// Template for the password store key.
    pub password_pattern: String,
    /// Fetchers to try, in order.
    pub fetchers: Vec<FetcherKind>,
    /// KeePassXC database for [`FetcherKind::KeepassXC`].
    pub keepassxc_database: Option<PathBuf>,
    /// Create the encrypted volume when it has no gocryptfs configuration yet.
    pub allow_init: bool,
    /// Extra arguments appended to the sshfs command line.
    pub sshfs_extra_args: Vec<String>,
    /// Extra arguments inserted before the gocryptfs positional arguments.
    pub gocryptfs_extra_args: Vec<String>,
}

/// Which layers of a volume are currently mounted, as reported by the mount table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountState {
    /// The sshfs layer on the staging directory.
    pub transport_mounted: bool,
    /// The gocryptfs layer on the target.
    pub overlay_mounted: bool,
}

impl MountState {
    /// Neither layer is mounted.
    pub fn is_unmounted(self) -> bool {
        !self.transport_mounted && !self.overlay_mounted
    }

    /// Both layers are mounted.
    pub fn is_fully_mounted(self) -> bool {
        self.transport_mounted && self.overlay_mounted
    }
}
