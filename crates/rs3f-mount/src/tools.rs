//! Locating the external programs rs3f drives.

use std::env;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

use rs3f_core::SupervisorError;

/// An external program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    /// Transport layer.
    Sshfs,
    /// Overlay layer.
    Gocryptfs,
    /// Reachability probe.
    Ssh,
    /// Remote uid lookup.
    Sftp,
    /// FUSE unmount helper.
    Fusermount,
}

impl Tool {
    /// Everything a mount needs.
    pub const MOUNT: &[Tool] = &[
        Tool::Sshfs,
        Tool::Gocryptfs,
        Tool::Ssh,
        Tool::Sftp,
        Tool::Fusermount,
    ];

    /// Executable names to try, in order.
    fn candidates(self) -> &'static [&'static str] {
        match self {
            Self::Sshfs => &["sshfs"],
            Self::Gocryptfs => &["gocryptfs"],
            Self::Ssh => &["ssh"],
            Self::Sftp => &["sftp"],
            #[cfg(target_os = "macos")]
            Self::Fusermount => &["umount"],
            #[cfg(not(target_os = "macos"))]
            Self::Fusermount => &["fusermount", "fusermount3"],
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.candidates()[0])
    }
}

/// Resolves [`Tool`]s against a search path.
#[derive(Debug, Clone, Default)]
pub struct Toolbox {
    search_path: Vec<PathBuf>,
}

impl Toolbox {
    /// Search the directories of `$PATH`.
    pub fn from_env() -> Self {
        Self::with_search_path(&env::var_os("PATH").unwrap_or_default())
    }

    /// Search the directories of a `PATH`-style list.
    pub fn with_search_path(path: &OsStr) -> Self {
        Self {
            search_path: env::split_paths(path).collect(),
        }
    }

    /// Full path of `tool`, or [`SupervisorError::MissingTool`].
    pub fn locate(&self, tool: Tool) -> Result<PathBuf, SupervisorError> {
        tool.candidates()
            .iter()
            .find_map(|name| self.find(name))
            .ok_or_else(|| SupervisorError::MissingTool(tool.to_string()))
    }

    /// Fail on the first of `tools` that cannot be found.
    pub fn require(&self, tools: &[Tool]) -> Result<(), SupervisorError> {
        tools.iter().try_for_each(|&tool| self.locate(tool).map(drop))
    }

    fn find(&self, name: &str) -> Option<PathBuf> {
        self.search_path
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| is_executable(candidate))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
