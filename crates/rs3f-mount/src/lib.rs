//! sshfs and gocryptfs supervision for rs3f volumes.
//!
//! This crate implements [`rs3f_core::ProcessSupervisor`] on top of the external FUSE
//! tools and provides the OS-facing pieces the CLI needs.
//!
//! # Components
//!
//! - [`FuseSupervisor`] - Runs `ssh`/`sftp` preflight checks, `sshfs`, `gocryptfs` and
//!   `fusermount`, and waits on the mount table
//! - [`mount_table`] - Reads `/proc/self/mounts` (Linux) or `mount` output (macOS)
//! - [`RuntimeLayout`] - Staging directory and uid/gid map paths under `$XDG_RUNTIME_DIR`
//! - [`Toolbox`] - Locates the external programs on `PATH`
//! - [`signal`] - Turns SIGINT/SIGTERM/SIGHUP into a [`rs3f_core::CancelToken`]
//!
//! # Example
//!
//! ```no_run
//! use rs3f_core::{CancelToken, MountOrchestrator};
//! use rs3f_mount::{FuseSupervisor, RuntimeLayout, Toolbox};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cancel = CancelToken::new();
//! let supervisor = FuseSupervisor::new(RuntimeLayout::from_env()?, Toolbox::from_env())
//!     .with_cancel(&cancel);
//! let orchestrator = MountOrchestrator::with_cancel(supervisor, cancel);
//! orchestrator.umount(std::path::Path::new("/home/alice/vol"))?;
//! # Ok(())
//! # }
//! ```

#![cfg(unix)]

mod idmap;
mod layout;
pub mod mount_table;
pub mod signal;
mod ssh;
mod supervisor;
mod tools;

pub use layout::{LayoutError, MountPaths, RuntimeLayout, mount_key};
pub use signal::install_cancel_handler;
pub use supervisor::FuseSupervisor;
pub use tools::{Tool, Toolbox};
