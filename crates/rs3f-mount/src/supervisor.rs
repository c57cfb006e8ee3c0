//! [`ProcessSupervisor`] backed by the real sshfs, gocryptfs and fusermount binaries.

use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use rs3f_core::command::{DEFAULT_TIMEOUT, ToolCommand};
use rs3f_core::{CancelToken, Credential, MountSpec, ProcessSupervisor, SupervisorError};
use tracing::{debug, info, instrument, warn};

use crate::idmap::{self, CIPHER_DIR};
use crate::layout::{MountPaths, RuntimeLayout};
use crate::mount_table;
use crate::ssh;
use crate::tools::{Tool, Toolbox};

/// gocryptfs exit codes for a wrong or empty passphrase.
const GOCRYPTFS_BAD_PASSWORD: [i32; 2] = [12, 22];

const GOCRYPTFS_CONF: &str = "gocryptfs.conf";

const MOUNT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Drives the external mount tools and reads the OS mount table.
#[derive(Debug, Clone)]
pub struct FuseSupervisor {
    layout: RuntimeLayout,
    tools: Toolbox,
    mount_timeout: Duration,
    cancel: CancelToken,
}

impl FuseSupervisor {
    /// Supervisor placing staging directories in `layout` and running tools from `tools`.
    pub fn new(layout: RuntimeLayout, tools: Toolbox) -> Self {
        Self {
            layout,
            tools,
            mount_timeout: DEFAULT_TIMEOUT,
            cancel: CancelToken::new(),
        }
    }

    /// Bound for each tool run and for a mount to show up in (or leave) the mount table.
    #[must_use]
    pub fn with_mount_timeout(mut self, timeout: Duration) -> Self {
        self.mount_timeout = timeout;
        self
    }

    /// Kill a running sshfs or gocryptfs when `token` is raised. Unmounting is never
    /// cancelled so a rollback can complete.
    #[must_use]
    pub fn with_cancel(mut self, token: &CancelToken) -> Self {
        self.cancel = token.clone();
        self
    }

    fn paths(&self, target: &Path) -> Result<MountPaths, SupervisorError> {
        self.layout
            .paths_for(target)
            .map_err(|e| SupervisorError::io(format!("resolving {}", target.display()), e))
    }

    fn mount_transport(&self, spec: &MountSpec, staging: &Path) -> Result<(), SupervisorError> {
        self.tools.require(Tool::MOUNT)?;
        let identity = &spec.identity;

        ssh::probe(
            &self.tools.locate(Tool::Ssh)?,
            identity,
            self.mount_timeout,
            &self.cancel,
        )?;
        let remote_uid = ssh::remote_uid(
            &self.tools.locate(Tool::Sftp)?,
            identity,
            self.mount_timeout,
            &self.cancel,
        )?;

        let paths = self.paths(&spec.local_target)?;
        create_private_dir(staging)?;
        let user = idmap::local_username()
            .map_err(|e| SupervisorError::io("looking up the local user", e))?;
        idmap::write_maps(&paths.uid_file, &paths.gid_file, &user, remote_uid)
            .map_err(|e| SupervisorError::io("writing sshfs id maps", e))?;

        info!("mounting {identity} on {}", staging.display());
        let output = ToolCommand::new(self.tools.locate(Tool::Sshfs)?)
            .arg("-o")
            .arg(sshfs_options(&paths, identity.port))
            .args(&spec.sshfs_extra_args)
            .arg(format!("{}:/", identity.destination()))
            .arg(staging)
            .timeout(self.mount_timeout)
            .cancel_on(&self.cancel)
            .run()
            .map_err(|e| ssh::command_error("sshfs", e))?;

        if !output.success() {
            return Err(SupervisorError::ProcessFailed {
                tool: Tool::Sshfs.to_string(),
                code: output.status,
                diagnostic: output.diagnostic(),
            });
        }
        self.await_mounted(staging)
    }

    fn init_volume(
        &self,
        gocryptfs: &Path,
        spec: &MountSpec,
        cipher_dir: &Path,
        credential: &Credential,
    ) -> Result<(), SupervisorError> {
        info!("initialising new gocryptfs volume in {}", cipher_dir.display());
        create_private_dir(cipher_dir)?;
        let output = ToolCommand::new(gocryptfs)
            .arg("-init")
            .args(&spec.gocryptfs_extra_args)
            .arg(cipher_dir)
            .input(credential.expose().as_bytes())
            .timeout(self.mount_timeout)
            .cancel_on(&self.cancel)
            .run()
            .map_err(|e| ssh::command_error("gocryptfs", e))?;

        // gocryptfs prints the master key on stdout; the user has to see it.
        eprint!("{}", String::from_utf8_lossy(&output.stdout));

        if output.success() {
            Ok(())
        } else {
            Err(gocryptfs_failure(output.status, output.diagnostic()))
        }
    }

    fn await_mounted(&self, path: &Path) -> Result<(), SupervisorError> {
        if self.wait_for(path, true, Some(&self.cancel))? {
            Ok(())
        } else {
            Err(SupervisorError::NotMountedAfterStart(path.to_path_buf()))
        }
    }

    /// Poll the mount table until `path` is (or is no longer) mounted. Returns whether
    /// that happened within the mount timeout.
    fn wait_for(
        &self,
        path: &Path,
        mounted: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<bool, SupervisorError> {
        let deadline = Instant::now() + self.mount_timeout;
        loop {
            if self.query_mounted(path)? == mounted {
                return Ok(true);
            }
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(SupervisorError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(MOUNT_POLL_INTERVAL);
        }
    }
}

impl ProcessSupervisor for FuseSupervisor {
    fn staging_dir_for(&self, target: &Path) -> Result<PathBuf, SupervisorError> {
        Ok(self.paths(target)?.staging)
    }

    #[instrument(level = "debug", skip_all, fields(volume = %spec.identity))]
    fn start_transport(&self, spec: &MountSpec, staging: &Path) -> Result<(), SupervisorError> {
        let result = self.mount_transport(spec, staging);
        if result.is_err() {
            // The staging directory is only removed once it is known to be unmounted.
            let mounted = self.query_mounted(staging).unwrap_or_else(|e| {
                warn!(error = %e, "cannot check transport state after a failed mount");
                true
            });
            if mounted {
                return result;
            }
            if let Err(e) = self.discard_staging(staging) {
                warn!(error = %e, "cannot clean up after failed transport mount");
            }
        }
        result
    }

    #[instrument(level = "debug", skip_all, fields(target = %spec.local_target.display()))]
    fn start_overlay(
        &self,
        spec: &MountSpec,
        staging: &Path,
        credential: &Credential,
    ) -> Result<(), SupervisorError> {
        let gocryptfs = self.tools.locate(Tool::Gocryptfs)?;
        let cipher_dir = staging.join(CIPHER_DIR);
        let conf = cipher_dir.join(GOCRYPTFS_CONF);

        let initialised = conf
            .try_exists()
            .map_err(|e| SupervisorError::io(format!("checking {}", conf.display()), e))?;
        if !initialised {
            if !spec.allow_init {
                return Err(SupervisorError::VolumeNotInitialized(cipher_dir));
            }
            self.init_volume(&gocryptfs, spec, &cipher_dir, credential)?;
        }

        let target = spec.local_target.as_path();
        create_private_dir(target)?;

        info!("decrypting {} onto {}", cipher_dir.display(), target.display());
        let output = ToolCommand::new(&gocryptfs)
            .args(&spec.gocryptfs_extra_args)
            .arg(&cipher_dir)
            .arg(target)
            .input(credential.expose().as_bytes())
            .timeout(self.mount_timeout)
            .cancel_on(&self.cancel)
            .run()
            .map_err(|e| ssh::command_error("gocryptfs", e))?;

        if !output.success() {
            return Err(gocryptfs_failure(output.status, output.diagnostic()));
        }
        self.await_mounted(target)
    }

    #[instrument(level = "debug", skip(self), fields(path = %mount_path.display()))]
    fn stop(&self, mount_path: &Path) -> Result<(), SupervisorError> {
        let fusermount = self.tools.locate(Tool::Fusermount)?;
        let mut command = ToolCommand::new(fusermount);
        if cfg!(not(target_os = "macos")) {
            command = command.arg("-u");
        }
        let output = command
            .arg(mount_path)
            .timeout(self.mount_timeout)
            .run()
            .map_err(|e| ssh::command_error("fusermount", e))?;

        if !output.success() {
            // Lost a race with another unmount: nothing left to do.
            if !self.query_mounted(mount_path)? {
                debug!("already unmounted");
                return Ok(());
            }
            return Err(SupervisorError::ProcessFailed {
                tool: Tool::Fusermount.to_string(),
                code: output.status,
                diagnostic: output.diagnostic(),
            });
        }

        if self.wait_for(mount_path, false, None)? {
            Ok(())
        } else {
            Err(SupervisorError::Timeout {
                operation: format!("unmounting {}", mount_path.display()),
                after: self.mount_timeout,
            })
        }
    }

    fn query_mounted(&self, mount_path: &Path) -> Result<bool, SupervisorError> {
        mount_table::is_mounted(mount_path)
            .map_err(|e| SupervisorError::io("reading the mount table", e))
    }

    fn discard_staging(&self, staging: &Path) -> Result<(), SupervisorError> {
        ignore_missing(fs::remove_dir(staging), staging)?;
        if let Some(paths) = self.layout.paths_for_staging(staging) {
            ignore_missing(fs::remove_file(&paths.uid_file), &paths.uid_file)?;
            ignore_missing(fs::remove_file(&paths.gid_file), &paths.gid_file)?;
        }
        debug!(staging = %staging.display(), "staging directory removed");
        Ok(())
    }
}

fn sshfs_options(paths: &MountPaths, port: u16) -> String {
    [
        "reconnect".to_string(),
        "ServerAliveInterval=10".to_string(),
        "ServerAliveCountMax=1".to_string(),
        "IPQoS=lowdelay".to_string(),
        "idmap=file".to_string(),
        format!("uidfile={}", paths.uid_file.display()),
        format!("gidfile={}", paths.gid_file.display()),
        "nomap=ignore".to_string(),
        format!("port={port}"),
    ]
    .join(",")
}

fn gocryptfs_failure(code: Option<i32>, diagnostic: String) -> SupervisorError {
    match code {
        Some(code) if GOCRYPTFS_BAD_PASSWORD.contains(&code) => SupervisorError::InvalidPassphrase,
        _ => SupervisorError::ProcessFailed {
            tool: Tool::Gocryptfs.to_string(),
            code,
            diagnostic,
        },
    }
}

/// Create `path` and any missing parents with mode 0700. An existing directory, such as
/// an empty staging directory left by a crashed run, is reused as is.
fn create_private_dir(path: &Path) -> Result<(), SupervisorError> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .map_err(|e| SupervisorError::io(format!("creating {}", path.display()), e))
}

/// A removal of `path` that found nothing to remove counts as done.
fn ignore_missing(removal: io::Result<()>, path: &Path) -> Result<(), SupervisorError> {
    match removal {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            Err(SupervisorError::io(format!("removing {}", path.display()), e))
        }
        _ => Ok(()),
    }
}
