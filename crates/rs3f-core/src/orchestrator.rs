//! The two-layer mount and unmount state machines.
//!
//! ```text
//! Unmounted -> TransportMounting -> TransportMounted -> OverlayMounting -> Mounted
//!                                          |                  |
//!                                          +---> RollingBack <+---> Unmounted
//! ```
//!
//! A mount either ends with both layers up or with neither, except when the rollback
//! itself fails ([`OrchestratorError::RollbackFailed`]).

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{CancelToken, Credential, MountSpec, MountState, ProcessSupervisor, SupervisorError};

/// Phase of a mount in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountPhase {
    /// Nothing mounted.
    Unmounted,
    /// sshfs is starting.
    TransportMounting,
    /// sshfs is up, gocryptfs not started.
    TransportMounted,
    /// gocryptfs is starting.
    OverlayMounting,
    /// Both layers are up.
    Mounted,
    /// Undoing a partial mount.
    RollingBack,
}

impl fmt::Display for MountPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unmounted => "unmounted",
            Self::TransportMounting => "transport-mounting",
            Self::TransportMounted => "transport-mounted",
            Self::OverlayMounting => "overlay-mounting",
            Self::Mounted => "mounted",
            Self::RollingBack => "rolling-back",
        })
    }
}

/// The step an [`OrchestratorError`] originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Inspecting the mount table before doing anything.
    Precondition,
    /// Mounting sshfs.
    TransportMount,
    /// Mounting gocryptfs.
    OverlayMount,
    /// Undoing a partial mount.
    Rollback,
    /// Unmounting gocryptfs.
    OverlayUnmount,
    /// Unmounting sshfs.
    TransportUnmount,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Precondition => "precondition",
            Self::TransportMount => "transport mount",
            Self::OverlayMount => "overlay mount",
            Self::Rollback => "rollback",
            Self::OverlayUnmount => "overlay unmount",
            Self::TransportUnmount => "transport unmount",
        })
    }
}

/// Errors from [`MountOrchestrator`].
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// One or both layers are already mounted for this target.
    #[error("{} is already mounted", target.display())]
    AlreadyMounted {
        /// User-visible target.
        target: PathBuf,
        /// What the mount table reported.
        state: MountState,
    },

    /// Neither layer is mounted for this target.
    #[error("{} is not mounted", target.display())]
    NotMounted {
        /// User-visible target.
        target: PathBuf,
    },

    /// The mount table could not be read or the staging directory not derived.
    #[error("cannot determine the mount state of {}", path.display())]
    Inspect {
        /// Path being inspected.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: SupervisorError,
    },

    /// sshfs could not be mounted. Nothing is left mounted.
    #[error("transport mount of {volume} failed")]
    TransportMountFailed {
        /// `volume@server:port`.
        volume: String,
        /// Underlying error.
        #[source]
        source: SupervisorError,
    },

    /// gocryptfs could not be mounted. The transport was rolled back.
    #[error("overlay mount on {} failed", target.display())]
    OverlayMountFailed {
        /// User-visible target.
        target: PathBuf,
        /// Underlying error.
        #[source]
        source: SupervisorError,
    },

    /// gocryptfs could not be unmounted. The transport was left untouched.
    #[error("overlay unmount of {} failed", target.display())]
    OverlayUnmountFailed {
        /// User-visible target.
        target: PathBuf,
        /// Underlying error.
        #[source]
        source: SupervisorError,
    },

    /// The overlay is gone but sshfs is still mounted.
    #[error("transport unmount of {} failed; manual cleanup required", staging.display())]
    TransportUnmountFailed {
        /// Staging directory still holding the transport mount.
        staging: PathBuf,
        /// Underlying error.
        #[source]
        source: SupervisorError,
    },

    /// A mount failed and undoing it failed as well.
    #[error(
        "mount failed and could not be rolled back ({rollback}); still mounted: {}, manual cleanup required",
        format_paths(.residual)
    )]
    RollbackFailed {
        /// Every path still mounted, overlay first.
        residual: Vec<PathBuf>,
        /// Why the mount failed.
        #[source]
        cause: SupervisorError,
        /// Why the rollback failed.
        rollback: SupervisorError,
    },
}

impl OrchestratorError {
    /// The step the error originates from.
    pub fn stage(&self) -> Stage {
        match self {
            Self::AlreadyMounted { .. } | Self::NotMounted { .. } | Self::Inspect { .. } => {
                Stage::Precondition
            }
            Self::TransportMountFailed { .. } => Stage::TransportMount,
            Self::OverlayMountFailed { .. } => Stage::OverlayMount,
            Self::RollbackFailed { .. } => Stage::Rollback,
            Self::OverlayUnmountFailed { .. } => Stage::OverlayUnmount,
            Self::TransportUnmountFailed { .. } => Stage::TransportUnmount,
        }
    }

    /// Whether a mount was left behind that the user has to remove by hand.
    pub fn requires_manual_cleanup(&self) -> bool {
        matches!(
            self,
            Self::RollbackFailed { .. } | Self::TransportUnmountFailed { .. }
        )
    }
}

/// A successfully mounted volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedVolume {
    /// Decrypted view.
    pub target: PathBuf,
    /// Transport mount underneath it.
    pub staging: PathBuf,
}

/// Drives a [`ProcessSupervisor`] through the mount and unmount state machines.
#[derive(Debug)]
pub struct MountOrchestrator<S> {
    supervisor: S,
    cancel: CancelToken,
}

impl<S: ProcessSupervisor> MountOrchestrator<S> {
    /// Orchestrator that is never cancelled.
    pub fn new(supervisor: S) -> Self {
        Self::with_cancel(supervisor, CancelToken::new())
    }

    /// Orchestrator that aborts a mount in progress once `cancel` is raised.
    pub fn with_cancel(supervisor: S, cancel: CancelToken) -> Self {
        Self { supervisor, cancel }
    }

    /// The underlying supervisor.
    pub fn supervisor(&self) -> &S {
        &self.supervisor
    }

    /// Current state of both layers for `target`, straight from the mount table.
    pub fn state(&self, target: &Path) -> Result<MountState, OrchestratorError> {
        let staging = self.staging_dir(target)?;
        self.query_state(target, &staging)
    }

    /// Fail with [`OrchestratorError::AlreadyMounted`] when anything is mounted for
    /// `target`. Runs before the passphrase is requested.
    pub fn check_available(&self, target: &Path) -> Result<(), OrchestratorError> {
        let state = self.state(target)?;
        if state.is_unmounted() {
            Ok(())
        } else {
            Err(OrchestratorError::AlreadyMounted {
                target: target.to_path_buf(),
                state,
            })
        }
    }

    /// Mount sshfs, then gocryptfs on top of it.
    #[instrument(
        level = "info",
        name = "orchestrator::mount",
        skip_all,
        fields(volume = %spec.identity, target = %spec.local_target.display())
    )]
    pub fn mount(
        &self,
        spec: &MountSpec,
        credential: &Credential,
    ) -> Result<MountedVolume, OrchestratorError> {
        let target = spec.local_target.as_path();
        let staging = self.staging_dir(target)?;

        let state = self.query_state(target, &staging)?;
        if !state.is_unmounted() {
            return Err(OrchestratorError::AlreadyMounted {
                target: target.to_path_buf(),
                state,
            });
        }

        enter(MountPhase::TransportMounting);
        if let Err(cause) = self.supervisor.start_transport(spec, &staging) {
            // A timed-out sshfs can still have registered its mount. When the table
            // cannot be read, unmounting is attempted anyway.
            let leftover = self.supervisor.query_mounted(&staging).unwrap_or_else(|e| {
                warn!(error = %e, "cannot check transport state after a failed mount");
                true
            });
            if leftover {
                enter(MountPhase::RollingBack);
                if let Err(rollback) = self.stop_transport(&staging) {
                    return Err(OrchestratorError::RollbackFailed {
                        residual: vec![staging],
                        cause,
                        rollback,
                    });
                }
            }
            enter(MountPhase::Unmounted);
            return Err(OrchestratorError::TransportMountFailed {
                volume: spec.identity.to_string(),
                source: cause,
            });
        }
        enter(MountPhase::TransportMounted);

        let overlay = if self.cancel.is_cancelled() {
            Err(SupervisorError::Cancelled)
        } else {
            enter(MountPhase::OverlayMounting);
            self.supervisor.start_overlay(spec, &staging, credential)
        };

        match overlay {
            Ok(()) => {
                enter(MountPhase::Mounted);
                info!("volume mounted");
                Ok(MountedVolume {
                    target: target.to_path_buf(),
                    staging,
                })
            }
            Err(cause) => {
                enter(MountPhase::RollingBack);
                warn!(error = %cause, "overlay mount failed, rolling back transport");
                self.roll_back(target, &staging, cause)
            }
        }
    }

    /// Unmount gocryptfs, then sshfs. Returns the state found before unmounting.
    #[instrument(
        level = "info",
        name = "orchestrator::umount",
        skip_all,
        fields(target = %target.display())
    )]
    pub fn umount(&self, target: &Path) -> Result<MountState, OrchestratorError> {
        let staging = self.staging_dir(target)?;
        let state = self.query_state(target, &staging)?;

        if state.is_unmounted() {
            return Err(OrchestratorError::NotMounted {
                target: target.to_path_buf(),
            });
        }

        if state.overlay_mounted {
            self.supervisor
                .stop(target)
                .map_err(|source| OrchestratorError::OverlayUnmountFailed {
                    target: target.to_path_buf(),
                    source,
                })?;
            debug!("overlay unmounted");
        } else {
            warn!("only the transport is mounted, cleaning up a stranded mount");
        }

        if state.transport_mounted {
            self.stop_transport(&staging).map_err(|source| {
                OrchestratorError::TransportUnmountFailed {
                    staging: staging.clone(),
                    source,
                }
            })?;
            debug!("transport unmounted");
        }

        info!("volume unmounted");
        Ok(state)
    }

    fn roll_back(
        &self,
        target: &Path,
        staging: &Path,
        cause: SupervisorError,
    ) -> Result<MountedVolume, OrchestratorError> {
        let mut residual = Vec::new();
        let mut failure = None;

        // The overlay may have mounted before failing its post-mount check.
        match self.supervisor.query_mounted(target) {
            Ok(true) => {
                if let Err(e) = self.supervisor.stop(target) {
                    warn!(error = %e, "cannot unmount overlay during rollback");
                    residual.push(target.to_path_buf());
                    failure = Some(e);
                }
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "cannot check overlay state during rollback"),
        }

        // Attempted even under a stuck overlay so that nothing goes unreported.
        if let Err(e) = self.stop_transport(staging) {
            warn!(error = %e, "cannot unmount transport during rollback");
            residual.push(staging.to_path_buf());
            if failure.is_none() {
                failure = Some(e);
            }
        }

        if let Some(rollback) = failure {
            return Err(OrchestratorError::RollbackFailed {
                residual,
                cause,
                rollback,
            });
        }

        enter(MountPhase::Unmounted);
        Err(OrchestratorError::OverlayMountFailed {
            target: target.to_path_buf(),
            source: cause,
        })
    }

    fn stop_transport(&self, staging: &Path) -> Result<(), SupervisorError> {
        self.supervisor.stop(staging)?;
        if let Err(e) = self.supervisor.discard_staging(staging) {
            warn!(error = %e, staging = %staging.display(), "cannot remove staging directory");
        }
        Ok(())
    }

    fn staging_dir(&self, target: &Path) -> Result<PathBuf, OrchestratorError> {
        self.supervisor
            .staging_dir_for(target)
            .map_err(|source| OrchestratorError::Inspect {
                path: target.to_path_buf(),
                source,
            })
    }

    fn query_state(
        &self,
        target: &Path,
        staging: &Path,
    ) -> Result<MountState, OrchestratorError> {
        let query = |path: &Path| {
            self.supervisor
                .query_mounted(path)
                .map_err(|source| OrchestratorError::Inspect {
                    path: path.to_path_buf(),
                    source,
                })
        };
        let state = MountState {
            transport_mounted: query(staging)?,
            overlay_mounted: query(target)?,
        };
        debug!(?state, "mount table state");
        Ok(state)
    }
}

fn enter(phase: MountPhase) {
    debug!(%phase, "entering phase");
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
