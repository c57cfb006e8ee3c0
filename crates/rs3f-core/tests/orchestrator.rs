use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use proptest::prelude::*;
use rs3f_core::{
    CancelToken, Credential, FetcherKind, MountOrchestrator, MountSpec, OrchestratorError,
    ProcessSupervisor, Stage, SupervisorError, VolumeIdentity,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    StartTransport(PathBuf),
    StartOverlay(PathBuf),
    Stop(PathBuf),
    Discard(PathBuf),
}

#[derive(Default)]
struct MockState {
    mounted: HashSet<PathBuf>,
    calls: Vec<Call>,
    passphrase: String,
    transport_error: bool,
    transport_leaves_mount: bool,
    overlay_error: bool,
    overlay_leaves_mount: bool,
    stuck: HashSet<PathBuf>,
    cancel_during_transport: Option<CancelToken>,
    transport_breaks_table: bool,
    table_unreadable: bool,
}

/// In-memory mount table with scripted failures.
#[derive(Clone)]
struct MockSupervisor {
    state: Arc<Mutex<MockState>>,
}

impl MockSupervisor {
    fn new(passphrase: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                passphrase: passphrase.to_string(),
                ..MockState::default()
            })),
        }
    }

    fn with(&self, f: impl FnOnce(&mut MockState)) -> &Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    fn mount_path(&self, path: &Path) {
        self.state.lock().unwrap().mounted.insert(path.to_path_buf());
    }

    fn is_mounted(&self, path: &Path) -> bool {
        self.state.lock().unwrap().mounted.contains(path)
    }

    fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    fn spawned(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::StartTransport(_) | Call::StartOverlay(_)))
            .count()
    }
}

impl ProcessSupervisor for MockSupervisor {
    fn staging_dir_for(&self, target: &Path) -> Result<PathBuf, SupervisorError> {
        Ok(staging_for(target))
    }

    fn start_transport(&self, _spec: &MountSpec, staging: &Path) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::StartTransport(staging.to_path_buf()));
        if let Some(token) = &state.cancel_during_transport {
            token.cancel();
        }
        if state.transport_error {
            if state.transport_leaves_mount {
                state.mounted.insert(staging.to_path_buf());
            }
            if state.transport_breaks_table {
                state.table_unreadable = true;
            }
            return Err(SupervisorError::Timeout {
                operation: "sshfs".to_string(),
                after: Duration::from_secs(60),
            });
        }
        state.mounted.insert(staging.to_path_buf());
        Ok(())
    }

    fn start_overlay(
        &self,
        spec: &MountSpec,
        staging: &Path,
        credential: &Credential,
    ) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().unwrap();
        let target = spec.local_target.clone();
        state.calls.push(Call::StartOverlay(target.clone()));
        assert!(state.mounted.contains(staging), "overlay started without transport");

        if credential.expose() != state.passphrase {
            return Err(SupervisorError::InvalidPassphrase);
        }
        if state.overlay_error {
            if state.overlay_leaves_mount {
                state.mounted.insert(target.clone());
            }
            return Err(SupervisorError::NotMountedAfterStart(target));
        }
        state.mounted.insert(target);
        Ok(())
    }

    fn stop(&self, mount_path: &Path) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Stop(mount_path.to_path_buf()));
        if state.stuck.contains(mount_path) {
            return Err(SupervisorError::ProcessFailed {
                tool: "fusermount".to_string(),
                code: Some(1),
                diagnostic: "Device or resource busy".to_string(),
            });
        }
        state.mounted.remove(mount_path);
        Ok(())
    }

    fn query_mounted(&self, mount_path: &Path) -> Result<bool, SupervisorError> {
        let state = self.state.lock().unwrap();
        if state.table_unreadable {
            return Err(SupervisorError::io(
                "reading the mount table",
                io::Error::from(io::ErrorKind::PermissionDenied),
            ));
        }
        Ok(state.mounted.contains(mount_path))
    }

    fn discard_staging(&self, staging: &Path) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Discard(staging.to_path_buf()));
        Ok(())
    }
}

fn staging_for(target: &Path) -> PathBuf {
    let name = target.file_name().unwrap().to_string_lossy();
    PathBuf::from("/run/user/1000").join(format!("rs3f_{name}"))
}

fn spec(target: &str) -> MountSpec {
    MountSpec {
        identity: VolumeIdentity {
            volume: "vol".to_string(),
            server: "host".to_string(),
            port: 22,
        },
        local_target: PathBuf::from(target),
        password_pattern: "rs3f/{volume}@{server}:{port}".to_string(),
        fetchers: vec![FetcherKind::KeepassXC, FetcherKind::Stdin],
        keepassxc_database: None,
        allow_init: false,
        sshfs_extra_args: Vec::new(),
        gocryptfs_extra_args: Vec::new(),
    }
}

fn credential(passphrase: &str) -> Credential {
    Credential::new(passphrase.to_string())
}

#[test]
fn mount_then_umount_stacks_and_unstacks_in_order() {
    let mock = MockSupervisor::new("right");
    let orchestrator = MountOrchestrator::new(mock.clone());
    let spec = spec("/mnt/x");
    let staging = staging_for(&spec.local_target);

    let mounted = orchestrator.mount(&spec, &credential("right")).unwrap();
    assert_eq!(mounted.target, spec.local_target);
    assert_eq!(mounted.staging, staging);
    assert!(orchestrator.state(&spec.local_target).unwrap().is_fully_mounted());

    let before = orchestrator.umount(&spec.local_target).unwrap();
    assert!(before.is_fully_mounted());
    assert!(orchestrator.state(&spec.local_target).unwrap().is_unmounted());

    assert_eq!(
        mock.calls(),
        vec![
            Call::StartTransport(staging.clone()),
            Call::StartOverlay(spec.local_target.clone()),
            Call::Stop(spec.local_target.clone()),
            Call::Stop(staging.clone()),
            Call::Discard(staging),
        ]
    );
}

#[test]
fn wrong_passphrase_rolls_back_transport() {
    let mock = MockSupervisor::new("right");
    let orchestrator = MountOrchestrator::new(mock.clone());
    let spec = spec("/mnt/x");
    let staging = staging_for(&spec.local_target);

    let err = orchestrator.mount(&spec, &credential("wrong")).unwrap_err();
    match &err {
        OrchestratorError::OverlayMountFailed { source, .. } => {
            assert!(matches!(source, SupervisorError::InvalidPassphrase));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.stage(), Stage::OverlayMount);
    assert!(!err.requires_manual_cleanup());

    assert!(!mock.is_mounted(&staging));
    assert!(!mock.is_mounted(&spec.local_target));
    assert!(mock.calls().contains(&Call::Discard(staging)));
}

#[test]
fn second_mount_is_rejected_without_spawning() {
    let mock = MockSupervisor::new("right");
    let orchestrator = MountOrchestrator::new(mock.clone());
    let spec = spec("/mnt/x");
    orchestrator.mount(&spec, &credential("right")).unwrap();
    let spawned = mock.spawned();

    let err = orchestrator.mount(&spec, &credential("right")).unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyMounted { .. }));
    assert_eq!(mock.spawned(), spawned);

    let err = orchestrator.check_available(&spec.local_target).unwrap_err();
    assert_eq!(err.stage(), Stage::Precondition);
}

#[test]
fn stranded_transport_blocks_mount() {
    let mock = MockSupervisor::new("right");
    let spec = spec("/mnt/x");
    mock.mount_path(&staging_for(&spec.local_target));
    let orchestrator = MountOrchestrator::new(mock.clone());

    match orchestrator.mount(&spec, &credential("right")) {
        Err(OrchestratorError::AlreadyMounted { state, .. }) => {
            assert!(state.transport_mounted);
            assert!(!state.overlay_mounted);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(mock.spawned(), 0);
}

#[test]
fn failed_rollback_reports_residual_transport() {
    let mock = MockSupervisor::new("right");
    let spec = spec("/mnt/x");
    let staging = staging_for(&spec.local_target);
    mock.with(|s| {
        s.stuck.insert(staging.clone());
    });
    let orchestrator = MountOrchestrator::new(mock.clone());

    let err = orchestrator.mount(&spec, &credential("wrong")).unwrap_err();
    match &err {
        OrchestratorError::RollbackFailed {
            residual, cause, ..
        } => {
            assert_eq!(residual, &[staging.clone()]);
            assert!(matches!(cause, SupervisorError::InvalidPassphrase));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.requires_manual_cleanup());
    assert!(mock.is_mounted(&staging));
    assert!(!mock.is_mounted(&spec.local_target));
}

#[test]
fn stuck_overlay_still_unmounts_transport_and_reports_both() {
    let mock = MockSupervisor::new("right");
    let spec = spec("/mnt/x");
    let staging = staging_for(&spec.local_target);
    mock.with(|s| {
        s.overlay_error = true;
        s.overlay_leaves_mount = true;
        s.stuck.insert(spec.local_target.clone());
        s.stuck.insert(staging.clone());
    });
    let orchestrator = MountOrchestrator::new(mock.clone());

    let err = orchestrator.mount(&spec, &credential("right")).unwrap_err();
    match &err {
        OrchestratorError::RollbackFailed { residual, .. } => {
            assert_eq!(residual, &[spec.local_target.clone(), staging.clone()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let message = err.to_string();
    assert!(message.contains("/mnt/x"));
    assert!(message.contains(staging.to_str().unwrap()));
    assert!(mock.calls().contains(&Call::Stop(staging)));
}

#[test]
fn stuck_overlay_over_released_transport_reports_overlay_only() {
    let mock = MockSupervisor::new("right");
    let spec = spec("/mnt/x");
    let staging = staging_for(&spec.local_target);
    mock.with(|s| {
        s.overlay_error = true;
        s.overlay_leaves_mount = true;
        s.stuck.insert(spec.local_target.clone());
    });
    let orchestrator = MountOrchestrator::new(mock.clone());

    match orchestrator.mount(&spec, &credential("right")) {
        Err(OrchestratorError::RollbackFailed { residual, .. }) => {
            assert_eq!(residual, vec![spec.local_target.clone()]);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(!mock.is_mounted(&staging));
}

#[test]
fn unreadable_table_after_transport_failure_still_unmounts() {
    let mock = MockSupervisor::new("right");
    mock.with(|s| {
        s.transport_error = true;
        s.transport_leaves_mount = true;
        s.transport_breaks_table = true;
    });
    let orchestrator = MountOrchestrator::new(mock.clone());
    let spec = spec("/mnt/x");
    let staging = staging_for(&spec.local_target);

    let err = orchestrator.mount(&spec, &credential("right")).unwrap_err();
    assert!(matches!(err, OrchestratorError::TransportMountFailed { .. }));
    assert!(mock.calls().contains(&Call::Stop(staging.clone())));
    assert!(!mock.is_mounted(&staging));
}

#[test]
fn transport_failure_never_starts_overlay() {
    let mock = MockSupervisor::new("right");
    mock.with(|s| s.transport_error = true);
    let orchestrator = MountOrchestrator::new(mock.clone());
    let spec = spec("/mnt/x");

    let err = orchestrator.mount(&spec, &credential("right")).unwrap_err();
    assert!(matches!(err, OrchestratorError::TransportMountFailed { .. }));
    assert_eq!(err.stage(), Stage::TransportMount);
    assert!(
        !mock
            .calls()
            .iter()
            .any(|c| matches!(c, Call::StartOverlay(_)))
    );
}

#[test]
fn late_transport_mount_is_cleaned_up() {
    let mock = MockSupervisor::new("right");
    mock.with(|s| {
        s.transport_error = true;
        s.transport_leaves_mount = true;
    });
    let orchestrator = MountOrchestrator::new(mock.clone());
    let spec = spec("/mnt/x");
    let staging = staging_for(&spec.local_target);

    let err = orchestrator.mount(&spec, &credential("right")).unwrap_err();
    assert!(matches!(err, OrchestratorError::TransportMountFailed { .. }));
    assert!(!mock.is_mounted(&staging));
    assert!(mock.calls().contains(&Call::Stop(staging)));
}

#[test]
fn overlay_mounted_before_failing_is_stopped_first() {
    let mock = MockSupervisor::new("right");
    mock.with(|s| {
        s.overlay_error = true;
        s.overlay_leaves_mount = true;
    });
    let orchestrator = MountOrchestrator::new(mock.clone());
    let spec = spec("/mnt/x");
    let staging = staging_for(&spec.local_target);

    let err = orchestrator.mount(&spec, &credential("right")).unwrap_err();
    assert!(matches!(err, OrchestratorError::OverlayMountFailed { .. }));

    let stops: Vec<Call> = mock
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Stop(_)))
        .collect();
    assert_eq!(
        stops,
        vec![Call::Stop(spec.local_target.clone()), Call::Stop(staging)]
    );
}

#[test]
fn interruption_after_transport_rolls_back() {
    let token = CancelToken::new();
    let mock = MockSupervisor::new("right");
    mock.with(|s| s.cancel_during_transport = Some(token.clone()));
    let orchestrator = MountOrchestrator::with_cancel(mock.clone(), token);
    let spec = spec("/mnt/x");

    let err = orchestrator.mount(&spec, &credential("right")).unwrap_err();
    match err {
        OrchestratorError::OverlayMountFailed { source, .. } => {
            assert!(matches!(source, SupervisorError::Cancelled));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(orchestrator.state(&spec.local_target).unwrap().is_unmounted());
    assert!(
        !mock
            .calls()
            .iter()
            .any(|c| matches!(c, Call::StartOverlay(_)))
    );
}

#[test]
fn umount_of_unmounted_target_has_no_side_effects() {
    let mock = MockSupervisor::new("right");
    let orchestrator = MountOrchestrator::new(mock.clone());

    let err = orchestrator.umount(Path::new("/mnt/x")).unwrap_err();
    assert!(matches!(err, OrchestratorError::NotMounted { .. }));
    assert!(mock.calls().is_empty());

    let err = orchestrator.umount(Path::new("/mnt/x")).unwrap_err();
    assert!(matches!(err, OrchestratorError::NotMounted { .. }));
}

#[test]
fn overlay_unmount_failure_leaves_transport_alone() {
    let mock = MockSupervisor::new("right");
    let orchestrator = MountOrchestrator::new(mock.clone());
    let spec = spec("/mnt/x");
    let staging = staging_for(&spec.local_target);
    orchestrator.mount(&spec, &credential("right")).unwrap();
    mock.with(|s| {
        s.stuck.insert(spec.local_target.clone());
    });

    let err = orchestrator.umount(&spec.local_target).unwrap_err();
    assert!(matches!(err, OrchestratorError::OverlayUnmountFailed { .. }));
    assert!(!err.requires_manual_cleanup());
    assert!(mock.is_mounted(&spec.local_target));
    assert!(mock.is_mounted(&staging));
    assert!(!mock.calls().contains(&Call::Stop(staging)));
}

#[test]
fn transport_unmount_failure_keeps_transport_mounted() {
    let mock = MockSupervisor::new("right");
    let orchestrator = MountOrchestrator::new(mock.clone());
    let spec = spec("/mnt/x");
    let staging = staging_for(&spec.local_target);
    orchestrator.mount(&spec, &credential("right")).unwrap();
    mock.with(|s| {
        s.stuck.insert(staging.clone());
    });

    let err = orchestrator.umount(&spec.local_target).unwrap_err();
    assert!(matches!(err, OrchestratorError::TransportUnmountFailed { .. }));
    assert!(err.requires_manual_cleanup());
    assert!(!mock.is_mounted(&spec.local_target));
    assert!(mock.is_mounted(&staging));
}

#[test]
fn umount_cleans_up_stranded_transport() {
    let mock = MockSupervisor::new("right");
    let target = PathBuf::from("/mnt/x");
    let staging = staging_for(&target);
    mock.mount_path(&staging);
    let orchestrator = MountOrchestrator::new(mock.clone());

    let before = orchestrator.umount(&target).unwrap();
    assert!(before.transport_mounted && !before.overlay_mounted);
    assert_eq!(
        mock.calls(),
        vec![Call::Stop(staging.clone()), Call::Discard(staging)]
    );
}

proptest! {
    /// After a failed mount nothing is mounted, unless the rollback itself failed, in
    /// which case the residual mount is reported and is indeed still mounted.
    #[test]
    fn failed_mount_leaves_nothing_mounted(
        transport_error in any::<bool>(),
        transport_leaves_mount in any::<bool>(),
        wrong_passphrase in any::<bool>(),
        overlay_error in any::<bool>(),
        overlay_leaves_mount in any::<bool>(),
        stuck_staging in any::<bool>(),
        stuck_target in any::<bool>(),
    ) {
        let mock = MockSupervisor::new("right");
        let spec = spec("/mnt/x");
        let staging = staging_for(&spec.local_target);
        mock.with(|s| {
            s.transport_error = transport_error;
            s.transport_leaves_mount = transport_leaves_mount;
            s.overlay_error = overlay_error;
            s.overlay_leaves_mount = overlay_leaves_mount;
            if stuck_staging {
                s.stuck.insert(staging.clone());
            }
            if stuck_target {
                s.stuck.insert(spec.local_target.clone());
            }
        });
        let orchestrator = MountOrchestrator::new(mock.clone());
        let passphrase = if wrong_passphrase { "wrong" } else { "right" };

        match orchestrator.mount(&spec, &credential(passphrase)) {
            Ok(_) => {
                prop_assert!(mock.is_mounted(&staging));
                prop_assert!(mock.is_mounted(&spec.local_target));
            }
            Err(OrchestratorError::RollbackFailed { residual, .. }) => {
                prop_assert!(!residual.is_empty());
                for path in [&staging, &spec.local_target] {
                    prop_assert_eq!(mock.is_mounted(path), residual.contains(path));
                }
            }
            Err(_) => {
                prop_assert!(!mock.is_mounted(&staging));
                prop_assert!(!mock.is_mounted(&spec.local_target));
            }
        }
    }
}
