mod common;

use std::cell::{Cell, RefCell};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Notify;

use common::{pump_until_idle, GateEngine, ScriptedEngine};
use patchpump_core::handoff::{HandoffState, ProcessLauncher, SelfPatchHandoff};
use patchpump_core::pump::SessionPump;
use patchpump_core::session::operation_session::OperationSession;
use patchpump_core::types::types::{HandoffError, OperationKind, OperationResult, PatchParameters};

#[derive(Debug, Clone, PartialEq)]
struct Launch {
    program: PathBuf,
    args: Vec<OsString>,
    working_dir: PathBuf,
}

#[derive(Default)]
struct RecordingLauncher {
    launches: RefCell<Vec<Launch>>,
    terminated: Cell<bool>,
    fail_spawn: bool,
}

impl RecordingLauncher {
    fn failing() -> Self {
        Self {
            fail_spawn: true,
            ..Self::default()
        }
    }
}

impl ProcessLauncher for RecordingLauncher {
    fn spawn_detached(&self, program: &Path, args: &[OsString], working_dir: &Path) -> io::Result<()> {
        if self.fail_spawn {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "not executable"));
        }
        self.launches.borrow_mut().push(Launch {
            program: program.to_path_buf(),
            args: args.to_vec(),
            working_dir: working_dir.to_path_buf(),
        });
        Ok(())
    }

    fn terminate_current(&self) {
        self.terminated.set(true);
    }
}

/// A pump whose history holds one finished session of `kind` with `result`.
async fn pump_after(kind: OperationKind, result: OperationResult, root: &Path) -> SessionPump {
    let mut pump = SessionPump::new(Handle::current());
    let session = OperationSession::new(
        kind,
        PatchParameters::new(root, "http://127.0.0.1:1/version.json"),
        Arc::new(ScriptedEngine { lines: 1, result }),
    );
    pump.start(&session).unwrap();
    pump_until_idle(&mut pump, 500).await;
    pump
}

fn make_updater(dir: &Path) -> PathBuf {
    let updater_dir = dir.join("SelfPatcher");
    std::fs::create_dir_all(&updater_dir).unwrap();
    let updater = updater_dir.join("SelfPatcher");
    std::fs::write(&updater, b"#!/bin/sh\n").unwrap();
    updater
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_updater_keeps_process_running() {
    let root = tempfile::tempdir().unwrap();
    let pump = pump_after(OperationKind::SelfPatch, OperationResult::Success, root.path()).await;
    let mut handoff = SelfPatchHandoff::with_launcher(RecordingLauncher::default());

    let missing = root.path().join("SelfPatcher").join("SelfPatcher");
    let err = handoff.execute(&pump, &missing, None).unwrap_err();

    assert!(matches!(err, HandoffError::UpdaterMissing(ref p) if *p == missing), "got {:?}", err);
    assert_eq!(handoff.state(), HandoffState::NotTriggered);
    assert!(handoff.launcher().launches.borrow().is_empty());
    assert!(!handoff.launcher().terminated.get());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_successful_patch_launches_updater_and_terminates() {
    let root = tempfile::tempdir().unwrap();
    let tools = tempfile::tempdir().unwrap();
    let updater = make_updater(tools.path());
    let relaunch = root.path().join("Game");

    let pump = pump_after(OperationKind::SelfPatch, OperationResult::Success, root.path()).await;
    let mut handoff = SelfPatchHandoff::with_launcher(RecordingLauncher::default());
    handoff.execute(&pump, &updater, Some(&relaunch)).unwrap();

    assert_eq!(handoff.state(), HandoffState::ProcessLaunched);
    assert!(handoff.launcher().terminated.get());
    assert_eq!(
        *handoff.launcher().launches.borrow(),
        vec![Launch {
            program: updater.clone(),
            args: vec![
                root.path().as_os_str().to_os_string(),
                relaunch.as_os_str().to_os_string(),
            ],
            working_dir: tools.path().join("SelfPatcher"),
        }]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_updater_without_relaunch_gets_root_only() {
    let root = tempfile::tempdir().unwrap();
    let tools = tempfile::tempdir().unwrap();
    let updater = make_updater(tools.path());

    let pump = pump_after(OperationKind::ApplyPatch, OperationResult::Success, root.path()).await;
    let mut handoff = SelfPatchHandoff::with_launcher(RecordingLauncher::default());
    handoff.execute(&pump, &updater, None).unwrap();

    let launches = handoff.launcher().launches.borrow();
    assert_eq!(launches[0].args, vec![root.path().as_os_str().to_os_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_launch_failure_is_not_fatal() {
    let root = tempfile::tempdir().unwrap();
    let tools = tempfile::tempdir().unwrap();
    let updater = make_updater(tools.path());

    let pump = pump_after(OperationKind::SelfPatch, OperationResult::Success, root.path()).await;
    let mut handoff = SelfPatchHandoff::with_launcher(RecordingLauncher::failing());
    let err = handoff.execute(&pump, &updater, None).unwrap_err();

    assert!(matches!(err, HandoffError::LaunchFailed { .. }), "got {:?}", err);
    assert_eq!(handoff.state(), HandoffState::NotTriggered);
    assert!(!handoff.launcher().terminated.get());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_patch_blocks_handoff() {
    let root = tempfile::tempdir().unwrap();
    let tools = tempfile::tempdir().unwrap();
    let updater = make_updater(tools.path());

    let pump = pump_after(
        OperationKind::SelfPatch,
        OperationResult::Failed("checksum mismatch".to_string()),
        root.path(),
    )
    .await;
    let mut handoff = SelfPatchHandoff::with_launcher(RecordingLauncher::default());
    let err = handoff.execute(&pump, &updater, None).unwrap_err();

    assert!(matches!(err, HandoffError::NoSuccessfulPatch), "got {:?}", err);
    assert_eq!(handoff.state(), HandoffState::NotTriggered);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_check_only_session_is_not_a_patch() {
    let root = tempfile::tempdir().unwrap();
    let tools = tempfile::tempdir().unwrap();
    let updater = make_updater(tools.path());

    let pump = pump_after(OperationKind::CheckForUpdates, OperationResult::Success, root.path()).await;
    let mut handoff = SelfPatchHandoff::with_launcher(RecordingLauncher::default());
    let err = handoff.execute(&pump, &updater, None).unwrap_err();
    assert!(matches!(err, HandoffError::NoSuccessfulPatch), "got {:?}", err);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handoff_refused_while_session_runs() {
    let root = tempfile::tempdir().unwrap();
    let other = tempfile::tempdir().unwrap();
    let tools = tempfile::tempdir().unwrap();
    let updater = make_updater(tools.path());

    let mut pump = pump_after(OperationKind::SelfPatch, OperationResult::Success, root.path()).await;
    let gate = Arc::new(Notify::new());
    let running = OperationSession::new(
        OperationKind::CheckForUpdates,
        PatchParameters::new(other.path(), "http://127.0.0.1:1/version.json"),
        Arc::new(GateEngine {
            gate: Arc::clone(&gate),
        }),
    );
    pump.start(&running).unwrap();

    let mut handoff = SelfPatchHandoff::with_launcher(RecordingLauncher::default());
    let err = handoff.execute(&pump, &updater, None).unwrap_err();
    assert!(matches!(err, HandoffError::SessionRunning), "got {:?}", err);
    assert_eq!(handoff.state(), HandoffState::NotTriggered);

    gate.notify_one();
    pump_until_idle(&mut pump, 500).await;
    handoff.execute(&pump, &updater, None).unwrap();
    assert_eq!(handoff.state(), HandoffState::ProcessLaunched);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handoff_runs_at_most_once() {
    let root = tempfile::tempdir().unwrap();
    let tools = tempfile::tempdir().unwrap();
    let updater = make_updater(tools.path());

    let pump = pump_after(OperationKind::SelfPatch, OperationResult::Success, root.path()).await;
    let mut handoff = SelfPatchHandoff::with_launcher(RecordingLauncher::default());
    handoff.execute(&pump, &updater, None).unwrap();

    let err = handoff.execute(&pump, &updater, None).unwrap_err();
    assert!(matches!(err, HandoffError::AlreadyTriggered), "got {:?}", err);
    assert_eq!(handoff.launcher().launches.borrow().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_launch_app_requires_existing_executable() {
    let root = tempfile::tempdir().unwrap();
    let pump = SessionPump::new(Handle::current());
    let mut handoff = SelfPatchHandoff::with_launcher(RecordingLauncher::default());

    let missing = root.path().join("Game");
    let err = handoff.launch_app(&pump, &missing).unwrap_err();
    assert!(matches!(err, HandoffError::ExecutableMissing(_)), "got {:?}", err);
    assert_eq!(handoff.state(), HandoffState::NotTriggered);

    std::fs::write(&missing, b"binary").unwrap();
    handoff.launch_app(&pump, &missing).unwrap();
    assert_eq!(handoff.state(), HandoffState::ProcessLaunched);
    assert!(handoff.launcher().terminated.get());

    let launches = handoff.launcher().launches.borrow();
    assert!(launches[0].args.is_empty());
    assert_eq!(launches[0].working_dir, root.path());
}
