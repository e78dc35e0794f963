//! Replacing the running executable.
//!
//! A successful self-patch leaves files the running process cannot overwrite.
//! `SelfPatchHandoff` launches an external updater that outlives this process,
//! then ends this process. The platform-specific part is confined to
//! `ProcessLauncher`.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::pump::SessionPump;
use crate::types::types::HandoffError;

/// Directory next to the executable that holds the self patcher.
pub const SELF_PATCHER_DIRECTORY: &str = "SelfPatcher";

/// The only process management the handoff needs.
pub trait ProcessLauncher {
    /// Start `program` so that it survives the current process exiting.
    fn spawn_detached(&self, program: &Path, args: &[OsString], working_dir: &Path)
        -> io::Result<()>;

    /// End the current process. The system implementation never returns.
    fn terminate_current(&self);
}

/// `ProcessLauncher` backed by `std::process`.
#[derive(Debug, Default)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn spawn_detached(
        &self,
        program: &Path,
        args: &[OsString],
        working_dir: &Path,
    ) -> io::Result<()> {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        detach(&mut command);

        // Dropping the Child neither waits for nor kills the process.
        let child = command.spawn()?;
        log::info!(
            "[SystemLauncher] started {} (pid {})",
            program.display(),
            child.id()
        );
        Ok(())
    }

    fn terminate_current(&self) {
        log::info!("[SystemLauncher] terminating current process");
        log::logger().flush();
        std::process::exit(0);
    }
}

#[cfg(unix)]
fn detach(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    // Own process group: terminal signals aimed at the host do not reach it.
    command.process_group(0);
}

#[cfg(windows)]
fn detach(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn detach(_command: &mut Command) {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffState {
    NotTriggered,
    Triggered,
    ProcessLaunched,
}

/// `NotTriggered -> Triggered -> ProcessLaunched -> (process exits)`.
///
/// Every failure before the launch succeeds drops back to `NotTriggered`
/// and leaves the current process running.
pub struct SelfPatchHandoff<L: ProcessLauncher = SystemLauncher> {
    launcher: L,
    state: HandoffState,
}

impl SelfPatchHandoff<SystemLauncher> {
    pub fn new() -> Self {
        Self::with_launcher(SystemLauncher)
    }
}

impl Default for SelfPatchHandoff<SystemLauncher> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ProcessLauncher> SelfPatchHandoff<L> {
    pub fn with_launcher(launcher: L) -> Self {
        Self {
            launcher,
            state: HandoffState::NotTriggered,
        }
    }

    pub fn state(&self) -> HandoffState {
        self.state
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Launch the updater for the installation patched by the pump's most
    /// recent successful patch session, then terminate this process.
    ///
    /// The updater receives the installation root and, if given, the
    /// executable to relaunch once it is done.
    pub fn execute(
        &mut self,
        pump: &SessionPump,
        updater_path: &Path,
        relaunch_target: Option<&Path>,
    ) -> Result<(), HandoffError> {
        self.check_ready(pump)?;

        let outcome = pump
            .last_patch_outcome()
            .filter(|o| o.result.is_success())
            .ok_or(HandoffError::NoSuccessfulPatch)?;

        self.state = HandoffState::Triggered;
        if !updater_path.is_file() {
            log::error!(
                "[SelfPatchHandoff::execute] updater missing at {}",
                updater_path.display()
            );
            self.state = HandoffState::NotTriggered;
            return Err(HandoffError::UpdaterMissing(updater_path.to_path_buf()));
        }

        let args = updater_arguments(&outcome.root_path, relaunch_target);
        self.launch_and_terminate(updater_path, &args)
    }

    /// Start `executable` from its own directory and terminate this process.
    pub fn launch_app(&mut self, pump: &SessionPump, executable: &Path) -> Result<(), HandoffError> {
        self.check_ready(pump)?;

        self.state = HandoffState::Triggered;
        if !executable.is_file() {
            log::error!(
                "[SelfPatchHandoff::launch_app] executable missing at {}",
                executable.display()
            );
            self.state = HandoffState::NotTriggered;
            return Err(HandoffError::ExecutableMissing(executable.to_path_buf()));
        }

        self.launch_and_terminate(executable, &[])
    }

    fn check_ready(&self, pump: &SessionPump) -> Result<(), HandoffError> {
        if self.state != HandoffState::NotTriggered {
            return Err(HandoffError::AlreadyTriggered);
        }
        if pump.has_running_sessions() {
            return Err(HandoffError::SessionRunning);
        }
        Ok(())
    }

    fn launch_and_terminate(&mut self, program: &Path, args: &[OsString]) -> Result<(), HandoffError> {
        let working_dir = program
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        if let Err(source) = self.launcher.spawn_detached(program, args, working_dir) {
            log::error!(
                "[SelfPatchHandoff] failed to launch {}: {}",
                program.display(),
                source
            );
            self.state = HandoffState::NotTriggered;
            return Err(HandoffError::LaunchFailed {
                path: program.to_path_buf(),
                source,
            });
        }

        self.state = HandoffState::ProcessLaunched;
        self.launcher.terminate_current();
        Ok(())
    }
}

/// Command line for the updater: `<install_root> [<relaunch_target>]`.
pub fn updater_arguments(install_root: &Path, relaunch_target: Option<&Path>) -> Vec<OsString> {
    let mut args = vec![install_root.as_os_str().to_os_string()];
    if let Some(target) = relaunch_target {
        args.push(target.as_os_str().to_os_string());
    }
    args
}

/// `<dir of current executable>/SelfPatcher/<executable_name>`.
pub fn default_updater_path(executable_name: &str) -> io::Result<PathBuf> {
    let current = std::env::current_exe()?;
    let dir = current.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            "current executable has no parent directory",
        )
    })?;
    Ok(dir.join(SELF_PATCHER_DIRECTORY).join(executable_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updater_arguments_include_relaunch_only_when_requested() {
        let root = Path::new("/opt/game");
        assert_eq!(updater_arguments(root, None), vec![OsString::from("/opt/game")]);
        assert_eq!(
            updater_arguments(root, Some(Path::new("/opt/game/Game"))),
            vec![OsString::from("/opt/game"), OsString::from("/opt/game/Game")]
        );
    }

    #[test]
    fn default_updater_path_sits_next_to_current_exe() {
        let path = default_updater_path("SelfPatcher").unwrap();
        assert!(path.ends_with(Path::new(SELF_PATCHER_DIRECTORY).join("SelfPatcher")));
    }
}
