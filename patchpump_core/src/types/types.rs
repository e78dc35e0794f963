use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a session asks the patch engine to do. Fixed for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    CheckForUpdates,
    ApplyPatch,
    SelfPatch,
}

impl OperationKind {
    /// True for the operations that modify the installation.
    pub fn is_patch(self) -> bool {
        matches!(self, OperationKind::ApplyPatch | OperationKind::SelfPatch)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::CheckForUpdates => "check-for-updates",
            OperationKind::ApplyPatch => "apply-patch",
            OperationKind::SelfPatch => "self-patch",
        };
        f.write_str(name)
    }
}

/// Terminal outcome of one operation. Set once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationResult {
    Success,
    AlreadyUpToDate,
    Failed(String),
    Cancelled,
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationResult::Success)
    }

    /// Human-readable failure description, if the operation did not succeed.
    pub fn fail_details(&self) -> Option<&str> {
        match self {
            OperationResult::Failed(details) => Some(details),
            OperationResult::Cancelled => Some("operation cancelled"),
            _ => None,
        }
    }
}

/// The two independent progress streams an operation reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgressKind {
    /// The sub-operation currently in progress (e.g. one file download).
    Current,
    /// The operation as a whole.
    Overall,
}

impl ProgressKind {
    pub const ALL: [ProgressKind; 2] = [ProgressKind::Current, ProgressKind::Overall];

    pub(crate) fn index(self) -> usize {
        match self {
            ProgressKind::Current => 0,
            ProgressKind::Overall => 1,
        }
    }
}

/// One progress report: a percentage in `[0, 100]` and a short description.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSample {
    pub percentage: f32,
    pub info: String,
}

impl ProgressSample {
    /// Builds a sample, clamping the percentage into `[0, 100]` (NaN becomes 0).
    pub fn new(percentage: f32, info: impl Into<String>) -> Self {
        let percentage = if percentage.is_nan() {
            0.0
        } else {
            percentage.clamp(0.0, 100.0)
        };
        Self {
            percentage,
            info: info.into(),
        }
    }
}

/// A single log line emitted by an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub line: String,
}

impl LogEntry {
    pub fn new(line: impl Into<String>) -> Self {
        Self { line: line.into() }
    }

    /// Marker inserted in place of log lines discarded by a full channel.
    pub fn dropped_marker(count: usize) -> Self {
        Self::new(format!("... dropped {} log lines ...", count))
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

impl From<&str> for LogEntry {
    fn from(line: &str) -> Self {
        Self::new(line)
    }
}

impl From<String> for LogEntry {
    fn from(line: String) -> Self {
        Self::new(line)
    }
}

/// Phase the patch engine is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatchStage {
    CheckingUpdates,
    CheckingFileIntegrity,
    DeletingObsoleteFiles,
    CreatingFilesAndDirectories,
    DownloadingFiles,
    UpdatingFiles,
    Done,
}

/// Patch strategy the engine settled on for this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatchMethod {
    None,
    RepairPatch,
    IncrementalPatch,
    InstallerPatch,
}

/// The parts of a fetched version-info document the host cares about.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    /// Paths relative to the root that patching leaves untouched.
    pub ignored_paths: Vec<String>,
}

impl VersionInfo {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ignored_paths: Vec::new(),
        }
    }

    /// Adds `path` unless it is blank or already listed.
    pub fn add_ignored_path(&mut self, path: &str) {
        let path = path.trim();
        if !path.is_empty() && !self.ignored_paths.iter().any(|p| p == path) {
            self.ignored_paths.push(path.to_string());
        }
    }
}

/// Engine state changes that are neither log lines nor progress.
/// Delivered to the host in the order the engine reported them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchNotice {
    StageChanged(PatchStage),
    MethodChanged(PatchMethod),
    VersionInfoFetched(VersionInfo),
    VersionsDetermined { current: String, new: String },
}

/// Identifies one session for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameters handed to the patch engine for one target installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchParameters {
    /// Installation directory being patched. Sessions are exclusive per root.
    pub root_path: PathBuf,
    pub version_info_url: String,
    /// Compare only version numbers when checking for updates, not file hashes.
    pub check_version_only: bool,
    pub is_self_patching_app: bool,
    pub self_patcher_executable: String,
    pub use_repair_patch: bool,
    pub use_incremental_patch: bool,
    pub use_installer_patch: bool,
    pub verify_files_on_server: bool,
    /// Paths relative to `root_path` that the engine must leave alone.
    pub additional_ignored_paths: Vec<String>,
    /// Suppress all log lines from the operation.
    pub silent_mode: bool,
    /// Report progress samples while running.
    pub log_progress: bool,
    /// Abort if another process is already running or patching this installation.
    pub check_for_multiple_running_instances: bool,
    /// Append the operation's log to a file under the root.
    pub log_to_file: bool,
}

impl PatchParameters {
    pub fn new(root_path: impl Into<PathBuf>, version_info_url: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            version_info_url: version_info_url.into(),
            ..Self::default()
        }
    }
}

impl Default for PatchParameters {
    fn default() -> Self {
        Self {
            root_path: PathBuf::new(),
            version_info_url: String::new(),
            check_version_only: true,
            is_self_patching_app: true,
            self_patcher_executable: default_self_patcher_executable().to_string(),
            use_repair_patch: true,
            use_incremental_patch: true,
            use_installer_patch: true,
            verify_files_on_server: false,
            additional_ignored_paths: Vec::new(),
            silent_mode: false,
            log_progress: true,
            check_for_multiple_running_instances: true,
            log_to_file: true,
        }
    }
}

fn default_self_patcher_executable() -> &'static str {
    if cfg!(windows) {
        "SelfPatcher.exe"
    } else {
        "SelfPatcher"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("server responded with {status} for {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("disk error: {0}")]
    Disk(std::io::Error),

    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("download cancelled")]
    Cancelled,

    #[error("transport busy: another request is already in flight")]
    Busy,
}

impl DownloadError {
    /// True when the request ended because the caller asked it to.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session has already been started")]
    AlreadyStarted,

    #[error("an operation is already running for {}", .0.display())]
    TargetBusy(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("updater missing at {}", .0.display())]
    UpdaterMissing(PathBuf),

    #[error("executable missing at {}", .0.display())]
    ExecutableMissing(PathBuf),

    #[error("failed to launch {}: {source}", .path.display())]
    LaunchFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot hand off while an operation is still running")]
    SessionRunning,

    #[error("no successful patch operation to hand off")]
    NoSuccessfulPatch,

    #[error("handoff has already been triggered")]
    AlreadyTriggered,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
