use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::Deserialize;

use patchpump_core::progress::{format_bytes, SpeedTracker};
use patchpump_core::session::{OperationContext, PatchEngine};
use patchpump_core::types::types::{
    DownloadError, OperationKind, OperationResult, PatchMethod, PatchStage, ProgressKind,
    ProgressSample, VersionInfo,
};

/// File under the installation root holding the installed version.
pub const VERSION_FILE: &str = "version.txt";

/// Directory under the installation root where patches are staged.
pub const STAGING_DIR: &str = ".patchpump";

/// Log file written under `STAGING_DIR` when `log_to_file` is set.
pub const LOG_FILE: &str = "patchpump.log";

/// Marker held under `STAGING_DIR` while a patch runs.
const INSTANCE_LOCK: &str = "patch.lock";

/// The remote version-info document.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteVersion {
    pub version: String,
    pub patch_url: String,
    #[serde(default)]
    pub patch_size: Option<u64>,
}

/// Minimal engine: compares `<root>/version.txt` against a remote JSON
/// version document and, for patch runs, stages the advertised patch file.
#[derive(Debug, Default)]
pub struct RemoteVersionEngine;

impl RemoteVersionEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PatchEngine for RemoteVersionEngine {
    async fn run(&self, kind: OperationKind, ctx: OperationContext) -> OperationResult {
        match run_operation(kind, &ctx).await {
            Ok(result) => result,
            Err(EngineError::Download(e)) if e.is_cancelled() => OperationResult::Cancelled,
            Err(e) => OperationResult::Failed(e.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum EngineError {
    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("{0}")]
    Rejected(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn overall(ctx: &OperationContext, percentage: f32, stage: &str) {
    ctx.report_progress(ProgressKind::Overall, ProgressSample::new(percentage, stage));
}

async fn run_operation(
    kind: OperationKind,
    ctx: &OperationContext,
) -> Result<OperationResult, EngineError> {
    let params = ctx.parameters();
    let transport = ctx.transport()?;

    ctx.stage_changed(PatchStage::CheckingUpdates);
    overall(ctx, 0.0, "fetching version info");
    ctx.log(format!("Fetching version info from {}", params.version_info_url));
    let raw = transport.fetch_text(&params.version_info_url).await?;
    if !ctx.hooks().verify_version_info(&raw) {
        return Err(EngineError::Rejected(
            "version info failed verification".to_string(),
        ));
    }
    let info: RemoteVersion = serde_json::from_str(&raw)
        .map_err(|e| EngineError::Rejected(format!("malformed version info: {}", e)))?;

    ctx.version_info_fetched(VersionInfo::new(info.version.clone()));

    let installed = installed_version(&params.root_path).await?;
    ctx.versions_determined(installed.as_deref().unwrap_or("none"), info.version.as_str());
    if installed.as_deref() == Some(info.version.as_str()) {
        ctx.stage_changed(PatchStage::Done);
        overall(ctx, 100.0, "up to date");
        return Ok(OperationResult::AlreadyUpToDate);
    }

    if kind == OperationKind::CheckForUpdates {
        ctx.log(format!("Update available: {}", info.version));
        ctx.stage_changed(PatchStage::Done);
        overall(ctx, 100.0, "update available");
        return Ok(OperationResult::Success);
    }

    if let Some(size) = info.patch_size {
        let free = ctx.hooks().available_space(&params.root_path);
        if free < size {
            return Err(EngineError::Rejected(format!(
                "not enough free space: need {}, have {}",
                format_bytes(size),
                format_bytes(free)
            )));
        }
    }
    if ctx.is_cancelled() {
        return Ok(OperationResult::Cancelled);
    }

    tokio::fs::create_dir_all(params.root_path.join(STAGING_DIR)).await?;
    let _instance = if params.check_for_multiple_running_instances {
        Some(InstanceLock::acquire(&params.root_path)?)
    } else {
        None
    };

    ctx.method_changed(PatchMethod::InstallerPatch);
    ctx.stage_changed(PatchStage::DownloadingFiles);
    overall(ctx, 25.0, "downloading patch");
    let staged = stage_path(&params.root_path, &info.version);

    let tracker = Mutex::new(SpeedTracker::new());
    let on_progress = |received: u64, expected: Option<u64>| {
        let snapshot = tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update(received, expected);
        ctx.report_progress(ProgressKind::Current, snapshot.to_sample("patch"));
    };
    let written = transport
        .fetch_to_file(&info.patch_url, &staged, &on_progress)
        .await?;
    ctx.log(format!("Downloaded {} to {}", format_bytes(written), staged.display()));

    if let Some(size) = info.patch_size {
        if written != size {
            return Err(EngineError::Rejected(format!(
                "patch size mismatch: expected {} bytes, got {}",
                size, written
            )));
        }
    }

    ctx.stage_changed(PatchStage::UpdatingFiles);
    overall(ctx, 90.0, "recording version");
    tokio::fs::write(params.root_path.join(VERSION_FILE), &info.version).await?;
    ctx.log(format!("Now at version {}", info.version));
    ctx.stage_changed(PatchStage::Done);
    overall(ctx, 100.0, "done");
    Ok(OperationResult::Success)
}

/// Refuses a second patcher on the same installation, including one in
/// another process. Removed on drop.
struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    fn acquire(root: &Path) -> Result<Self, EngineError> {
        let path = root.join(STAGING_DIR).join(INSTANCE_LOCK);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(EngineError::Rejected(format!(
                    "another instance is already patching {}",
                    root.display()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("[RemoteVersionEngine] cannot remove {}: {}", self.path.display(), e);
        }
    }
}

async fn installed_version(root: &Path) -> Result<Option<String>, EngineError> {
    match tokio::fs::read_to_string(root.join(VERSION_FILE)).await {
        Ok(contents) => Ok(Some(contents.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn stage_path(root: &Path, version: &str) -> PathBuf {
    root.join(STAGING_DIR).join(format!("patch-{}.bin", version))
}
