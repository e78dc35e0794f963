use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};

use patchpump_core::config::load_parameters;
use patchpump_core::handoff::{default_updater_path, SelfPatchHandoff};
use patchpump_core::progress::FileLogObserver;
use patchpump_core::pump::SessionPump;
use patchpump_core::types::types::{OperationKind, OperationResult, PatchParameters};

mod remote_engine;
mod terminal_observer;
use remote_engine::{RemoteVersionEngine, LOG_FILE, STAGING_DIR};
use terminal_observer::TerminalObserver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Check,
    Apply,
    SelfPatch,
}

impl From<Mode> for OperationKind {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Check => OperationKind::CheckForUpdates,
            Mode::Apply => OperationKind::ApplyPatch,
            Mode::SelfPatch => OperationKind::SelfPatch,
        }
    }
}

#[derive(Parser)]
#[command(name = "patchpump", about = "Check for and apply application patches")]
struct Args {
    /// Installation root to check or patch
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// URL of the version info document
    #[arg(short, long)]
    url: Option<String>,

    /// JSON file with patch parameters; --root and --url override its values
    #[arg(short, long)]
    params: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = Mode::Check)]
    mode: Mode,

    /// Updater executable for self-patching (default: SelfPatcher/ next to this binary)
    #[arg(long)]
    updater: Option<PathBuf>,

    /// Do not ask the updater to relaunch this binary
    #[arg(long)]
    no_relaunch: bool,

    /// Milliseconds between host loop frames
    #[arg(long, env = "PATCHPUMP_FRAME_MS", default_value_t = 50)]
    frame_ms: u64,
}

fn resolve_parameters(args: &Args) -> Result<PatchParameters, String> {
    let mut params = match &args.params {
        Some(path) => load_parameters(path).map_err(|e| e.to_string())?,
        None => {
            let root = args.root.clone().ok_or("--root is required without --params")?;
            let url = args.url.clone().ok_or("--url is required without --params")?;
            PatchParameters::new(root, url)
        }
    };
    if let Some(root) = &args.root {
        params.root_path = root.clone();
    }
    if let Some(url) = &args.url {
        params.version_info_url = url.clone();
    }
    Ok(params)
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let params = match resolve_parameters(&args) {
        Ok(params) => params,
        Err(e) => {
            eprintln!("Invalid arguments: {}", e);
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupted.store(true, Ordering::SeqCst);
            }
        });
    }

    let mut pump = SessionPump::new(runtime.handle().clone());
    pump.subscribe_all(TerminalObserver::new());
    if params.log_to_file {
        let path = params.root_path.join(STAGING_DIR).join(LOG_FILE);
        match FileLogObserver::create(&path) {
            Ok(observer) => {
                pump.subscribe_all(observer);
            }
            Err(e) => log::warn!("not logging to {}: {}", path.display(), e),
        }
    }

    let kind = OperationKind::from(args.mode);
    let session = pump
        .create_session(kind, params, Arc::new(RemoteVersionEngine::new()))
        .build();
    if let Err(e) = pump.start(&session) {
        eprintln!("Could not start {}: {}", kind, e);
        return ExitCode::FAILURE;
    }

    // Host loop: one pump tick per frame until the session has reported.
    let frame = Duration::from_millis(args.frame_ms.max(1));
    let start = Instant::now();
    let mut cancel_sent = false;
    loop {
        if !cancel_sent && interrupted.load(Ordering::SeqCst) {
            eprintln!("Interrupted, cancelling...");
            pump.cancel_all();
            cancel_sent = true;
        }
        pump.tick();
        if !pump.has_active_sessions() {
            break;
        }
        std::thread::sleep(frame);
    }
    log::debug!("session finished after {:.2}s", start.elapsed().as_secs_f64());

    match session.result() {
        Some(OperationResult::Success) if kind == OperationKind::SelfPatch => {
            if !session.parameters().is_self_patching_app {
                return ExitCode::SUCCESS;
            }
            hand_off(&pump, &args, &session.parameters().self_patcher_executable)
        }
        Some(OperationResult::Success) | Some(OperationResult::AlreadyUpToDate) => {
            ExitCode::SUCCESS
        }
        Some(OperationResult::Cancelled) => ExitCode::from(130),
        Some(OperationResult::Failed(_)) | None => ExitCode::FAILURE,
    }
}

/// Launches the updater and exits. Only returns if the handoff failed.
fn hand_off(pump: &SessionPump, args: &Args, executable_name: &str) -> ExitCode {
    let updater = match &args.updater {
        Some(path) => path.clone(),
        None => match default_updater_path(executable_name) {
            Ok(path) => path,
            Err(e) => {
                eprintln!("Cannot locate updater: {}", e);
                return ExitCode::FAILURE;
            }
        },
    };
    let relaunch = if args.no_relaunch {
        None
    } else {
        std::env::current_exe().ok()
    };

    println!("Handing off to {}", updater.display());
    let mut handoff = SelfPatchHandoff::new();
    match handoff.execute(pump, &updater, relaunch.as_deref()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Self-patch handoff failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
