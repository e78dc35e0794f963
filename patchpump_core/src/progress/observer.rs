use std::fs::{File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};

use crate::types::types::{
    LogEntry, OperationKind, OperationResult, PatchMethod, PatchNotice, PatchStage, ProgressKind,
    ProgressSample, SessionId, VersionInfo,
};

/// Everything the `SessionPump` forwards to observers during a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started {
        session: SessionId,
        kind: OperationKind,
    },
    Log {
        session: SessionId,
        entry: LogEntry,
    },
    StageChanged {
        session: SessionId,
        stage: PatchStage,
    },
    MethodChanged {
        session: SessionId,
        method: PatchMethod,
    },
    VersionInfoFetched {
        session: SessionId,
        info: VersionInfo,
    },
    VersionsDetermined {
        session: SessionId,
        current: String,
        new: String,
    },
    Progress {
        session: SessionId,
        channel: ProgressKind,
        sample: ProgressSample,
    },
    Finished {
        session: SessionId,
        kind: OperationKind,
        result: OperationResult,
    },
}

impl SessionEvent {
    pub(crate) fn from_notice(session: SessionId, notice: PatchNotice) -> Self {
        match notice {
            PatchNotice::StageChanged(stage) => SessionEvent::StageChanged { session, stage },
            PatchNotice::MethodChanged(method) => SessionEvent::MethodChanged { session, method },
            PatchNotice::VersionInfoFetched(info) => {
                SessionEvent::VersionInfoFetched { session, info }
            }
            PatchNotice::VersionsDetermined { current, new } => SessionEvent::VersionsDetermined {
                session,
                current,
                new,
            },
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Started { .. } => EventKind::Started,
            SessionEvent::Log { .. } => EventKind::Log,
            SessionEvent::StageChanged { .. } => EventKind::StageChanged,
            SessionEvent::MethodChanged { .. } => EventKind::MethodChanged,
            SessionEvent::VersionInfoFetched { .. } => EventKind::VersionInfoFetched,
            SessionEvent::VersionsDetermined { .. } => EventKind::VersionsDetermined,
            SessionEvent::Progress { .. } => EventKind::Progress,
            SessionEvent::Finished { .. } => EventKind::Finished,
        }
    }

    pub fn session(&self) -> SessionId {
        match self {
            SessionEvent::Started { session, .. }
            | SessionEvent::Log { session, .. }
            | SessionEvent::StageChanged { session, .. }
            | SessionEvent::MethodChanged { session, .. }
            | SessionEvent::VersionInfoFetched { session, .. }
            | SessionEvent::VersionsDetermined { session, .. }
            | SessionEvent::Progress { session, .. }
            | SessionEvent::Finished { session, .. } => *session,
        }
    }

    /// One-line description, as written by the log observers. `None` for
    /// progress, which is too chatty for a log.
    pub fn describe(&self) -> Option<String> {
        let line = match self {
            SessionEvent::Started { kind, .. } => format!("{} started", kind),
            SessionEvent::Log { entry, .. } => entry.line.clone(),
            SessionEvent::StageChanged { stage, .. } => format!("stage: {:?}", stage),
            SessionEvent::MethodChanged { method, .. } => format!("patch method: {:?}", method),
            SessionEvent::VersionInfoFetched { info, .. } => format!(
                "version info fetched: {} ({} ignored paths)",
                info.version,
                info.ignored_paths.len()
            ),
            SessionEvent::VersionsDetermined { current, new, .. } => {
                format!("current version: {}, new version: {}", current, new)
            }
            SessionEvent::Progress { .. } => return None,
            SessionEvent::Finished { kind, result, .. } => match result.fail_details() {
                Some(details) => format!("{} failed: {}", kind, details),
                None => format!("{} finished: {:?}", kind, result),
            },
        };
        Some(line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Started,
    Log,
    StageChanged,
    MethodChanged,
    VersionInfoFetched,
    VersionsDetermined,
    Progress,
    Finished,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::Started,
        EventKind::Log,
        EventKind::StageChanged,
        EventKind::MethodChanged,
        EventKind::VersionInfoFetched,
        EventKind::VersionsDetermined,
        EventKind::Progress,
        EventKind::Finished,
    ];
}

/// Receives session events on the host thread.
///
/// Called synchronously from `SessionPump::tick`, in registration order, so
/// implementations need no synchronization of their own and need not be `Send`.
pub trait SessionObserver {
    fn on_event(&mut self, event: &SessionEvent);
}

impl<F> SessionObserver for F
where
    F: FnMut(&SessionEvent),
{
    fn on_event(&mut self, event: &SessionEvent) {
        self(event)
    }
}

/// Mirrors session events into the `log` facade.
#[derive(Debug, Default)]
pub struct LogObserver;

impl SessionObserver for LogObserver {
    fn on_event(&mut self, event: &SessionEvent) {
        let session = event.session();
        match event {
            SessionEvent::Progress {
                channel, sample, ..
            } => {
                log::debug!(
                    "[session {}] {:?} {:.1}% {}",
                    session,
                    channel,
                    sample.percentage,
                    sample.info
                );
            }
            SessionEvent::Finished { result, .. } if result.fail_details().is_some() => {
                if let Some(line) = event.describe() {
                    log::error!("[session {}] {}", session, line);
                }
            }
            _ => {
                if let Some(line) = event.describe() {
                    log::info!("[session {}] {}", session, line);
                }
            }
        }
    }
}

/// Appends every non-progress event to a log file, one line each.
///
/// Write failures are reported once through `log` and then ignored, so a
/// full disk never disturbs the host loop.
pub struct FileLogObserver {
    path: PathBuf,
    writer: LineWriter<File>,
    failed: bool,
}

impl FileLogObserver {
    /// Opens `path` for appending, creating it and its parent directories.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: LineWriter::new(file),
            failed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionObserver for FileLogObserver {
    fn on_event(&mut self, event: &SessionEvent) {
        let Some(line) = event.describe() else {
            return;
        };
        if let Err(e) = writeln!(self.writer, "[{}] {}", event.session(), line) {
            if !self.failed {
                log::warn!("[FileLogObserver] cannot write {}: {}", self.path.display(), e);
                self.failed = true;
            }
        }
    }
}
