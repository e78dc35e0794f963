use std::collections::HashMap;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use patchpump_core::progress::{SessionEvent, SessionObserver};
use patchpump_core::types::types::{OperationResult, ProgressKind, SessionId};

/// Renders session events as indicatif terminal bars.
///
/// Each session gets a bar per progress channel, created on its first sample.
/// Log lines are printed above the bars so they do not tear the display.
pub struct TerminalObserver {
    multi: MultiProgress,
    bars: HashMap<(SessionId, ProgressKind), ProgressBar>,
}

impl TerminalObserver {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    fn bar(&mut self, session: SessionId, channel: ProgressKind) -> &ProgressBar {
        let multi = &self.multi;
        self.bars.entry((session, channel)).or_insert_with(|| {
            let template = match channel {
                ProgressKind::Current => "  {prefix:>8} [{bar:30.cyan/blue}] {pos:>3}% {msg}",
                ProgressKind::Overall => "  {prefix:>8} [{bar:30.green/white}] {pos:>3}% {msg}",
            };
            let style = ProgressStyle::with_template(template)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-");
            let pb = multi.add(ProgressBar::new(100));
            pb.set_style(style);
            pb.set_prefix(match channel {
                ProgressKind::Current => "current",
                ProgressKind::Overall => "overall",
            });
            pb
        })
    }

    fn println(&self, line: String) {
        if self.multi.println(&line).is_err() {
            println!("{}", line);
        }
    }

    fn close_bars(&mut self, session: SessionId, result: &OperationResult) {
        for channel in ProgressKind::ALL {
            if let Some(pb) = self.bars.remove(&(session, channel)) {
                match result {
                    OperationResult::Success | OperationResult::AlreadyUpToDate => {
                        pb.set_position(100);
                        pb.finish_with_message("done");
                    }
                    other => {
                        let reason = other.fail_details().unwrap_or("stopped");
                        pb.abandon_with_message(format!("Error: {}", reason));
                    }
                }
            }
        }
    }
}

impl Default for TerminalObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionObserver for TerminalObserver {
    fn on_event(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Started { kind, .. } => {
                self.println(format!("Starting {}", kind));
            }
            SessionEvent::Log { entry, .. } => {
                self.println(format!("  {}", entry));
            }
            SessionEvent::StageChanged { .. }
            | SessionEvent::MethodChanged { .. }
            | SessionEvent::VersionInfoFetched { .. }
            | SessionEvent::VersionsDetermined { .. } => {
                if let Some(line) = event.describe() {
                    self.println(format!("  * {}", line));
                }
            }
            SessionEvent::Progress {
                session,
                channel,
                sample,
            } => {
                let pb = self.bar(*session, *channel);
                pb.set_position(sample.percentage.round() as u64);
                pb.set_message(sample.info.clone());
            }
            SessionEvent::Finished {
                session,
                kind,
                result,
            } => {
                self.close_bars(*session, result);
                let line = match result {
                    OperationResult::Success => format!("{} completed", kind),
                    OperationResult::AlreadyUpToDate => format!("{}: already up to date", kind),
                    OperationResult::Cancelled => format!("{} cancelled", kind),
                    OperationResult::Failed(reason) => format!("{} failed: {}", kind, reason),
                };
                self.println(line);
            }
        }
    }
}
