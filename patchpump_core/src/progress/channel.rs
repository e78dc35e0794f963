use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::{ChannelConfig, ProgressMode};
use crate::types::types::{LogEntry, PatchNotice, ProgressKind, ProgressSample};

/// Hands log lines and progress samples from an operation's background task
/// to the single reader on the host thread.
///
/// Writers never wait on the reader: every call takes one short-lived lock.
/// Log lines and notices are kept in push order and delivered exactly once.
/// Progress is kept per `ProgressKind`, either latest-only or as full history
/// depending on `ChannelConfig::progress_mode`. Every queue is capped, so a
/// reader that falls behind costs bounded memory.
pub struct ProgressChannel {
    config: ChannelConfig,
    state: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    logs: VecDeque<LogEntry>,
    dropped_logs: usize,
    notices: VecDeque<PatchNotice>,
    progress: [VecDeque<ProgressSample>; 2],
}

impl ProgressChannel {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ChannelState::default()),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn progress_mode(&self) -> ProgressMode {
        self.config.progress_mode
    }

    // A panic on either side must not wedge the other, so poison is ignored.
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a log line. Lines beyond `max_pending_logs` are counted and
    /// replaced by a single marker on the next drain.
    pub fn push(&self, entry: impl Into<LogEntry>) {
        let mut state = self.lock();
        let cap = self.config.max_pending_logs;
        if cap > 0 && state.logs.len() >= cap {
            state.dropped_logs += 1;
            return;
        }
        state.logs.push_back(entry.into());
    }

    /// Queue an engine notice. Past `max_pending_logs` the oldest notice is
    /// discarded so the latest state always reaches the reader.
    pub fn push_notice(&self, notice: PatchNotice) {
        let mut state = self.lock();
        let cap = self.config.max_pending_logs;
        if cap > 0 && state.notices.len() >= cap {
            state.notices.pop_front();
            log::warn!("[ProgressChannel] notice queue full, discarding oldest notice");
        }
        state.notices.push_back(notice);
    }

    /// Queue a progress sample for `kind`. In `FullHistory` mode the oldest
    /// samples are discarded beyond `max_pending_progress`.
    pub fn push_progress(&self, kind: ProgressKind, sample: ProgressSample) {
        let mut state = self.lock();
        let queue = &mut state.progress[kind.index()];
        match self.config.progress_mode {
            ProgressMode::LatestOnly => queue.clear(),
            ProgressMode::FullHistory => {
                let cap = self.config.max_pending_progress;
                if cap > 0 {
                    while queue.len() >= cap {
                        queue.pop_front();
                    }
                }
            }
        }
        queue.push_back(sample);
    }

    /// Every log line pushed since the last drain, in push order.
    pub fn drain_logs(&self) -> Vec<LogEntry> {
        let mut state = self.lock();
        let mut drained: Vec<LogEntry> = state.logs.drain(..).collect();
        if state.dropped_logs > 0 {
            drained.push(LogEntry::dropped_marker(state.dropped_logs));
            state.dropped_logs = 0;
        }
        drained
    }

    /// Every notice pushed since the last drain, in push order.
    pub fn drain_notices(&self) -> Vec<PatchNotice> {
        self.lock().notices.drain(..).collect()
    }

    /// The newest sample of `kind` since the last drain of that kind.
    /// Older undrained samples of the same kind are discarded.
    pub fn drain_progress(&self, kind: ProgressKind) -> Option<ProgressSample> {
        let mut state = self.lock();
        let queue = &mut state.progress[kind.index()];
        let latest = queue.pop_back();
        queue.clear();
        latest
    }

    /// Every retained sample of `kind` since the last drain, oldest first.
    /// In `LatestOnly` mode this holds at most one sample.
    pub fn drain_progress_history(&self, kind: ProgressKind) -> Vec<ProgressSample> {
        let mut state = self.lock();
        state.progress[kind.index()].drain(..).collect()
    }

    pub fn pending_logs(&self) -> usize {
        self.lock().logs.len()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.lock();
        state.logs.is_empty()
            && state.dropped_logs == 0
            && state.notices.is_empty()
            && state.progress.iter().all(VecDeque::is_empty)
    }
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}
