use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::ChannelConfig;
use crate::progress::channel::ProgressChannel;
use crate::session::engine::{EngineHooks, OperationContext, PatchEngine};
use crate::session::target_lock::{TargetGuard, TargetLocks};
use crate::types::types::{
    LogEntry, OperationKind, OperationResult, PatchParameters, ProgressKind, ProgressSample,
    SessionError, SessionId,
};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const FINISHED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Finished,
}

/// State shared between the host-side handle and the background task.
pub(crate) struct SessionShared {
    pub(crate) id: SessionId,
    pub(crate) kind: OperationKind,
    pub(crate) parameters: PatchParameters,
    pub(crate) hooks: EngineHooks,
    pub(crate) channel: ProgressChannel,
    pub(crate) cancel_token: CancellationToken,
    state: AtomicU8,
    result: OnceLock<OperationResult>,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            IDLE => SessionState::Idle,
            RUNNING => SessionState::Running,
            _ => SessionState::Finished,
        }
    }

    /// Publishes the terminal result. Only the first call has any effect.
    fn finish(&self, result: OperationResult) {
        let result = if self.cancel_token.is_cancelled() && result != OperationResult::Cancelled {
            log::info!(
                "[OperationSession] {} {} returned {:?} after cancellation, recording as cancelled",
                self.kind,
                self.id,
                result
            );
            OperationResult::Cancelled
        } else {
            result
        };

        if self.result.set(result).is_ok() {
            self.state.store(FINISHED, Ordering::Release);
            log::info!("[OperationSession] {} {} finished", self.kind, self.id);
        }
    }
}

/// Publishes a result when the background task ends, however it ends, and
/// releases the target in the same step.
struct Completion {
    shared: Arc<SessionShared>,
    target: Option<TargetGuard>,
}

impl Completion {
    fn publish(&mut self, result: OperationResult) {
        let shared = &self.shared;
        match self.target.take() {
            Some(target) => target.release_after(|| shared.finish(result)),
            None => shared.finish(result),
        }
    }

    fn complete(mut self, result: OperationResult) {
        self.publish(result);
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.target.is_some() {
            self.publish(OperationResult::Failed(
                "operation was aborted before it reported a result".to_string(),
            ));
        }
    }
}

/// One run of the patch engine: `Idle -> Running -> Finished(result)`.
///
/// Cheap to clone; clones share state. The result is set exactly once and
/// can be read from any thread after the session finishes.
#[derive(Clone)]
pub struct OperationSession {
    shared: Arc<SessionShared>,
    engine: Arc<dyn PatchEngine>,
}

pub struct SessionBuilder {
    kind: OperationKind,
    parameters: PatchParameters,
    engine: Arc<dyn PatchEngine>,
    hooks: EngineHooks,
    channel: ChannelConfig,
}

impl SessionBuilder {
    pub fn hooks(mut self, hooks: EngineHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn channel_config(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    pub fn build(self) -> OperationSession {
        OperationSession {
            shared: Arc::new(SessionShared {
                id: SessionId::new(),
                kind: self.kind,
                parameters: self.parameters,
                hooks: self.hooks,
                channel: ProgressChannel::new(self.channel),
                cancel_token: CancellationToken::new(),
                state: AtomicU8::new(IDLE),
                result: OnceLock::new(),
            }),
            engine: self.engine,
        }
    }
}

impl OperationSession {
    pub fn builder(
        kind: OperationKind,
        parameters: PatchParameters,
        engine: Arc<dyn PatchEngine>,
    ) -> SessionBuilder {
        SessionBuilder {
            kind,
            parameters,
            engine,
            hooks: EngineHooks::default(),
            channel: ChannelConfig::default(),
        }
    }

    pub fn new(
        kind: OperationKind,
        parameters: PatchParameters,
        engine: Arc<dyn PatchEngine>,
    ) -> Self {
        Self::builder(kind, parameters, engine).build()
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn kind(&self) -> OperationKind {
        self.shared.kind
    }

    pub fn parameters(&self) -> &PatchParameters {
        &self.shared.parameters
    }

    pub fn hooks(&self) -> &EngineHooks {
        &self.shared.hooks
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub fn is_finished(&self) -> bool {
        self.state() == SessionState::Finished
    }

    /// The terminal result, once the session has finished.
    pub fn result(&self) -> Option<OperationResult> {
        if !self.is_finished() {
            return None;
        }
        self.shared.result.get().cloned()
    }

    pub fn fail_details(&self) -> Option<String> {
        self.result()
            .and_then(|r| r.fail_details().map(str::to_string))
    }

    pub fn channel(&self) -> &ProgressChannel {
        &self.shared.channel
    }

    pub fn drain_logs(&self) -> Vec<LogEntry> {
        self.shared.channel.drain_logs()
    }

    pub fn drain_progress(&self, kind: ProgressKind) -> Option<ProgressSample> {
        self.shared.channel.drain_progress(kind)
    }

    /// `Idle -> Running`: claims the target root and spawns the engine on
    /// `runtime`. Fails fast if this session was already started or another
    /// session is running for the same root.
    pub fn start(&self, runtime: &Handle, locks: &TargetLocks) -> Result<(), SessionError> {
        if self.state() != SessionState::Idle {
            return Err(SessionError::AlreadyStarted);
        }

        let target = locks.try_acquire(&self.shared.parameters.root_path)?;
        if self
            .shared
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::AlreadyStarted);
        }

        log::info!(
            "[OperationSession::start] {} {} for {}",
            self.shared.kind,
            self.shared.id,
            self.shared.parameters.root_path.display()
        );

        let completion = Completion {
            shared: Arc::clone(&self.shared),
            target: Some(target),
        };
        let engine = Arc::clone(&self.engine);
        let ctx = OperationContext::new(Arc::clone(&self.shared));
        let kind = self.shared.kind;

        runtime.spawn(async move {
            // The engine runs in its own task so a panic surfaces as a JoinError.
            let outcome = tokio::spawn(async move { engine.run(kind, ctx).await }).await;
            let result = match outcome {
                Ok(result) => result,
                Err(join_err) => {
                    log::error!("[OperationSession] patch engine task failed: {}", join_err);
                    OperationResult::Failed(format!("patch engine task failed: {}", join_err))
                }
            };
            completion.complete(result);
        });

        Ok(())
    }

    /// Ask a running session to stop. The engine observes this cooperatively
    /// and the session still ends in `Finished(Cancelled)`.
    pub fn cancel(&self) {
        if self.is_running() && !self.shared.cancel_token.is_cancelled() {
            log::info!(
                "[OperationSession::cancel] cancelling {} {}",
                self.shared.kind,
                self.shared.id
            );
            self.shared.cancel_token.cancel();
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.shared.cancel_token.is_cancelled()
    }

    /// A fresh `Idle` session with the same kind, parameters, engine and hooks.
    pub fn retry(&self) -> OperationSession {
        Self::builder(
            self.shared.kind,
            self.shared.parameters.clone(),
            Arc::clone(&self.engine),
        )
        .hooks(self.shared.hooks.clone())
        .channel_config(self.shared.channel.config().clone())
        .build()
    }
}
