use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::config::{ProgressMode, PumpConfig};
use crate::progress::observer::{EventKind, SessionEvent, SessionObserver};
use crate::session::engine::{EngineHooks, PatchEngine};
use crate::session::operation_session::{OperationSession, SessionBuilder};
use crate::session::target_lock::TargetLocks;
use crate::types::types::{
    OperationKind, OperationResult, PatchParameters, ProgressKind, SessionError, SessionId,
};

/// Handle returned by `subscribe`; pass it to `unsubscribe` to stop delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Terminal state of the most recent `ApplyPatch`/`SelfPatch` session.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOutcome {
    pub session: SessionId,
    pub kind: OperationKind,
    pub result: OperationResult,
    pub root_path: PathBuf,
}

struct Registration {
    id: SubscriptionId,
    kinds: Vec<EventKind>,
    observer: Box<dyn SessionObserver>,
}

struct TrackedSession {
    session: OperationSession,
    announced: bool,
    reported: bool,
}

/// The host loop's single integration point with running operations.
///
/// Owned by the host loop and ticked exactly once per frame. `tick` only
/// drains data that is already buffered, so it never waits on a background
/// task. All observer callbacks run inside `tick`, on the calling thread.
///
/// # Delivery per session
///
/// | When                           | Event                                   |
/// |--------------------------------|-----------------------------------------|
/// | first tick after `start`       | `Started`                               |
/// | every tick                     | `Log` per line, in order                |
/// | every tick                     | stage/method/version notices, in order  |
/// | every tick                     | `Progress`, latest (or all) per kind    |
/// | tick that observes termination | final drain, then `Finished` once       |
pub struct SessionPump {
    runtime: Handle,
    config: PumpConfig,
    locks: TargetLocks,
    sessions: Vec<TrackedSession>,
    observers: Vec<Registration>,
    next_subscription: u64,
    last_patch: Option<PatchOutcome>,
}

impl SessionPump {
    /// Background work is spawned on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self::with_config(runtime, PumpConfig::default())
    }

    pub fn with_config(runtime: Handle, config: PumpConfig) -> Self {
        Self {
            runtime,
            config,
            locks: TargetLocks::new(),
            sessions: Vec::new(),
            observers: Vec::new(),
            next_subscription: 0,
            last_patch: None,
        }
    }

    pub fn config(&self) -> &PumpConfig {
        &self.config
    }

    /// A session builder preloaded with this pump's channel and transport config.
    pub fn create_session(
        &self,
        kind: OperationKind,
        parameters: PatchParameters,
        engine: Arc<dyn PatchEngine>,
    ) -> SessionBuilder {
        OperationSession::builder(kind, parameters, engine)
            .hooks(EngineHooks::new(self.config.transport.clone()))
            .channel_config(self.config.channel.clone())
    }

    /// Start `session` and begin forwarding its events on subsequent ticks.
    /// Rejected if the session was already started or its root is busy.
    pub fn start(&mut self, session: &OperationSession) -> Result<SessionId, SessionError> {
        if let Err(e) = session.start(&self.runtime, &self.locks) {
            log::warn!("[SessionPump::start] {} rejected: {}", session.kind(), e);
            return Err(e);
        }
        self.sessions.push(TrackedSession {
            session: session.clone(),
            announced: false,
            reported: false,
        });
        Ok(session.id())
    }

    pub fn subscribe(
        &mut self,
        kinds: &[EventKind],
        observer: impl SessionObserver + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.observers.push(Registration {
            id,
            kinds: kinds.to_vec(),
            observer: Box::new(observer),
        });
        id
    }

    pub fn subscribe_all(&mut self, observer: impl SessionObserver + 'static) -> SubscriptionId {
        self.subscribe(&EventKind::ALL, observer)
    }

    /// Returns false if `id` was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|r| r.id != id);
        self.observers.len() != before
    }

    /// Forward everything buffered since the previous tick.
    pub fn tick(&mut self) {
        for tracked in &mut self.sessions {
            let session = &tracked.session;
            // Read before draining: anything pushed before termination is
            // then guaranteed to be in this drain.
            let finished = session.is_finished();

            if !tracked.announced {
                tracked.announced = true;
                dispatch(
                    &mut self.observers,
                    &SessionEvent::Started {
                        session: session.id(),
                        kind: session.kind(),
                    },
                );
            }

            forward_buffered(&mut self.observers, session);

            if finished {
                if let Some(result) = session.result() {
                    if session.kind().is_patch() {
                        self.last_patch = Some(PatchOutcome {
                            session: session.id(),
                            kind: session.kind(),
                            result: result.clone(),
                            root_path: session.parameters().root_path.clone(),
                        });
                    }
                    dispatch(
                        &mut self.observers,
                        &SessionEvent::Finished {
                            session: session.id(),
                            kind: session.kind(),
                            result,
                        },
                    );
                    tracked.reported = true;
                }
            }
        }
        self.sessions.retain(|t| !t.reported);
    }

    pub fn session(&self, id: SessionId) -> Option<&OperationSession> {
        self.sessions
            .iter()
            .map(|t| &t.session)
            .find(|s| s.id() == id)
    }

    /// Sessions whose terminal result has not been delivered yet.
    pub fn active_sessions(&self) -> impl Iterator<Item = &OperationSession> {
        self.sessions.iter().map(|t| &t.session)
    }

    pub fn has_active_sessions(&self) -> bool {
        !self.sessions.is_empty()
    }

    pub fn has_running_sessions(&self) -> bool {
        self.sessions.iter().any(|t| t.session.is_running())
    }

    pub fn is_target_running(&self, root: &Path) -> bool {
        self.locks.is_held(root)
    }

    /// Returns false if no tracked session has this id.
    pub fn cancel(&self, id: SessionId) -> bool {
        match self.session(id) {
            Some(session) => {
                session.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for tracked in &self.sessions {
            tracked.session.cancel();
        }
    }

    pub fn last_patch_outcome(&self) -> Option<&PatchOutcome> {
        self.last_patch.as_ref()
    }
}

fn forward_buffered(observers: &mut [Registration], session: &OperationSession) {
    let id = session.id();
    for entry in session.drain_logs() {
        dispatch(observers, &SessionEvent::Log { session: id, entry });
    }
    for notice in session.channel().drain_notices() {
        dispatch(observers, &SessionEvent::from_notice(id, notice));
    }

    for channel in ProgressKind::ALL {
        let samples: Vec<_> = match session.channel().progress_mode() {
            ProgressMode::LatestOnly => session.drain_progress(channel).into_iter().collect(),
            ProgressMode::FullHistory => session.channel().drain_progress_history(channel),
        };
        for sample in samples {
            dispatch(
                observers,
                &SessionEvent::Progress {
                    session: id,
                    channel,
                    sample,
                },
            );
        }
    }
}

fn dispatch(observers: &mut [Registration], event: &SessionEvent) {
    let kind = event.kind();
    for registration in observers.iter_mut() {
        if registration.kinds.contains(&kind) {
            registration.observer.on_event(event);
        }
    }
}
