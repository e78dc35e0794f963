use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::downloader::transport::{http_transport_factory, DownloadTransport, ProgressFn, TransportFactory};
use crate::session::operation_session::SessionShared;
use crate::types::types::{
    DownloadError, LogEntry, OperationKind, OperationResult, PatchMethod, PatchNotice,
    PatchParameters, PatchStage, ProgressKind, ProgressSample, SessionId, VersionInfo,
};

/// Checks a raw metadata document (version info, patch info) before use.
pub type DocumentVerifier = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Free bytes available on the drive holding the given path.
pub type FreeSpaceCalculator = Arc<dyn Fn(&Path) -> u64 + Send + Sync>;

/// The external patch engine: plans, downloads and applies updates.
///
/// `run` executes on a background task. It reports through `ctx` and must
/// return once `ctx.is_cancelled()` turns true, at its next checkpoint.
#[async_trait]
pub trait PatchEngine: Send + Sync + 'static {
    async fn run(&self, kind: OperationKind, ctx: OperationContext) -> OperationResult;
}

/// Pluggable collaborators handed to the engine.
#[derive(Clone)]
pub struct EngineHooks {
    version_info_verifier: Option<DocumentVerifier>,
    patch_info_verifier: Option<DocumentVerifier>,
    free_space: FreeSpaceCalculator,
    transport_factory: TransportFactory,
}

impl EngineHooks {
    /// Default hooks: no verifiers, unlimited free space, `HttpTransport`.
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            version_info_verifier: None,
            patch_info_verifier: None,
            free_space: Arc::new(|_| u64::MAX),
            transport_factory: http_transport_factory(transport),
        }
    }

    pub fn with_version_info_verifier(
        mut self,
        verifier: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.version_info_verifier = Some(Arc::new(verifier));
        self
    }

    pub fn with_patch_info_verifier(
        mut self,
        verifier: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.patch_info_verifier = Some(Arc::new(verifier));
        self
    }

    pub fn with_free_space_calculator(
        mut self,
        calculator: impl Fn(&Path) -> u64 + Send + Sync + 'static,
    ) -> Self {
        self.free_space = Arc::new(calculator);
        self
    }

    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = factory;
        self
    }

    /// Accepts everything when no verifier is installed.
    pub fn verify_version_info(&self, raw: &str) -> bool {
        self.version_info_verifier
            .as_ref()
            .map_or(true, |verify| verify(raw))
    }

    pub fn verify_patch_info(&self, raw: &str) -> bool {
        self.patch_info_verifier
            .as_ref()
            .map_or(true, |verify| verify(raw))
    }

    pub fn available_space(&self, path: &Path) -> u64 {
        (self.free_space)(path)
    }

    pub fn create_transport(&self) -> Result<Arc<dyn DownloadTransport>, DownloadError> {
        (self.transport_factory)()
    }
}

impl Default for EngineHooks {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

/// The engine's view of its session while it runs.
#[derive(Clone)]
pub struct OperationContext {
    shared: Arc<SessionShared>,
}

impl OperationContext {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub fn session_id(&self) -> SessionId {
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

    /// Queue a log line for observers. Dropped in silent mode.
    pub fn log(&self, line: impl Into<LogEntry>) {
        if !self.shared.parameters.silent_mode {
            self.shared.channel.push(line);
        }
    }

    /// Queue a progress sample. Dropped when progress reporting is off.
    pub fn report_progress(&self, kind: ProgressKind, sample: ProgressSample) {
        if self.shared.parameters.log_progress {
            self.shared.channel.push_progress(kind, sample);
        }
    }

    pub fn stage_changed(&self, stage: PatchStage) {
        self.shared.channel.push_notice(PatchNotice::StageChanged(stage));
    }

    pub fn method_changed(&self, method: PatchMethod) {
        self.shared.channel.push_notice(PatchNotice::MethodChanged(method));
    }

    /// Report the fetched version-info document. The session's
    /// `additional_ignored_paths` are merged into it first.
    pub fn version_info_fetched(&self, mut info: VersionInfo) {
        for path in &self.shared.parameters.additional_ignored_paths {
            info.add_ignored_path(path);
        }
        self.shared
            .channel
            .push_notice(PatchNotice::VersionInfoFetched(info));
    }

    pub fn versions_determined(&self, current: impl Into<String>, new: impl Into<String>) {
        self.shared.channel.push_notice(PatchNotice::VersionsDetermined {
            current: current.into(),
            new: new.into(),
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel_token.is_cancelled()
    }

    /// Resolves once the session has been asked to cancel.
    pub async fn cancelled(&self) {
        self.shared.cancel_token.cancelled().await
    }

    /// A transport bound to this session: cancelling the session aborts any
    /// request it has in flight, and refuses new ones.
    pub fn transport(&self) -> Result<Arc<dyn DownloadTransport>, DownloadError> {
        let inner = self.shared.hooks.create_transport()?;
        Ok(Arc::new(SessionTransport {
            inner,
            token: self.shared.cancel_token.clone(),
        }))
    }
}

struct SessionTransport {
    inner: Arc<dyn DownloadTransport>,
    token: CancellationToken,
}

impl SessionTransport {
    /// Runs `request` to completion; on session cancellation the inner
    /// transport is told to abort and the request is still awaited so it
    /// can close its resources.
    async fn guarded<T, F>(&self, request: F) -> Result<T, DownloadError>
    where
        F: Future<Output = Result<T, DownloadError>> + Send,
    {
        if self.token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        tokio::pin!(request);
        tokio::select! {
            biased;
            result = &mut request => result,
            _ = self.token.cancelled() => {
                self.inner.cancel();
                match request.await {
                    Ok(value) => Ok(value),
                    Err(_) => Err(DownloadError::Cancelled),
                }
            }
        }
    }
}

#[async_trait]
impl DownloadTransport for SessionTransport {
    async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        self.guarded(self.inner.fetch_text(url)).await
    }

    async fn fetch_to_file(
        &self,
        url: &str,
        destination: &Path,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64, DownloadError> {
        self.guarded(self.inner.fetch_to_file(url, destination, on_progress))
            .await
    }

    fn cancel(&self) {
        self.inner.cancel();
    }

    fn is_busy(&self) -> bool {
        self.inner.is_busy()
    }
}
