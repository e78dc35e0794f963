use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::TransportConfig;
use crate::downloader::http_transport::HttpTransport;
use crate::types::types::DownloadError;

/// Byte-progress callback: `(bytes_received_so_far, total_expected_if_known)`.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// The network I/O a patch engine performs.
///
/// An instance serves one request at a time; a second `fetch_*` while one is
/// in flight fails with `DownloadError::Busy`. Every outcome, including
/// cancellation, is delivered through the returned `Result`.
#[async_trait]
pub trait DownloadTransport: Send + Sync {
    /// Fetch `url` and decode the body as text.
    async fn fetch_text(&self, url: &str) -> Result<String, DownloadError>;

    /// Stream `url` into `destination`, truncating it first. Returns the
    /// number of bytes written.
    async fn fetch_to_file(
        &self,
        url: &str,
        destination: &Path,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64, DownloadError>;

    /// Abort the in-flight request, if any. A no-op when idle.
    fn cancel(&self);

    fn is_busy(&self) -> bool;
}

/// Creates a fresh transport for each operation that asks for one.
pub type TransportFactory =
    Arc<dyn Fn() -> Result<Arc<dyn DownloadTransport>, DownloadError> + Send + Sync>;

/// Factory producing `HttpTransport`s with the given configuration.
pub fn http_transport_factory(config: TransportConfig) -> TransportFactory {
    Arc::new(move || {
        let transport: Arc<dyn DownloadTransport> = Arc::new(HttpTransport::new(config.clone())?);
        Ok(transport)
    })
}
