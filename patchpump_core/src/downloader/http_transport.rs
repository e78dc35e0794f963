use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::COOKIE;
use reqwest::{Client, Response, Url};
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::downloader::cookie_jar::CookieJar;
use crate::downloader::transport::{DownloadTransport, ProgressFn};
use crate::types::types::DownloadError;

/// `DownloadTransport` over reqwest with a host-keyed session cookie jar.
///
/// reqwest's client keeps no cookies unless built with a cookie store, and
/// some CDNs hand out a session cookie on the first response that must be
/// echoed on the following ones; `CookieJar` covers that.
pub struct HttpTransport {
    client: Client,
    config: TransportConfig,
    cookies: CookieJar,
    in_flight: Mutex<Option<CancellationToken>>,
}

/// Marks the transport busy for the lifetime of one request.
struct InFlight<'a> {
    transport: &'a HttpTransport,
    token: CancellationToken,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        *self.transport.lock_in_flight() = None;
    }
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self, DownloadError> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout())
            .tcp_nodelay(true);
        if let Some(agent) = &config.user_agent {
            builder = builder.user_agent(agent.clone());
        }
        let client = builder.build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: TransportConfig) -> Self {
        Self {
            client,
            config,
            cookies: CookieJar::new(),
            in_flight: Mutex::new(None),
        }
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) -> Result<InFlight<'_>, DownloadError> {
        let mut slot = self.lock_in_flight();
        if slot.is_some() {
            log::warn!("[HttpTransport] rejecting request: another one is in flight");
            return Err(DownloadError::Busy);
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        Ok(InFlight {
            transport: self,
            token,
        })
    }

    /// Sends a GET, attaching the stored cookie for the host and recording
    /// any `set-cookie` from the response before the status is checked.
    async fn send(&self, url: &str, token: &CancellationToken) -> Result<Response, DownloadError> {
        let parsed = Url::parse(url).map_err(|e| DownloadError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let mut request = self.client.get(parsed.clone());
        if let Some(cookie) = self.cookies.get(&parsed) {
            request = request.header(COOKIE, cookie);
        }

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            sent = request.send() => sent?,
        };

        self.cookies
            .store_from_headers(response.url(), response.headers());

        let status = response.status();
        log::debug!(
            "[HttpTransport::send] {} -> status={}, content_length={:?}",
            url,
            status,
            response.content_length()
        );
        if !status.is_success() {
            return Err(DownloadError::Status {
                status,
                url: response.url().to_string(),
            });
        }
        Ok(response)
    }

    async fn read_text(&self, url: &str, token: &CancellationToken) -> Result<String, DownloadError> {
        let response = self.send(url, token).await?;
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(DownloadError::Cancelled),
            body = response.text() => body.map_err(DownloadError::from),
        }
    }

    async fn stream_to_file(
        &self,
        url: &str,
        destination: &Path,
        on_progress: ProgressFn<'_>,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let response = self.send(url, token).await?;
        let expected = response.content_length();

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(destination)
            .await
            .map_err(DownloadError::Disk)?;
        let mut writer = BufWriter::with_capacity(self.config.buffer_size.max(1), file);

        let streamed = copy_body(response, &mut writer, expected, on_progress, token).await;
        // The handle is closed whether or not the body made it.
        let closed = close_writer(writer).await;

        let written = streamed?;
        closed.map_err(DownloadError::Disk)?;

        on_progress(written, Some(written));
        Ok(written)
    }
}

#[async_trait]
impl DownloadTransport for HttpTransport {
    async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        let in_flight = self.begin()?;
        log::info!("[HttpTransport::fetch_text] GET {}", url);
        let result = self.read_text(url, &in_flight.token).await;
        settle(result, &in_flight.token)
    }

    async fn fetch_to_file(
        &self,
        url: &str,
        destination: &Path,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64, DownloadError> {
        let in_flight = self.begin()?;
        log::info!(
            "[HttpTransport::fetch_to_file] GET {} -> {}",
            url,
            destination.display()
        );

        let result = self
            .stream_to_file(url, destination, on_progress, &in_flight.token)
            .await;
        match &result {
            Ok(written) => log::info!(
                "[HttpTransport::fetch_to_file] finished {}: {} bytes",
                destination.display(),
                written
            ),
            Err(e) => log::warn!(
                "[HttpTransport::fetch_to_file] {} did not complete: {}",
                destination.display(),
                e
            ),
        }
        settle(result, &in_flight.token)
    }

    fn cancel(&self) {
        if let Some(token) = self.lock_in_flight().as_ref() {
            log::info!("[HttpTransport::cancel] cancelling in-flight request");
            token.cancel();
        }
    }

    fn is_busy(&self) -> bool {
        self.lock_in_flight().is_some()
    }
}

/// Streams the body chunk by chunk, checking for cancellation between chunks.
async fn copy_body<W>(
    response: Response,
    writer: &mut W,
    expected: Option<u64>,
    on_progress: ProgressFn<'_>,
    token: &CancellationToken,
) -> Result<u64, DownloadError>
where
    W: AsyncWrite + Unpin,
{
    let mut stream = response.bytes_stream();
    let mut received: u64 = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            next = stream.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk?;

        writer.write_all(&chunk).await.map_err(DownloadError::Disk)?;
        received += chunk.len() as u64;
        on_progress(received, expected);
    }

    Ok(received)
}

/// Flushes buffered bytes and closes the file before returning.
async fn close_writer(mut writer: BufWriter<File>) -> std::io::Result<()> {
    let flushed = writer.flush().await;
    // into_std waits for any write still running on the blocking pool.
    let file = writer.into_inner().into_std().await;
    drop(file);
    flushed
}

/// An error that shows up after `cancel()` is a consequence of it.
fn settle<T>(result: Result<T, DownloadError>, token: &CancellationToken) -> Result<T, DownloadError> {
    match result {
        Err(err) if token.is_cancelled() && !err.is_cancelled() => {
            log::debug!(
                "[HttpTransport] '{}' raised after cancellation, reporting as cancelled",
                err
            );
            Err(DownloadError::Cancelled)
        }
        other => other,
    }
}
