//! HTTP client wrapper and the binary artifact writer.
//!
//! One [`HttpClient`] (one connection pool, one cookie jar) is shared by the
//! page fetcher and the downloader. Artifact transfers stream to disk and
//! resume an existing partial file when the server honours `Range`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::cookie::Jar;
use reqwest::header::{ACCEPT_RANGES, RANGE, RETRY_AFTER};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use crate::user_agent;

/// Fetches a remote binary into a local file.
///
/// Implemented by [`HttpClient`]; tests substitute in-memory writers.
#[async_trait]
pub trait ArtifactWriter: Send + Sync {
    /// Streams `url` to `path` and returns the final file size.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] on network, status, IO failure or when
    /// `cancel` fires mid-transfer.
    async fn fetch_to_path(
        &self,
        url: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError>;
}

/// Connection and timeout settings for [`HttpClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request timeout.
    pub read_timeout: Duration,
    /// Cookie jar attached to every request.
    pub cookie_jar: Option<Arc<Jar>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            cookie_jar: None,
        }
    }
}

/// Pooled HTTP client.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Builds a client from `options`.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error (TLS backend initialisation).
    pub fn build(options: ClientOptions) -> Result<Self, reqwest::Error> {
        let mut builder = Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.read_timeout)
            .gzip(true)
            .user_agent(user_agent::default_user_agent());
        if let Some(jar) = options.cookie_jar {
            builder = builder.cookie_provider(jar);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Wraps an existing reqwest client.
    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Underlying reqwest client, shared with the page fetcher.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<reqwest::Response, DownloadError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url)
            } else {
                DownloadError::network(url, e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            return Err(DownloadError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }
        Ok(response)
    }

    /// Returns the partial size to resume from, or zero for a fresh transfer.
    async fn resume_offset(&self, url: &str, path: &Path) -> u64 {
        let existing = tokio::fs::metadata(path).await.map_or(0, |m| m.len());
        if existing == 0 {
            return 0;
        }
        let supports_ranges = self
            .send(self.client.head(url), url)
            .await
            .ok()
            .and_then(|r| {
                r.headers()
                    .get(ACCEPT_RANGES)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.eq_ignore_ascii_case("bytes"))
            })
            .unwrap_or(false);
        if supports_ranges { existing } else { 0 }
    }

    async fn transfer(
        &self,
        url: &str,
        path: &Path,
        resumed: &mut bool,
    ) -> Result<u64, DownloadError> {
        let offset = self.resume_offset(url, path).await;
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = match self.send(request, url).await {
            Ok(response) => response,
            // Range starts at or past the end: the file is already complete.
            Err(DownloadError::HttpStatus { status: 416, .. }) if offset > 0 => {
                *resumed = true;
                return Ok(offset);
            }
            Err(e) => return Err(e),
        };

        *resumed = offset > 0 && response.status().as_u16() == 206;
        let file = if *resumed {
            debug!(offset, "resuming partial file");
            OpenOptions::new()
                .append(true)
                .open(path)
                .await
                .map_err(|e| DownloadError::io(path, e))?
        } else {
            File::create(path)
                .await
                .map_err(|e| DownloadError::io(path, e))?
        };

        let written = stream_to_file(file, response, url, path).await?;
        Ok(if *resumed { offset + written } else { written })
    }
}

#[async_trait]
impl ArtifactWriter for HttpClient {
    #[instrument(skip(self, cancel), fields(url = %url, path = %path.display()))]
    async fn fetch_to_path(
        &self,
        url: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        let mut resumed = false;
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(DownloadError::cancelled(url)),
            result = self.transfer(url, path, &mut resumed) => result,
        };

        if result.is_err() && !resumed {
            debug!("removing partial file after failed transfer");
            let _ = tokio::fs::remove_file(path).await;
        }
        if let Ok(bytes) = result {
            debug!(bytes, resumed, "artifact written");
        }
        result
    }
}

async fn stream_to_file(
    file: File,
    response: reqwest::Response,
    url: &str,
    path: &Path,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url)
            } else {
                DownloadError::network(url, e)
            }
        })?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(path, e))?;
        written += chunk.len() as u64;
    }

    writer.flush().await.map_err(|e| DownloadError::io(path, e))?;
    Ok(written)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client() -> HttpClient {
        HttpClient::build(ClientOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_to_path_writes_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tumblr_a.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpegbytes".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let target = dir.path().join("tumblr_a.jpg");
        let bytes = client()
            .fetch_to_path(
                &format!("{}/tumblr_a.jpg", server.uri()),
                &target,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(bytes, 9);
        assert_eq!(std::fs::read(&target).unwrap(), b"jpegbytes");
    }

    #[tokio::test]
    async fn test_fetch_to_path_http_error_leaves_no_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let target = dir.path().join("gone.jpg");
        let err = client()
            .fetch_to_path(
                &format!("{}/gone.jpg", server.uri()),
                &target,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(err.is_http_error());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_fetch_to_path_resumes_partial_file() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("Accept-Ranges", "bytes"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("Range", "bytes=4-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"5678".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let target = dir.path().join("v.mp4");
        std::fs::write(&target, b"1234").unwrap();

        let bytes = client()
            .fetch_to_path(
                &format!("{}/v.mp4", server.uri()),
                &target,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(bytes, 8);
        assert_eq!(std::fs::read(&target).unwrap(), b"12345678");
    }

    #[tokio::test]
    async fn test_fetch_to_path_cancelled() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client()
            .fetch_to_path("http://127.0.0.1:9/x.jpg", &dir.path().join("x.jpg"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_fetch_to_path_invalid_url() {
        let dir = TempDir::new().unwrap();
        let err = client()
            .fetch_to_path("not a url", &dir.path().join("x"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl { .. }));
    }
}
