//! Authenticated page requests against the dashboard endpoint.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, REFERER, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use super::api::{PageResponse, dashboard_url, decode_page, extract_form_key, page_url};
use crate::download::{EndpointClass, RateLimiter, parse_retry_after};

/// Header carrying the CSRF form key.
const FORM_KEY_HEADER: &str = "X-tumblr-form-key";

/// One page of a blog's timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Blog name.
    pub blog: String,
    /// Posts per page.
    pub limit: u32,
    /// Posts to skip.
    pub offset: u64,
}

impl PageRequest {
    /// Request for the zero-based `page` with `page_size` posts per page.
    #[must_use]
    pub fn page(blog: &str, page_size: u32, page: u64) -> Self {
        Self {
            blog: blog.to_string(),
            limit: page_size,
            offset: u64::from(page_size) * page,
        }
    }
}

/// Failures of a page request.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// HTTP 401: the session is missing or expired.
    #[error("unauthorized: {url}")]
    Unauthorized {
        /// Requested URL.
        url: String,
    },

    /// HTTP 404: the blog does not exist or is hidden from this account.
    #[error("not found: {url}")]
    NotFound {
        /// Requested URL.
        url: String,
    },

    /// HTTP 503.
    #[error("service unavailable: {url}")]
    ServiceUnavailable {
        /// Requested URL.
        url: String,
    },

    /// HTTP 429.
    #[error("rate limit exceeded: {url}")]
    RateLimited {
        /// Requested URL.
        url: String,
        /// Server-provided wait, when present.
        retry_after: Option<Duration>,
    },

    /// Any other non-success status.
    #[error("HTTP {status}: {url}")]
    HttpStatus {
        /// Requested URL.
        url: String,
        /// Status code.
        status: u16,
    },

    /// The request timed out.
    #[error("timeout: {url}")]
    Timeout {
        /// Requested URL.
        url: String,
    },

    /// Connection-level failure.
    #[error("network error for {url}: {source}")]
    Network {
        /// Requested URL.
        url: String,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The body is not a page document.
    #[error("undecodable page {url}: {source}")]
    Decode {
        /// Requested URL.
        url: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The run was cancelled while the request was in flight.
    #[error("request cancelled: {url}")]
    Cancelled {
        /// Requested URL.
        url: String,
    },
}

impl FetchError {
    fn from_reqwest(url: &str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else {
            Self::Network {
                url: url.to_string(),
                source,
            }
        }
    }

    /// True for HTTP 401.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// True when the run was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Fetches timeline pages.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetches and decodes one page.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] for status, transport, decode failures and
    /// cancellation.
    async fn fetch_page(
        &self,
        request: &PageRequest,
        cancel: &CancellationToken,
    ) -> Result<PageResponse, FetchError>;

    /// Re-reads the CSRF form key from the blog's dashboard page.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] when the dashboard page cannot be loaded.
    async fn refresh_form_key(
        &self,
        blog: &str,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError>;
}

/// [`PageFetcher`] over HTTP, gated by the `Svc` rate-limit class.
#[derive(Debug)]
pub struct HttpPageFetcher {
    client: Client,
    api_base: Url,
    rate_limiter: Arc<RateLimiter>,
    form_key: RwLock<String>,
}

impl HttpPageFetcher {
    /// Fetcher using `client` (and its cookie jar) against `api_base`.
    #[must_use]
    pub fn new(client: Client, api_base: Url, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            client,
            api_base,
            rate_limiter,
            form_key: RwLock::new(String::new()),
        }
    }

    /// Currently installed form key.
    #[must_use]
    pub fn form_key(&self) -> String {
        self.form_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn send(
        &self,
        url: &str,
        referer: &str,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        let request = self
            .client
            .get(url)
            .header(REFERER, referer)
            .header(ACCEPT, "application/json, text/javascript, */*; q=0.01")
            .header("X-Requested-With", "XMLHttpRequest")
            .header(FORM_KEY_HEADER, self.form_key());

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FetchError::Cancelled { url: url.to_string() }),
            result = request.send() => result.map_err(|e| FetchError::from_reqwest(url, e))?,
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            drop(response);
            return Err(self.status_error(url, status, retry_after).await);
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(FetchError::Cancelled { url: url.to_string() }),
            body = response.text() => body.map_err(|e| FetchError::from_reqwest(url, e)),
        }
    }

    async fn status_error(
        &self,
        url: &str,
        status: StatusCode,
        retry_after: Option<Duration>,
    ) -> FetchError {
        let url = url.to_string();
        match status {
            StatusCode::UNAUTHORIZED => FetchError::Unauthorized { url },
            StatusCode::NOT_FOUND => FetchError::NotFound { url },
            StatusCode::SERVICE_UNAVAILABLE => FetchError::ServiceUnavailable { url },
            StatusCode::TOO_MANY_REQUESTS => {
                if let Some(delay) = retry_after {
                    self.rate_limiter
                        .record_rate_limit(EndpointClass::Svc, delay)
                        .await;
                }
                warn!(url = %url, ?retry_after, "rate limit exceeded");
                FetchError::RateLimited { url, retry_after }
            }
            other => FetchError::HttpStatus {
                url,
                status: other.as_u16(),
            },
        }
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    #[instrument(skip(self, cancel), fields(blog = %request.blog, offset = request.offset))]
    async fn fetch_page(
        &self,
        request: &PageRequest,
        cancel: &CancellationToken,
    ) -> Result<PageResponse, FetchError> {
        let url = page_url(&self.api_base, &request.blog, request.limit, request.offset);
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FetchError::Cancelled { url }),
            () = self.rate_limiter.acquire(EndpointClass::Svc) => {}
        }

        let referer = dashboard_url(&self.api_base, &request.blog);
        let body = self.send(&url, &referer, cancel).await?;
        let page = decode_page(&body).map_err(|source| FetchError::Decode {
            url: url.clone(),
            source,
        })?;
        debug!(posts = page.posts().len(), "page fetched");
        Ok(page)
    }

    #[instrument(skip(self, cancel))]
    async fn refresh_form_key(
        &self,
        blog: &str,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        let url = dashboard_url(&self.api_base, blog);
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FetchError::Cancelled { url }),
            () = self.rate_limiter.acquire(EndpointClass::Dashboard) => {}
        }
        let html = self.send(&url, &url, cancel).await?;
        let key = extract_form_key(&html).unwrap_or_else(|| {
            debug!("no form key on dashboard page");
            String::new()
        });
        *self
            .form_key
            .write()
            .unwrap_or_else(PoisonError::into_inner) = key;
        Ok(())
    }
}
