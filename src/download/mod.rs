//! Fetching and persisting artifacts.
//!
//! - [`HttpClient`] streams remote bytes to disk, resuming partial files
//! - [`Downloader`] drains a post queue with per-category connection limits
//! - [`RateLimiter`] spaces out requests per endpoint class
//! - [`RetryPolicy`] decides which failures get another attempt
//! - [`TextSink`] appends text artifacts, one writer per file
//!
//! # Example
//!
//! ```no_run
//! use blogcrawl_core::download::{ArtifactWriter, ClientOptions, HttpClient};
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::build(ClientOptions::default())?;
//! let cancel = CancellationToken::new();
//! let bytes = client
//!     .fetch_to_path("https://example.com/a.jpg", Path::new("./a.jpg"), &cancel)
//!     .await?;
//! println!("wrote {bytes} bytes");
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod engine;
mod error;
mod filename;
pub mod rate_limiter;
mod retry;
mod text_sink;

pub use client::{ArtifactWriter, ClientOptions, HttpClient};
pub use engine::{
    DEFAULT_CONCURRENT_CONNECTIONS, DEFAULT_CONCURRENT_VIDEO_CONNECTIONS, DownloadStats,
    DownloadSummary, Downloader, DownloaderConfig, EngineError, permits_per_blog,
};
pub use error::{DownloadError, is_disk_full, is_file_locked};
pub use filename::{
    DEFAULT_FILENAME_TEMPLATE, FilenameContext, build_file_name, is_default_template,
    sanitize_filename, url_file_name,
};
pub use rate_limiter::{EndpointClass, RateLimiter, parse_retry_after};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
pub use text_sink::TextSink;
