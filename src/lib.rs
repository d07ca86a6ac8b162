//! blogcrawl core library
//!
//! Crawls the post timeline of hidden (login-only) blogs and mirrors their
//! media and text locally, downloading only what earlier runs have not.
//!
//! # Architecture
//!
//! - [`crawler`] - Page walkers, post classification and dedup of metadata
//! - [`queue`] - Bounded producer/consumer queues between crawl and download
//! - [`download`] - Concurrent downloader, HTTP client, rate and retry policy
//! - [`metadata`] - Writer for per-post JSON snapshots
//! - [`file_db`] / [`db`] - Persistent record of downloaded artifacts
//! - [`blog`] - The persisted blog document and per-run statistics
//! - [`auth`] - Session cookies and re-authentication
//! - [`control`] / [`progress`] - Cancellation, pause and progress reporting
//! - [`registry`] - Blog type to crawler mapping
//! - [`runner`] - End-to-end runs over one or many blogs

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod blog;
pub mod control;
pub mod crawler;
pub mod db;
pub mod download;
pub mod file_db;
pub mod metadata;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod runner;
mod user_agent;

// Re-export commonly used types
pub use blog::{Blog, BlogStats};
pub use control::{PauseToken, RunControl};
pub use crawler::{CrawlError, CrawlReport, Crawler, CrawlerDeps};
pub use download::{Downloader, DownloaderConfig, HttpClient, RateLimiter, RetryPolicy};
pub use file_db::FileDatabase;
pub use progress::{NullProgress, ProgressEvent, ProgressSink, TracingProgress};
pub use queue::{CrawlerData, DownloadItem, Queue, QueueError};
pub use registry::CrawlerRegistry;
pub use runner::{
    BlogOutcome, BlogOverrides, BlogRunner, RunStatus, RunnerError, RuntimeEnvironment, Settings,
};
