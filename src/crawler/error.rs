//! Crawler error types.

use thiserror::Error;

use super::fetcher::FetchError;
use crate::queue::QueueError;

/// Failures that end a crawl operation.
///
/// Walker-level failures never surface here: they mark the run incomplete
/// and are reported through the progress sink instead.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// The login probe was rejected; the run produced nothing.
    #[error("user not logged in (blog {blog})")]
    NotLoggedIn {
        /// Blog name.
        blog: String,
    },

    /// A request outside the page walkers failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// An output queue rejected an item.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl CrawlError {
    /// True when the session was rejected by the login probe.
    #[must_use]
    pub fn is_not_logged_in(&self) -> bool {
        matches!(self, Self::NotLoggedIn { .. })
    }
}
