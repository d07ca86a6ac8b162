//! Fire-and-forget progress reporting.
//!
//! The pipeline never waits on its observers: sinks must return quickly and
//! must not fail. User-visible failures are reported as single-line
//! [`ProgressEvent::Error`] messages; everything else goes to tracing.

use std::fmt;

use tracing::{error, info};

/// Something worth showing to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A phase change or general status line.
    Status {
        /// Blog name.
        blog: String,
        /// Message text.
        message: String,
    },
    /// Pages crawled so far.
    PagesCrawled {
        /// Blog name.
        blog: String,
        /// Pages processed.
        pages: usize,
    },
    /// An artifact is being fetched or written.
    Downloading {
        /// Blog name.
        blog: String,
        /// Artifact file name or post id.
        file: String,
    },
    /// An artifact was already present and skipped.
    Skipped {
        /// Blog name.
        blog: String,
        /// Artifact file name or post id.
        file: String,
    },
    /// A user-visible failure.
    Error {
        /// Blog name.
        blog: String,
        /// One-line description.
        message: String,
    },
}

impl ProgressEvent {
    /// Builds a status event.
    pub fn status(blog: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Status {
            blog: blog.into(),
            message: message.into(),
        }
    }

    /// Builds an error event.
    pub fn error(blog: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            blog: blog.into(),
            message: message.into(),
        }
    }

    /// Blog the event belongs to.
    #[must_use]
    pub fn blog(&self) -> &str {
        match self {
            Self::Status { blog, .. }
            | Self::PagesCrawled { blog, .. }
            | Self::Downloading { blog, .. }
            | Self::Skipped { blog, .. }
            | Self::Error { blog, .. } => blog,
        }
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status { blog, message } => write!(f, "{blog}: {message}"),
            Self::PagesCrawled { blog, pages } => write!(f, "{blog}: crawled {pages} pages"),
            Self::Downloading { blog, file } => write!(f, "{blog}: downloading {file}"),
            Self::Skipped { blog, file } => write!(f, "{blog}: skipping {file}"),
            Self::Error { blog, message } => write!(f, "{blog}: {message}"),
        }
    }
}

/// Receiver of progress events.
pub trait ProgressSink: Send + Sync {
    /// Accepts one event. Must not block.
    fn report(&self, event: ProgressEvent);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Sink that forwards events to tracing; used when stderr is not a terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn report(&self, event: ProgressEvent) {
        match &event {
            ProgressEvent::Error { blog, message } => error!(blog = %blog, "{message}"),
            ProgressEvent::Status { blog, message } => info!(blog = %blog, "{message}"),
            ProgressEvent::PagesCrawled { blog, pages } => {
                info!(blog = %blog, pages, "crawl progress");
            }
            ProgressEvent::Downloading { .. } | ProgressEvent::Skipped { .. } => {
                tracing::debug!("{event}");
            }
        }
    }
}
