//! Error types for artifact downloads.
//!
//! Besides the usual network/status/IO split, IO failures are classified into
//! the two cases the downloader treats specially: a full disk (stops every
//! run) and a locked file (benign skip).

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[cfg(unix)]
const ENOSPC: i32 = 28;
#[cfg(unix)]
const EDQUOT: i32 = 122;
#[cfg(windows)]
const ERROR_HANDLE_DISK_FULL: i32 = 0x27;
#[cfg(windows)]
const ERROR_DISK_FULL: i32 = 0x70;
#[cfg(windows)]
const ERROR_SHARING_VIOLATION: i32 = 0x20;

/// Errors that can occur while fetching an artifact to disk.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS, connection refused, TLS, body stream).
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Non-success HTTP response.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// Raw Retry-After header value, if present.
        retry_after: Option<String>,
    },

    /// File system error while writing the artifact.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The URL is malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The run was cancelled while the transfer was in flight.
    #[error("download of {url} cancelled")]
    Cancelled {
        /// The URL being fetched.
        url: String,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error carrying a Retry-After value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a cancellation error.
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// True when the failure is an exhausted disk or quota.
    #[must_use]
    pub fn is_disk_full(&self) -> bool {
        matches!(self, Self::Io { source, .. } if is_disk_full(source))
    }

    /// True when the target file is held by another process.
    #[must_use]
    pub fn is_file_locked(&self) -> bool {
        matches!(self, Self::Io { source, .. } if is_file_locked(source))
    }

    /// True for HTTP 400-599 responses.
    #[must_use]
    pub fn is_http_error(&self) -> bool {
        matches!(self, Self::HttpStatus { status, .. } if (400..600).contains(status))
    }
}

/// Returns true when `err` means the volume or quota is exhausted.
#[must_use]
pub fn is_disk_full(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::StorageFull || err.kind() == io::ErrorKind::QuotaExceeded {
        return true;
    }
    match err.raw_os_error() {
        #[cfg(unix)]
        Some(code) => code == ENOSPC || code == EDQUOT,
        #[cfg(windows)]
        Some(code) => code == ERROR_HANDLE_DISK_FULL || code == ERROR_DISK_FULL,
        _ => false,
    }
}

/// Returns true when `err` is a sharing violation or busy file.
#[must_use]
pub fn is_file_locked(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::ResourceBusy {
        return true;
    }
    #[cfg(windows)]
    if err.raw_os_error() == Some(ERROR_SHARING_VIOLATION) {
        return true;
    }
    false
}
