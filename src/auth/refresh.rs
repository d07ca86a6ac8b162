//! Re-authentication after a 401.
//!
//! The crawler never logs in by itself. When a page request is rejected as
//! unauthorized it asks a [`CookieRefresher`] once for fresh cookies and
//! retries that page a single time.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::cookie::Jar;
use tracing::{info, instrument};

use super::cookies::{CookieError, add_cookies_to_jar, read_cookie_file};

/// Refresh failures.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// No cookie source is configured.
    #[error("no cookie source configured")]
    Unavailable,

    /// The cookie source could not be read.
    #[error(transparent)]
    Cookies(#[from] CookieError),

    /// The cookie source held no usable cookies.
    #[error("cookie file {path} contains no usable cookies")]
    Empty {
        /// Cookie file path.
        path: PathBuf,
    },
}

/// Supplies fresh session cookies.
#[async_trait]
pub trait CookieRefresher: Send + Sync {
    /// Reloads the session; returns the number of cookies installed.
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError`] when no fresh cookies could be obtained.
    async fn refresh(&self) -> Result<usize, RefreshError>;
}

/// Reloads a Netscape cookie file into the shared jar.
#[derive(Debug, Clone)]
pub struct FileCookieRefresher {
    path: PathBuf,
    jar: Arc<Jar>,
}

impl FileCookieRefresher {
    /// Refresher reading `path` into `jar`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, jar: Arc<Jar>) -> Self {
        Self {
            path: path.into(),
            jar,
        }
    }

    /// Loads the file once; used at startup.
    ///
    /// # Errors
    ///
    /// Same as [`CookieRefresher::refresh`].
    pub fn load(&self) -> Result<usize, RefreshError> {
        let parsed = read_cookie_file(&self.path)?;
        let added = add_cookies_to_jar(&self.jar, &parsed.cookies);
        if added == 0 {
            return Err(RefreshError::Empty {
                path: self.path.clone(),
            });
        }
        Ok(added)
    }
}

#[async_trait]
impl CookieRefresher for FileCookieRefresher {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn refresh(&self) -> Result<usize, RefreshError> {
        let this = self.clone();
        let added = tokio::task::spawn_blocking(move || this.load())
            .await
            .map_err(|e| {
                RefreshError::Cookies(CookieError::Io {
                    path: self.path.clone(),
                    source: std::io::Error::other(e),
                })
            })??;
        info!(cookies = added, "session cookies reloaded");
        Ok(added)
    }
}

/// Refresher used when no cookie file is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCookieRefresh;

#[async_trait]
impl CookieRefresher for NoCookieRefresh {
    async fn refresh(&self) -> Result<usize, RefreshError> {
        Err(RefreshError::Unavailable)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use reqwest::cookie::CookieStore;
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_refresh_reloads_file_into_shared_jar() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cookies.txt");
        std::fs::write(&path, ".tumblr.com\tTRUE\t/\tTRUE\t0\tpfg\tfirst\n").unwrap();

        let jar = Arc::new(Jar::default());
        let refresher = FileCookieRefresher::new(&path, Arc::clone(&jar));
        assert_eq!(refresher.load().unwrap(), 1);

        std::fs::write(&path, ".tumblr.com\tTRUE\t/\tTRUE\t0\tpfg\tsecond\n").unwrap();
        assert_eq!(refresher.refresh().await.unwrap(), 1);

        let url = "https://www.tumblr.com/".parse().unwrap();
        let header = jar.cookies(&url).unwrap();
        assert_eq!(header.to_str().unwrap(), "pfg=second");
    }

    #[tokio::test]
    async fn test_refresh_missing_file_fails() {
        let refresher =
            FileCookieRefresher::new("/nonexistent/cookies.txt", Arc::new(Jar::default()));
        assert!(matches!(
            refresher.refresh().await,
            Err(RefreshError::Cookies(CookieError::Io { .. }))
        ));
    }

    #[tokio::test]
    async fn test_no_cookie_refresh_is_unavailable() {
        assert!(matches!(
            NoCookieRefresh.refresh().await,
            Err(RefreshError::Unavailable)
        ));
    }
}
