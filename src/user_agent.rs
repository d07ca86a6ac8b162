//! Shared User-Agent strings.
//!
//! The dashboard endpoints reject requests that do not look like a browser
//! session, so page requests and media requests share a browser-like UA that
//! still names the tool and version.

const BROWSER_UA_PREFIX: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// User-Agent sent with every request of the shared HTTP client.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("{BROWSER_UA_PREFIX} blogcrawl/{version}")
}
