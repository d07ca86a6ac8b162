//! Netscape cookie files and the shared session jar.
//!
//! Logged-in sessions are exported from a browser as a Netscape cookie file
//! (7 TAB-separated fields per line). The cookies are added to the single
//! `reqwest` jar shared by the page fetcher and the downloader, so a reload
//! after an authentication failure is visible to every request that follows.

use std::fmt;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use reqwest::cookie::Jar;
use tracing::{debug, instrument, warn};

/// One cookie line. `Debug` never shows the value.
#[derive(Clone)]
pub struct CookieLine {
    /// Cookie domain, e.g. `.tumblr.com`.
    pub domain: String,
    /// Whether subdomains match.
    pub include_subdomains: bool,
    /// Path scope.
    pub path: String,
    /// HTTPS only.
    pub secure: bool,
    /// Expiry in unix seconds; 0 for a session cookie.
    pub expires: u64,
    /// Cookie name.
    pub name: String,
    value: String,
}

impl CookieLine {
    /// Cookie value. Sensitive; keep it out of logs.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for CookieLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieLine")
            .field("domain", &self.domain)
            .field("include_subdomains", &self.include_subdomains)
            .field("path", &self.path)
            .field("secure", &self.secure)
            .field("expires", &self.expires)
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// Cookie file errors.
#[derive(Debug, thiserror::Error)]
pub enum CookieError {
    /// A data line could not be parsed.
    #[error("line {line_number}: {reason}")]
    InvalidLine {
        /// 1-based line number.
        line_number: usize,
        /// What was wrong.
        reason: String,
    },

    /// The file could not be read.
    #[error("failed to read cookie file {path}: {source}")]
    Io {
        /// Cookie file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The file had data lines but none of them parsed.
    #[error("no valid cookies found ({malformed} malformed lines)")]
    NoCookiesFound {
        /// Lines that failed to parse.
        malformed: usize,
    },
}

/// Parsed cookies plus the lines that were skipped.
#[derive(Debug, Default)]
pub struct ParsedCookies {
    /// Valid cookies.
    pub cookies: Vec<CookieLine>,
    /// Skipped lines as `(line_number, reason)`.
    pub warnings: Vec<(usize, String)>,
}

/// Parses Netscape cookie text. Comments, blank lines and the
/// `#HttpOnly_` prefix are handled; malformed lines become warnings.
///
/// # Errors
///
/// Returns [`CookieError::Io`] on read failure and
/// [`CookieError::NoCookiesFound`] when every data line is malformed.
#[instrument(level = "debug", skip(reader))]
pub fn parse_netscape_cookies(reader: impl BufRead) -> Result<ParsedCookies, CookieError> {
    let mut parsed = ParsedCookies::default();
    let mut data_lines = 0usize;

    for (idx, line) in reader.lines().enumerate() {
        let line_number = idx + 1;
        let line = line.map_err(|source| CookieError::Io {
            path: PathBuf::new(),
            source,
        })?;
        let line = line.trim_end();
        let line = line.strip_prefix("#HttpOnly_").unwrap_or(line);
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        data_lines += 1;

        match parse_line(line, line_number) {
            Ok(cookie) => parsed.cookies.push(cookie),
            Err(e) => {
                warn!(line = line_number, reason = %e, "skipping malformed cookie line");
                parsed.warnings.push((line_number, e.to_string()));
            }
        }
    }

    if parsed.cookies.is_empty() && data_lines > 0 {
        return Err(CookieError::NoCookiesFound {
            malformed: parsed.warnings.len(),
        });
    }
    Ok(parsed)
}

/// Reads and parses the cookie file at `path`.
///
/// # Errors
///
/// Same as [`parse_netscape_cookies`], with the path attached to IO errors.
pub fn read_cookie_file(path: &Path) -> Result<ParsedCookies, CookieError> {
    let file = std::fs::File::open(path).map_err(|source| CookieError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_netscape_cookies(std::io::BufReader::new(file)).map_err(|e| match e {
        CookieError::Io { source, .. } => CookieError::Io {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })
}

fn parse_line(line: &str, line_number: usize) -> Result<CookieLine, CookieError> {
    let invalid = |reason: String| CookieError::InvalidLine {
        line_number,
        reason,
    };
    let fields: Vec<&str> = line.split('\t').collect();
    let [domain, subdomains, path, secure, expires, name, value] = fields.as_slice() else {
        return Err(invalid(format!(
            "expected 7 TAB-separated fields, found {}",
            fields.len()
        )));
    };
    if domain.is_empty() || name.is_empty() {
        return Err(invalid("domain and name must not be empty".to_string()));
    }
    let flag = |v: &str, field: &str| match v {
        "TRUE" => Ok(true),
        "FALSE" => Ok(false),
        _ => Err(invalid(format!("{field} must be TRUE or FALSE"))),
    };
    Ok(CookieLine {
        domain: (*domain).to_string(),
        include_subdomains: flag(*subdomains, "include_subdomains")?,
        path: (*path).to_string(),
        secure: flag(*secure, "secure")?,
        expires: expires
            .parse()
            .map_err(|_| invalid(format!("expires must be an integer, got '{expires}'")))?,
        name: (*name).to_string(),
        value: (*value).to_string(),
    })
}

/// Adds `cookies` to `jar`; returns how many were accepted.
#[instrument(level = "debug", skip_all, fields(count = cookies.len()))]
pub fn add_cookies_to_jar(jar: &Jar, cookies: &[CookieLine]) -> usize {
    let mut added = 0;
    for cookie in cookies {
        let scheme = if cookie.secure { "https" } else { "http" };
        let host = cookie.domain.trim_start_matches('.');
        let Ok(origin) = format!("{scheme}://{host}{}", cookie.path).parse::<url::Url>() else {
            warn!(domain = %cookie.domain, name = %cookie.name, "skipping cookie with unusable domain");
            continue;
        };
        jar.add_cookie_str(&set_cookie_header(cookie), &origin);
        debug!(domain = %cookie.domain, name = %cookie.name, "cookie added");
        added += 1;
    }
    added
}

fn set_cookie_header(cookie: &CookieLine) -> String {
    let mut header = format!(
        "{}={}; Domain={}; Path={}",
        cookie.name,
        cookie.value(),
        cookie.domain,
        cookie.path
    );
    if cookie.secure {
        header.push_str("; Secure");
    }
    if cookie.expires > 0 {
        if let Some(time) = UNIX_EPOCH.checked_add(Duration::from_secs(cookie.expires)) {
            header.push_str("; Expires=");
            header.push_str(&httpdate::fmt_http_date(time));
        }
    }
    header
}
