//! Session cookies and re-authentication.
//!
//! Cookies come from a Netscape-format export of a logged-in browser session
//! and live in one `reqwest` jar shared by every request of the process.

mod cookies;
mod refresh;

pub use cookies::{
    CookieError, CookieLine, ParsedCookies, add_cookies_to_jar, parse_netscape_cookies,
    read_cookie_file,
};
pub use refresh::{CookieRefresher, FileCookieRefresher, NoCookieRefresh, RefreshError};
