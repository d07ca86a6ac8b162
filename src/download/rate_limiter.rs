//! Per-endpoint-class request pacing.
//!
//! The remote API enforces quotas per endpoint family rather than per host,
//! so requests are paced by [`EndpointClass`]. Each configured class enforces
//! a minimum interval between consecutive requests; classes without a limit
//! pass straight through. Waiting for one class never blocks another.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use blogcrawl_core::download::{EndpointClass, RateLimiter};
//!
//! # async fn example() {
//! let limiter = RateLimiter::new().with_limit(EndpointClass::Svc, Duration::from_millis(700));
//!
//! limiter.acquire(EndpointClass::Svc).await; // immediate
//! limiter.acquire(EndpointClass::Svc).await; // waits ~700ms
//! limiter.acquire(EndpointClass::Dashboard).await; // unlimited class, immediate
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::{CUMULATIVE_DELAY_WARNING_THRESHOLD, MAX_RETRY_AFTER, RATE_LIMIT_WINDOW};

/// Family of remote endpoints sharing one request quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// Dashboard `svc` endpoints used for hidden blogs.
    Svc,
    /// Dashboard HTML pages that carry the form key.
    Dashboard,
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Svc => write!(f, "svc"),
            Self::Dashboard => write!(f, "dashboard"),
        }
    }
}

/// Per-class request gate, shared across tasks behind an `Arc`.
#[derive(Debug, Default)]
pub struct RateLimiter {
    classes: DashMap<EndpointClass, Arc<ClassState>>,
}

#[derive(Debug)]
struct ClassState {
    interval: Duration,
    /// Earliest instant the next request may start. `None` until first use.
    next_allowed: Mutex<Option<Instant>>,
    cumulative_delay_ms: AtomicU64,
}

impl ClassState {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_allowed: Mutex::new(None),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(total)
    }
}

impl RateLimiter {
    /// Creates a limiter with no configured classes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a limiter that never waits, even after a recorded 429.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Enforces `interval` between requests of `class`.
    #[must_use]
    pub fn with_limit(self, class: EndpointClass, interval: Duration) -> Self {
        self.classes
            .insert(class, Arc::new(ClassState::new(interval)));
        self
    }

    /// Enforces at most `max_requests` per rate window (one minute) for `class`.
    ///
    /// `enabled == false` or `max_requests == 0` leaves the class unlimited.
    #[must_use]
    pub fn with_quota(self, class: EndpointClass, enabled: bool, max_requests: u32) -> Self {
        if !enabled || max_requests == 0 {
            return self;
        }
        let interval = RATE_LIMIT_WINDOW / max_requests;
        self.with_limit(class, interval)
    }

    /// Returns whether `class` is paced.
    #[must_use]
    pub fn is_limited(&self, class: EndpointClass) -> bool {
        self.classes.contains_key(&class)
    }

    /// Waits until a request of `class` may start.
    ///
    /// Only this class's lock is held while sleeping.
    #[instrument(level = "debug", skip(self), fields(class = %class))]
    pub async fn acquire(&self, class: EndpointClass) {
        let Some(state) = self.classes.get(&class).map(|s| Arc::clone(s.value())) else {
            return;
        };

        let mut next_allowed = state.next_allowed.lock().await;
        if let Some(at) = *next_allowed {
            let now = Instant::now();
            if at > now {
                let delay = at - now;
                let cumulative = state.add_cumulative_delay(delay);
                debug!(
                    delay_ms = delay.as_millis(),
                    cumulative_ms = cumulative.as_millis(),
                    "pacing request"
                );
                if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                    warn!(
                        class = %class,
                        cumulative_delay_secs = cumulative.as_secs(),
                        "requests are being heavily throttled"
                    );
                }
                tokio::time::sleep_until(at).await;
            }
        }
        *next_allowed = Some(Instant::now() + state.interval);
    }

    /// Pushes the next allowed request of `class` out by a server-mandated delay.
    ///
    /// Unlimited classes ignore the hint.
    #[instrument(level = "debug", skip(self), fields(class = %class))]
    pub async fn record_rate_limit(&self, class: EndpointClass, delay: Duration) {
        let Some(state) = self.classes.get(&class).map(|s| Arc::clone(s.value())) else {
            return;
        };
        let delay = delay.min(MAX_RETRY_AFTER);
        let until = Instant::now() + delay;
        let mut next_allowed = state.next_allowed.lock().await;
        if next_allowed.is_none_or(|at| at < until) {
            *next_allowed = Some(until);
        }
        debug!(delay_ms = delay.as_millis(), "recorded server rate limit");
    }
}

/// Parses a `Retry-After` header: integer seconds or an HTTP-date.
///
/// Negative or unparseable values yield `None`; dates in the past yield zero;
/// anything beyond one hour is capped.
///
/// ```
/// use std::time::Duration;
/// use blogcrawl_core::download::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("soon"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let seconds = u64::try_from(seconds).ok()?;
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    let date = httpdate::parse_http_date(header_value).ok()?;
    let delay = date
        .duration_since(std::time::SystemTime::now())
        .unwrap_or(Duration::ZERO);
    if delay > MAX_RETRY_AFTER {
        warn!(
            delay_secs = delay.as_secs(),
            "Retry-After date exceeds maximum, capping at 1 hour"
        );
    }
    Some(delay.min(MAX_RETRY_AFTER))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== RateLimiter Tests ====================

    #[tokio::test]
    async fn test_unlimited_class_never_waits() {
        tokio::time::pause();
        let limiter = RateLimiter::disabled();
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire(EndpointClass::Svc).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(!limiter.is_limited(EndpointClass::Svc));
    }

    #[tokio::test]
    async fn test_limited_class_enforces_interval() {
        tokio::time::pause();
        let limiter = RateLimiter::new().with_limit(EndpointClass::Svc, Duration::from_secs(1));
        let start = Instant::now();

        limiter.acquire(EndpointClass::Svc).await;
        assert!(start.elapsed() < Duration::from_millis(10));

        limiter.acquire(EndpointClass::Svc).await;
        assert!(start.elapsed() >= Duration::from_secs(1));

        limiter.acquire(EndpointClass::Svc).await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_classes_are_independent() {
        tokio::time::pause();
        let limiter = RateLimiter::new()
            .with_limit(EndpointClass::Svc, Duration::from_secs(5))
            .with_limit(EndpointClass::Dashboard, Duration::from_secs(5));
        let start = Instant::now();

        limiter.acquire(EndpointClass::Svc).await;
        limiter.acquire(EndpointClass::Dashboard).await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_quota_converts_to_interval() {
        tokio::time::pause();
        let limiter = RateLimiter::new().with_quota(EndpointClass::Svc, true, 60);
        let start = Instant::now();
        limiter.acquire(EndpointClass::Svc).await;
        limiter.acquire(EndpointClass::Svc).await;
        assert!(start.elapsed() >= Duration::from_secs(1));

        let off = RateLimiter::new().with_quota(EndpointClass::Svc, false, 60);
        assert!(!off.is_limited(EndpointClass::Svc));
    }

    #[tokio::test]
    async fn test_record_rate_limit_delays_next_acquire() {
        tokio::time::pause();
        let limiter = RateLimiter::new().with_limit(EndpointClass::Svc, Duration::from_millis(10));
        limiter.acquire(EndpointClass::Svc).await;

        let start = Instant::now();
        limiter
            .record_rate_limit(EndpointClass::Svc, Duration::from_secs(30))
            .await;
        limiter.acquire(EndpointClass::Svc).await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    // ==================== Retry-After Tests ====================

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_rejects_bad_values() {
        assert_eq!(parse_retry_after("-5"), None);
        assert_eq!(parse_retry_after(""), None);
        assert_eq!(parse_retry_after("later"), None);
    }

    #[test]
    fn test_parse_retry_after_caps_at_one_hour() {
        assert_eq!(parse_retry_after("86400"), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
        let future = std::time::SystemTime::now() + Duration::from_secs(120);
        let parsed = parse_retry_after(&httpdate::fmt_http_date(future)).unwrap();
        assert!(parsed > Duration::from_secs(100) && parsed <= Duration::from_secs(120));
    }
}
