//! Constants for the download module (timeouts, pacing, flush cadence).

use std::time::Duration;

/// HTTP connect timeout in seconds.
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// HTTP read timeout in seconds (large videos stream slowly).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Cumulative pacing delay per endpoint class that triggers a warning.
pub const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Upper bound for a server-provided Retry-After.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Window that per-class request quotas are expressed against.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// How often a dirty file database is flushed during a run.
pub const FILE_DB_SAVE_INTERVAL: Duration = Duration::from_secs(120);
