//! Downloader configuration.

use std::time::Duration;

/// Default cap on transfers in flight across all targets.
pub const DEFAULT_MAX_PARALLEL_DOWNLOADS: usize = 5;

/// Default number of additional same-mirror attempts after a transient
/// transport error.
pub const DEFAULT_RETRIES_PER_MIRROR: u32 = 2;

/// Default total attempt budget per target, across all mirrors.
pub const DEFAULT_MAX_RETRIES: u32 = 8;

/// Default timeout for a whole HTTP request (5 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Default base delay for per-mirror exponential backoff.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 250;

/// Default ceiling for per-mirror backoff delays.
pub const DEFAULT_BACKOFF_CAP_SECS: u64 = 30;

/// Tuning knobs for the [`Downloader`](crate::Downloader).
///
/// The defaults are deliberately conservative: a small global concurrency
/// cap, a couple of same-mirror retries for flaky connections, and backoff
/// that climbs quickly on repeat offenders without locking a mirror out
/// for long.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Cap on transfers in flight across all targets. The per-mirror
    /// connection cap is enforced separately during admission.
    pub max_parallel_downloads: usize,

    /// Additional attempts against the same mirror after a transient
    /// transport error, before the mirror is marked tried.
    pub retries_per_mirror: u32,

    /// Total attempt budget per target. Exceeding it fails the target with
    /// the last error rather than cycling a large mirror list forever.
    pub max_retries: u32,

    /// Timeout applied to each HTTP request.
    pub timeout: Duration,

    /// Base delay for per-mirror exponential backoff.
    pub backoff_base: Duration,

    /// Ceiling for per-mirror backoff delays.
    pub backoff_cap: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_parallel_downloads: DEFAULT_MAX_PARALLEL_DOWNLOADS,
            retries_per_mirror: DEFAULT_RETRIES_PER_MIRROR,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_cap: Duration::from_secs(DEFAULT_BACKOFF_CAP_SECS),
        }
    }
}
