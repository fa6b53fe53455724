//! Mirror model, failure accounting, and selection.
//!
//! Mirrors in a namespace are assumed byte-equivalent; the engine's job is
//! to pick the one most likely to succeed right now. Each mirror carries a
//! bounded window of recent outcomes plus a consecutive-failure streak;
//! soft failures (5xx, 429) put the mirror behind a `next_allowed_retry`
//! deadline computed from that history, with jitter so a fleet of clients
//! does not hammer a recovering mirror in lockstep.
//!
//! All counters are mutated only by the scheduler thread, so the types here
//! are plain data with no interior mutability.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Number of recent outcomes retained per mirror for failure-ratio
/// estimation.
const STATS_WINDOW: usize = 16;

/// Exponent cap for the backoff doubling curve.
const BACKOFF_MAX_EXPONENT: u32 = 6;

/// Default per-mirror cap on simultaneous connections.
pub const DEFAULT_ALLOWED_PARALLEL_CONNECTIONS: usize = 3;

/// Protocol tag identifying which adapter serves a mirror.
///
/// The set is closed: new protocols are rare, and keeping the tags in one
/// place keeps adapter dispatch auditable. Adapter behavior itself lives
/// behind [`MirrorAdapter`](crate::MirrorAdapter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MirrorProtocol {
    /// Plain HTTP(S) origin.
    Http,
    /// Object storage requiring request signing.
    ObjectStore,
    /// Container registry requiring token exchange.
    OciRegistry,
}

impl MirrorProtocol {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::ObjectStore => "object-store",
            Self::OciRegistry => "oci-registry",
        }
    }
}

/// Sliding window of recent transfer outcomes for one mirror.
#[derive(Debug, Clone, Default)]
pub struct MirrorStats {
    /// Recent outcomes, `true` for success. Bounded to [`STATS_WINDOW`].
    window: VecDeque<bool>,
    /// Failures since the last success.
    consecutive_failures: u32,
}

impl MirrorStats {
    pub fn record(&mut self, success: bool) {
        if self.window.len() == STATS_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(success);
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
    }

    /// Fraction of recent attempts that failed, 0.0 when untried.
    pub fn failure_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Compute the backoff delay after a soft failure.
    ///
    /// The delay doubles per consecutive failure (capped), scales with the
    /// recent failure ratio so a mostly-healthy mirror recovers fast, and
    /// carries a ±25% random jitter.
    pub fn backoff_delay(&self, base: Duration, cap: Duration) -> Duration {
        use rand::Rng;

        let exponent = self.consecutive_failures.min(BACKOFF_MAX_EXPONENT);
        let doubled = base.as_secs_f64() * f64::from(1u32 << exponent);
        let scaled = doubled * (0.5 + self.failure_ratio());
        let jittered = scaled * rand::rng().random_range(0.75..1.25);
        Duration::from_secs_f64(jittered.min(cap.as_secs_f64()))
    }
}

/// One origin able to serve any resource in its namespace.
#[derive(Debug, Clone)]
pub struct Mirror {
    base_url: String,
    protocol: MirrorProtocol,
    allowed_parallel_connections: usize,
    running_transfers: usize,
    successful_transfers: u64,
    failed_transfers: u64,
    next_allowed_retry: Option<Instant>,
    last_used: Option<Instant>,
    stats: MirrorStats,
}

impl Mirror {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            protocol: MirrorProtocol::Http,
            allowed_parallel_connections: DEFAULT_ALLOWED_PARALLEL_CONNECTIONS,
            running_transfers: 0,
            successful_transfers: 0,
            failed_transfers: 0,
            next_allowed_retry: None,
            last_used: None,
            stats: MirrorStats::default(),
        }
    }

    pub fn with_protocol(mut self, protocol: MirrorProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_allowed_parallel_connections(mut self, cap: usize) -> Self {
        self.allowed_parallel_connections = cap.max(1);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn protocol(&self) -> MirrorProtocol {
        self.protocol
    }

    /// Join the mirror origin with a resource path.
    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn allowed_parallel_connections(&self) -> usize {
        self.allowed_parallel_connections
    }

    pub fn running_transfers(&self) -> usize {
        self.running_transfers
    }

    pub fn successful_transfers(&self) -> u64 {
        self.successful_transfers
    }

    pub fn failed_transfers(&self) -> u64 {
        self.failed_transfers
    }

    pub fn next_allowed_retry(&self) -> Option<Instant> {
        self.next_allowed_retry
    }

    pub fn stats(&self) -> &MirrorStats {
        &self.stats
    }

    /// Whether the mirror is excluded from selection at `now` by a pending
    /// backoff deadline.
    pub fn is_rate_limited(&self, now: Instant) -> bool {
        self.next_allowed_retry.is_some_and(|deadline| deadline > now)
    }

    fn has_free_connection(&self) -> bool {
        self.running_transfers < self.allowed_parallel_connections
    }

    pub(crate) fn transfer_started(&mut self, now: Instant) {
        self.running_transfers += 1;
        self.last_used = Some(now);
    }

    pub(crate) fn transfer_ended(&mut self) {
        debug_assert!(self.running_transfers > 0);
        self.running_transfers = self.running_transfers.saturating_sub(1);
    }

    pub(crate) fn record_success(&mut self) {
        self.successful_transfers += 1;
        self.stats.record(true);
        self.next_allowed_retry = None;
    }

    /// Record a failure that does not warrant a retry delay (transport
    /// errors, 4xx, verification failures).
    pub(crate) fn record_failure(&mut self) {
        self.failed_transfers += 1;
        self.stats.record(false);
    }

    /// Record a soft failure (5xx, 429) and exclude the mirror until the
    /// computed deadline.
    pub(crate) fn record_soft_failure(&mut self, now: Instant, base: Duration, cap: Duration) {
        self.failed_transfers += 1;
        self.stats.record(false);
        let delay = self.stats.backoff_delay(base, cap);
        self.next_allowed_retry = Some(now + delay);
        tracing::debug!(
            mirror = %self.base_url,
            delay_ms = delay.as_millis() as u64,
            consecutive_failures = self.stats.consecutive_failures(),
            "mirror backing off"
        );
    }
}

/// Outcome of a selection attempt over a namespace's mirror list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MirrorSelection {
    /// Index of the chosen mirror.
    Selected(usize),
    /// Untried mirrors exist but all are rate-limited or saturated;
    /// re-evaluate on a later tick.
    Busy,
    /// Every mirror has been tried; the target cannot proceed.
    Exhausted,
}

/// Choose a mirror for the next attempt.
///
/// Eligible mirrors are those not yet tried, past their retry deadline, and
/// below their connection cap. Among those, the lowest recent failure ratio
/// wins; ties go to the least recently used.
pub(crate) fn select_mirror(
    mirrors: &[Mirror],
    tried: &HashSet<usize>,
    now: Instant,
) -> MirrorSelection {
    if mirrors.len() == tried.len() {
        return MirrorSelection::Exhausted;
    }

    let mut best: Option<(usize, f64, Option<Instant>)> = None;
    for (index, mirror) in mirrors.iter().enumerate() {
        if tried.contains(&index) {
            continue;
        }
        if mirror.is_rate_limited(now) || !mirror.has_free_connection() {
            continue;
        }
        let ratio = mirror.stats.failure_ratio();
        let candidate = (index, ratio, mirror.last_used);
        best = match best {
            None => Some(candidate),
            Some(current) => {
                let (_, best_ratio, best_used) = current;
                if ratio < best_ratio || (ratio == best_ratio && mirror.last_used < best_used) {
                    Some(candidate)
                } else {
                    Some(current)
                }
            }
        };
    }

    match best {
        Some((index, _, _)) => MirrorSelection::Selected(index),
        None => MirrorSelection::Busy,
    }
}

/// Namespace → ordered mirror list.
///
/// Owned by the [`Downloader`](crate::Downloader); targets refer to mirrors
/// by index into their namespace's list, so the lists must not be reordered
/// once downloads are running.
#[derive(Debug, Clone, Default)]
pub struct MirrorMap {
    namespaces: HashMap<String, Vec<Mirror>>,
}

impl MirrorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, namespace: impl Into<String>, mirrors: Vec<Mirror>) {
        self.namespaces.insert(namespace.into(), mirrors);
    }

    pub fn get(&self, namespace: &str) -> Option<&[Mirror]> {
        self.namespaces.get(namespace).map(Vec::as_slice)
    }

    pub(crate) fn get_mut(&mut self, namespace: &str) -> Option<&mut Vec<Mirror>> {
        self.namespaces.get_mut(namespace)
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Mirror])> {
        self.namespaces.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Earliest pending retry deadline across all mirrors, if any.
    pub(crate) fn earliest_retry(&self, now: Instant) -> Option<Instant> {
        self.namespaces
            .values()
            .flatten()
            .filter_map(Mirror::next_allowed_retry)
            .filter(|deadline| *deadline > now)
            .min()
    }
}
