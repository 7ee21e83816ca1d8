//! Per-route and global token buckets for the REST transport.
//!
//! Bucket state only ever comes from server response headers; a route we
//! have never heard about is admitted. Routes are normalised so that
//! `/channels/123` and `/channels/456` share one bucket.
//!
//! [`BucketLimiter::await_admission`] serialises waiters on a per-bucket gate
//! and reserves a slot before returning, so two callers racing on an
//! exhausted bucket cannot both slip through when it resets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::types::RateLimitInfo;

/// Key of the token-wide bucket.
pub const GLOBAL_BUCKET: &str = "global";

/// Upper bound on a single sleep; state is re-checked after every wake.
const MAX_WAIT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: Instant,
    /// Length of the last window the server reported.
    pub window: Duration,
    pub is_global: bool,
}

impl Bucket {
    /// How long until this bucket admits a request, or `None` if it does now.
    fn delay(&self, now: Instant) -> Option<Duration> {
        if self.remaining == 0 && self.reset_at > now {
            Some(self.reset_at - now)
        } else {
            None
        }
    }

    /// Take one slot. Once the reset time has passed the bucket is refilled
    /// from its last known limit and a new window of the last known length
    /// starts, so a drained bucket stays closed until a response (or that
    /// window) reopens it.
    fn reserve(&mut self, now: Instant) {
        if self.reset_at <= now {
            self.remaining = self.limit;
            self.reset_at = now + self.window;
        }
        self.remaining = self.remaining.saturating_sub(1);
    }
}

// ---------------------------------------------------------------------------
// Route normalisation
// ---------------------------------------------------------------------------

/// Collapse identifier segments to `:id` and drop the query string.
///
/// Accepts either a bare path or `"METHOD /path"`; the method is upper-cased
/// and kept so reads and writes on the same path get separate buckets.
pub fn normalize_route(route: &str) -> String {
    let (method, path) = match route.trim().split_once(' ') {
        Some((method, path)) => (Some(method), path.trim()),
        None => (None, route.trim()),
    };
    let path = path.split(|c| c == '?' || c == '#').next().unwrap_or("");

    let normalized = path
        .split('/')
        .map(|segment| if looks_like_id(segment) { ":id" } else { segment })
        .collect::<Vec<_>>()
        .join("/");

    match method {
        Some(method) => format!("{} {}", method.to_ascii_uppercase(), normalized),
        None => normalized,
    }
}

fn looks_like_id(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    let all_digits = segment.bytes().all(|b| b.is_ascii_digit());
    let object_id = segment.len() == 24 && segment.bytes().all(|b| b.is_ascii_hexdigit());
    all_digits || object_id || is_uuid(segment)
}

fn is_uuid(segment: &str) -> bool {
    segment.len() == 36
        && segment.bytes().enumerate().all(|(i, b)| match i {
            8 | 13 | 18 | 23 => b == b'-',
            _ => b.is_ascii_hexdigit(),
        })
}

/// Seconds from a header into a `Duration`, clamped to something sane.
pub(crate) fn header_secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value.min(86_400.0))
    } else {
        Duration::ZERO
    }
}

/// When the bucket described by `info` refills, relative to `now`.
fn reset_instant(info: &RateLimitInfo, now: Instant) -> Option<Instant> {
    if let Some(after) = info.reset_after {
        return Some(now + header_secs(after));
    }
    info.reset_at.map(|epoch| {
        let now_epoch = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        now + header_secs(epoch - now_epoch)
    })
}

// ---------------------------------------------------------------------------
// BucketLimiter
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct BucketLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    gates: Mutex<HashMap<String, Arc<async_lock::Mutex<()>>>>,
}

impl BucketLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a request on `route` may go out right now.
    pub fn can_admit(&self, route: &str) -> bool {
        let key = normalize_route(route);
        let buckets = self.buckets();
        Self::delay_locked(&buckets, &key, Instant::now()).is_none()
    }

    /// How long a request on `route` would currently have to wait.
    pub fn delay_for(&self, route: &str) -> Option<Duration> {
        let key = normalize_route(route);
        let buckets = self.buckets();
        Self::delay_locked(&buckets, &key, Instant::now())
    }

    /// Wait only as long as needed, then reserve a slot on `route`.
    pub async fn await_admission(&self, route: &str) {
        let key = normalize_route(route);
        let gate = self.gate(&key);
        let _turn = gate.lock().await;

        loop {
            let delay = {
                let mut buckets = self.buckets();
                let now = Instant::now();
                match Self::delay_locked(&buckets, &key, now) {
                    Some(delay) => delay,
                    None => {
                        if let Some(bucket) = buckets.get_mut(&key) {
                            bucket.reserve(now);
                        }
                        return;
                    }
                }
            };
            let delay = delay.min(MAX_WAIT);
            debug!(
                route = %key,
                delay_ms = delay.as_millis() as u64,
                "rate-limit pre-emptive backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Update bucket state from a response's rate-limit headers.
    pub fn record_response(&self, route: &str, info: &RateLimitInfo) {
        if info.is_empty() {
            return;
        }
        let now = Instant::now();
        let reset_at = reset_instant(info, now).unwrap_or(now);

        if info.is_global {
            warn!(route, "global rate limit reported");
            self.record_global(reset_at.saturating_duration_since(now));
            return;
        }

        let key = normalize_route(route);
        let mut buckets = self.buckets();
        let previous = buckets.get(&key);
        let limit = info
            .limit
            .or(previous.map(|b| b.limit))
            .unwrap_or_else(|| info.remaining.unwrap_or(1));
        let remaining = info
            .remaining
            .or(previous.map(|b| b.remaining))
            .unwrap_or(limit);
        let window = match reset_at.saturating_duration_since(now) {
            Duration::ZERO => previous.map(|b| b.window).unwrap_or_default(),
            window => window,
        };

        buckets.insert(
            key,
            Bucket {
                limit,
                remaining,
                reset_at,
                window,
                is_global: false,
            },
        );
    }

    /// Block every route until `retry_after` has elapsed.
    pub fn record_global(&self, retry_after: Duration) {
        let reset_at = Instant::now() + retry_after;
        self.buckets().insert(
            GLOBAL_BUCKET.to_string(),
            Bucket {
                limit: 0,
                remaining: 0,
                reset_at,
                window: retry_after,
                is_global: true,
            },
        );
    }

    /// Snapshot of the bucket `route` maps to.
    pub fn bucket(&self, route: &str) -> Option<Bucket> {
        self.buckets().get(&normalize_route(route)).cloned()
    }

    fn delay_locked(
        buckets: &HashMap<String, Bucket>,
        key: &str,
        now: Instant,
    ) -> Option<Duration> {
        if let Some(delay) = buckets.get(GLOBAL_BUCKET).and_then(|b| b.delay(now)) {
            return Some(delay);
        }
        buckets.get(key).and_then(|b| b.delay(now))
    }

    fn gate(&self, key: &str) -> Arc<async_lock::Mutex<()>> {
        let mut gates = self
            .gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(gates.entry(key.to_string()).or_default())
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<String, Bucket>> {
        self.buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for BucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketLimiter")
            .field("buckets", &self.buckets().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
