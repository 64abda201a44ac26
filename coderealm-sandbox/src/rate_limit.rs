//! Per-caller sliding-window rate limiting.
//!
//! The limiter is pure bookkeeping over a [`RateLimiterStore`]. The default
//! store lives in memory for the lifetime of the process; it is a soft
//! throttle, not a security control on its own.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Storage for per-caller request timestamps.
///
/// Implementations must keep each caller's timestamps in insertion order.
pub trait RateLimiterStore: Send + Sync {
    /// Timestamps currently recorded for `caller_id`, oldest first
    fn get(&self, caller_id: &str) -> Vec<DateTime<Utc>>;

    /// Drop every timestamp for `caller_id` older than `cutoff`
    fn prune(&self, caller_id: &str, cutoff: DateTime<Utc>);

    /// Record a request for `caller_id`
    fn append(&self, caller_id: &str, at: DateTime<Utc>);
}

/// In-memory store backed by a mutex-guarded map
#[derive(Debug, Default)]
pub struct InMemoryRateLimiterStore {
    records: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl InMemoryRateLimiterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide shared store, initialized on first use
    pub fn global() -> Arc<InMemoryRateLimiterStore> {
        static GLOBAL: OnceLock<Arc<InMemoryRateLimiterStore>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Self::new())).clone()
    }

    /// Number of callers with at least one recorded request
    pub fn tracked_callers(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<DateTime<Utc>>>> {
        // A poisoned map only means another thread panicked mid-update; the
        // timestamps themselves are still valid.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RateLimiterStore for InMemoryRateLimiterStore {
    fn get(&self, caller_id: &str) -> Vec<DateTime<Utc>> {
        self.lock().get(caller_id).cloned().unwrap_or_default()
    }

    fn prune(&self, caller_id: &str, cutoff: DateTime<Utc>) {
        let mut records = self.lock();
        if let Some(timestamps) = records.get_mut(caller_id) {
            timestamps.retain(|ts| *ts > cutoff);
            if timestamps.is_empty() {
                records.remove(caller_id);
            }
        }
    }

    fn append(&self, caller_id: &str, at: DateTime<Utc>) {
        self.lock().entry(caller_id.to_string()).or_default().push(at);
    }
}

/// Result of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
}

/// Sliding-window rate limiter
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimiterStore>,
}

impl RateLimiter {
    /// Limiter over the process-wide in-memory store
    pub fn new() -> Self {
        Self::with_store(InMemoryRateLimiterStore::global())
    }

    pub fn with_store(store: Arc<dyn RateLimiterStore>) -> Self {
        Self { store }
    }

    /// Check (and on success record) a request made now
    pub fn check(&self, caller_id: &str, max_requests: u32, window: Duration) -> RateLimitDecision {
        self.check_at(caller_id, max_requests, window, Utc::now())
    }

    /// Check (and on success record) a request made at `now`
    pub fn check_at(
        &self,
        caller_id: &str,
        max_requests: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let window = ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX);
        let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let reset_after = |oldest: DateTime<Utc>| {
            oldest.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC)
        };

        self.store.prune(caller_id, cutoff);
        let timestamps = self.store.get(caller_id);
        let count = timestamps.len() as u32;

        if count < max_requests {
            self.store.append(caller_id, now);
            let oldest = timestamps.first().copied().unwrap_or(now);
            RateLimitDecision {
                allowed: true,
                remaining: max_requests - (count + 1),
                reset_time: reset_after(oldest),
            }
        } else {
            let oldest = timestamps.first().copied().unwrap_or(now);
            tracing::debug!(caller_id, count, max_requests, "Rate limit reached");
            RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_time: reset_after(oldest),
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}
