//! Per-IP token bucket for the login and code-request endpoints.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

pub const BUCKET_CAPACITY: f64 = 10.0;
pub const REFILL_WINDOW: Duration = Duration::from_secs(60);
pub const IDLE_EVICTION: Duration = Duration::from_secs(60 * 60);

struct Bucket {
    tokens: f64,
    last_seen: Instant,
}

/// Continuous-refill token bucket keyed by client IP. A rejected request
/// does not consume a token, so a client under limit recovers on schedule
/// rather than being pushed further out by its own retries.
pub struct RateLimiter {
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        RateLimiter {
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter::default()
    }

    pub fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        let refill_per_sec = BUCKET_CAPACITY / REFILL_WINDOW.as_secs_f64();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(ip).or_insert(Bucket {
            tokens: BUCKET_CAPACITY,
            last_seen: now,
        });
        let elapsed = now.saturating_duration_since(bucket.last_seen);
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * refill_per_sec).min(BUCKET_CAPACITY);
        bucket.last_seen = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets idle for longer than [`IDLE_EVICTION`]. Called from the
    /// hourly maintenance tick.
    pub fn prune(&self) {
        self.prune_at(Instant::now());
    }

    fn prune_at(&self, now: Instant) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_duration_since(b.last_seen) < IDLE_EVICTION);
        let evicted = before - buckets.len();
        if evicted > 0 {
            debug!(target: "gamwich", evicted, "rate_limit_prune");
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
