//! Per-source request throttling.
//!
//! Rates are expressed as a [`governor::Quota`]: the configuration layer
//! produces one per source ([`SourceConfig::quota`](crate::SourceConfig::quota))
//! and the limiter keeps it as its rate definition. Admission itself runs on
//! a float token bucket driven by `tokio::time::Instant`, so a paused test
//! clock controls refills.

use std::num::NonZeroU32;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use governor::Quota;
use tokio::time::Instant;

/// Refillable token bucket. Invariant: `0 <= tokens <= capacity`.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(capacity: f64, refill_per_second: f64) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            tokens: capacity,
            capacity,
            refill_per_second: refill_per_second.max(0.0),
            last_refill: Instant::now(),
        }
    }

    /// Bucket sized from a `governor` quota: capacity is the burst size and one
    /// token is replenished per quota interval.
    pub fn from_quota(quota: Quota) -> Self {
        let interval = quota.replenish_interval().as_secs_f64();
        let refill = if interval > 0.0 { 1.0 / interval } else { 0.0 };
        Self::new(f64::from(quota.burst_size().get()), refill)
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one token is available, zero when one already is.
    pub fn wait_time_at(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        if self.refill_per_second <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_second)
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_second(&self) -> f64 {
        self.refill_per_second
    }
}

/// Non-blocking per-source rate limiter. A denied caller is expected to move on
/// to another source or the cache; nothing is queued here.
#[derive(Debug)]
pub struct RateLimiter {
    quota: Quota,
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(tokens_per_minute: NonZeroU32, burst: NonZeroU32) -> Self {
        Self::from_quota(Quota::per_minute(tokens_per_minute).allow_burst(burst))
    }

    pub fn from_quota(quota: Quota) -> Self {
        Self {
            quota,
            bucket: Mutex::new(TokenBucket::from_quota(quota)),
        }
    }

    /// Rate definition this limiter enforces.
    pub fn quota(&self) -> Quota {
        self.quota
    }

    pub fn try_acquire(&self) -> bool {
        self.lock().try_acquire_at(Instant::now())
    }

    /// Recommended wait before the next token is available.
    pub fn retry_after(&self) -> Duration {
        self.lock().wait_time_at(Instant::now())
    }

    /// Tokens currently available after refilling up to now.
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.tokens()
    }

    pub fn capacity(&self) -> f64 {
        self.lock().capacity()
    }

    fn lock(&self) -> MutexGuard<'_, TokenBucket> {
        // Every mutation leaves the bucket within bounds.
        self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
