//! Per-source telemetry and the state each source owns.
//!
//! Storage is bounded by count (a ring of [`DEFAULT_RECORD_CAPACITY`] records,
//! oldest evicted first) while statistics are bounded by time (records older
//! than the metrics window are ignored). The two limits are independent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::circuit_breaker::{Admission, CircuitBreaker, CircuitState, Transition};
use crate::provider_policy::SourceConfig;
use crate::throttling::RateLimiter;
use crate::SourceId;

pub const DEFAULT_METRICS_WINDOW: Duration = Duration::from_secs(300);
pub const DEFAULT_RECORD_CAPACITY: usize = 1_000;

/// Outcome of one upstream call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestRecord {
    pub timestamp: Instant,
    pub latency_ms: f64,
    pub success: bool,
}

#[derive(Debug)]
struct RequestLog {
    records: VecDeque<RequestRecord>,
    capacity: usize,
    last_success: Option<OffsetDateTime>,
    last_failure: Option<OffsetDateTime>,
}

impl RequestLog {
    fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(DEFAULT_RECORD_CAPACITY)),
            capacity: capacity.max(1),
            last_success: None,
            last_failure: None,
        }
    }

    fn push(&mut self, record: RequestRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);

        let wall = OffsetDateTime::now_utc();
        if record.success {
            self.last_success = Some(wall);
        } else {
            self.last_failure = Some(wall);
        }
    }
}

/// Aggregate statistics for one source over the trailing metrics window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStats {
    pub source: SourceId,
    pub enabled: bool,
    pub circuit_state: CircuitState,
    pub is_available: bool,
    pub requests_in_window: usize,
    pub failures_in_window: usize,
    /// Percentage in `0.0..=100.0`.
    pub failure_rate: f64,
    pub p95_latency_ms: f64,
    pub consecutive_failures: u32,
    pub tokens_available: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_failure: Option<OffsetDateTime>,
}

/// Everything one source owns: its config, breaker, token bucket and request log.
#[derive(Debug)]
pub struct SourceMetrics {
    source: SourceId,
    config: SourceConfig,
    enabled: AtomicBool,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    log: Mutex<RequestLog>,
    window: Duration,
}

impl SourceMetrics {
    pub fn new(source: SourceId, config: SourceConfig) -> Self {
        Self::with_limits(source, config, DEFAULT_METRICS_WINDOW, DEFAULT_RECORD_CAPACITY)
    }

    pub fn with_limits(
        source: SourceId,
        config: SourceConfig,
        window: Duration,
        capacity: usize,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            breaker: CircuitBreaker::new(config.breaker_config()),
            limiter: RateLimiter::from_quota(config.quota()),
            log: Mutex::new(RequestLog::new(capacity)),
            source,
            config,
            window,
        }
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Enabled and the breaker admits this caller. Claims the half-open trial.
    pub fn is_available(&self) -> bool {
        self.is_enabled() && self.breaker.is_available()
    }

    /// Appends a record and feeds the outcome to the breaker as the trial
    /// holder would report it.
    pub fn record_request(&self, latency_ms: f64, success: bool) -> Option<Transition> {
        self.record_admitted(Admission::Trial, latency_ms, success)
    }

    /// Appends a record and feeds the outcome to the breaker under the
    /// admission the call was granted.
    pub fn record_admitted(
        &self,
        admission: Admission,
        latency_ms: f64,
        success: bool,
    ) -> Option<Transition> {
        self.lock_log().push(RequestRecord {
            timestamp: Instant::now(),
            latency_ms,
            success,
        });
        self.breaker.record_outcome(admission, success)
    }

    /// Number of records held, regardless of age.
    pub fn stored_records(&self) -> usize {
        self.lock_log().records.len()
    }

    pub fn stats(&self) -> SourceStats {
        let now = Instant::now();
        let (total, failures, mut latencies, last_success, last_failure) = {
            let log = self.lock_log();
            let mut total = 0_usize;
            let mut failures = 0_usize;
            let mut latencies = Vec::new();
            for record in log
                .records
                .iter()
                .filter(|record| now.saturating_duration_since(record.timestamp) <= self.window)
            {
                total += 1;
                if record.success {
                    latencies.push(record.latency_ms);
                } else {
                    failures += 1;
                }
            }
            (total, failures, latencies, log.last_success, log.last_failure)
        };

        let failure_rate = if total > 0 {
            failures as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        SourceStats {
            source: self.source.clone(),
            enabled: self.is_enabled(),
            circuit_state: self.breaker.state(),
            is_available: self.is_enabled() && self.breaker.would_allow(),
            requests_in_window: total,
            failures_in_window: failures,
            failure_rate,
            p95_latency_ms: round2(p95(&mut latencies)),
            consecutive_failures: self.breaker.consecutive_failures(),
            tokens_available: self.limiter.available_tokens(),
            last_success,
            last_failure,
        }
    }

    fn lock_log(&self) -> MutexGuard<'_, RequestLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn p95(latencies: &mut [f64]) -> f64 {
    if latencies.is_empty() {
        return 0.0;
    }
    latencies.sort_by(f64::total_cmp);
    let index = ((latencies.len() as f64) * 0.95).floor() as usize;
    latencies[index.min(latencies.len() - 1)]
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
