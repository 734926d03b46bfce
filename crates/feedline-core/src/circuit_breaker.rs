use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Runtime circuit state for one upstream source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// How failures accumulate toward the threshold while `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any success resets the counter.
    Consecutive,
    /// Failures inside the trailing window count toward the threshold;
    /// successes do not remove them.
    Windowed {
        #[serde(with = "duration_secs")]
        window: Duration,
    },
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::Consecutive
    }
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            failure_policy: FailurePolicy::Consecutive,
        }
    }
}

/// Result of asking the breaker for permission to call the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; calls flow freely.
    Closed,
    /// This caller holds the single half-open trial.
    Trial,
    Rejected,
}

/// A state change observed while recording an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    recent_failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            recent_failures: VecDeque::new(),
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

impl CircuitInner {
    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.recent_failures.clear();
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    fn recovery_elapsed(&self, now: Instant, timeout: Duration) -> bool {
        self.opened_at
            .map(|opened_at| now.saturating_duration_since(opened_at) >= timeout)
            .unwrap_or(true)
    }
}

/// Thread-safe circuit breaker with lazy, check-on-access recovery.
///
/// `Open` becomes `HalfOpen` on the first availability check after the
/// recovery timeout; no timer task is involved. In `HalfOpen` exactly one
/// caller holds the trial until it reports an outcome or releases it.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Gate for one call. In `HalfOpen` this claims the single trial slot, so a
    /// caller that gets `true` must later record an outcome or call
    /// [`release_trial`](Self::release_trial).
    pub fn is_available(&self) -> bool {
        self.try_admit() != Admission::Rejected
    }

    /// Like [`is_available`](Self::is_available) but tells the caller whether
    /// it now holds the half-open trial.
    pub fn try_admit(&self) -> Admission {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Admission::Closed,
            CircuitState::Open => {
                if inner.recovery_elapsed(now, self.config.recovery_timeout) {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!("circuit half-open, admitting trial request");
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Rejected
                } else {
                    inner.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    /// Read-only availability check that never claims the trial slot.
    pub fn would_allow(&self) -> bool {
        let now = Instant::now();
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner.recovery_elapsed(now, self.config.recovery_timeout),
            CircuitState::HalfOpen => !inner.trial_in_flight,
        }
    }

    /// Hands the half-open trial back without recording an outcome, e.g. when
    /// the holder was rate-limited or cancelled before reaching the source.
    pub fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    /// Records a success as the trial holder would: while `HalfOpen` it
    /// closes the circuit.
    pub fn record_success(&self) -> Option<Transition> {
        self.record_outcome(Admission::Trial, true)
    }

    /// Records a failure as the trial holder would: while `HalfOpen` it
    /// reopens the circuit.
    pub fn record_failure(&self) -> Option<Transition> {
        self.record_outcome(Admission::Trial, false)
    }

    /// Feeds one call outcome to the breaker, tagged with the admission the
    /// call was granted. Only the trial holder resolves `HalfOpen`; a call
    /// admitted while `Closed` that finishes after the circuit tripped is
    /// telemetry only.
    pub fn record_outcome(&self, admission: Admission, success: bool) -> Option<Transition> {
        let now = Instant::now();
        let mut inner = self.lock();
        if success {
            self.on_success(&mut inner, admission)
        } else {
            self.on_failure(&mut inner, admission, now)
        }
    }

    fn on_success(&self, inner: &mut CircuitInner, admission: Admission) -> Option<Transition> {
        match inner.state {
            CircuitState::HalfOpen if admission == Admission::Trial => {
                inner.close();
                Some(Transition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Closed,
                })
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                None
            }
            // Straggler from before the circuit opened; the open decision
            // stands until the recovery trial reports.
            CircuitState::HalfOpen | CircuitState::Open => None,
        }
    }

    fn on_failure(
        &self,
        inner: &mut CircuitInner,
        admission: Admission,
        now: Instant,
    ) -> Option<Transition> {
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::HalfOpen if admission == Admission::Trial => {
                inner.open(now);
                Some(Transition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Open,
                })
            }
            CircuitState::Closed => {
                let counted = match self.config.failure_policy {
                    FailurePolicy::Consecutive => inner.consecutive_failures,
                    FailurePolicy::Windowed { window } => {
                        inner.recent_failures.push_back(now);
                        while let Some(oldest) = inner.recent_failures.front() {
                            if now.saturating_duration_since(*oldest) > window {
                                inner.recent_failures.pop_front();
                            } else {
                                break;
                            }
                        }
                        u32::try_from(inner.recent_failures.len()).unwrap_or(u32::MAX)
                    }
                };

                if counted >= self.config.failure_threshold {
                    inner.open(now);
                    Some(Transition {
                        from: CircuitState::Closed,
                        to: CircuitState::Open,
                    })
                } else {
                    None
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom)
    }
}
