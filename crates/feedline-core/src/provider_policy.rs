use std::num::NonZeroU32;
use std::time::Duration;

use governor::Quota;
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::{CircuitBreakerConfig, FailurePolicy};
use crate::error::ConfigError;

/// Per-source resilience settings. Set at registration; re-registering a source
/// overwrites them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: f64,
    pub tokens_per_minute: u32,
    pub burst: u32,
    pub timeout_ms: u64,
    pub failure_policy: FailurePolicy,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout_secs: 30.0,
            tokens_per_minute: 60,
            burst: 60,
            timeout_ms: 30_000,
            failure_policy: FailurePolicy::Consecutive,
        }
    }
}

impl SourceConfig {
    /// End-of-day price feed with a generous free tier.
    pub fn stooq_default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60.0,
            tokens_per_minute: 60,
            burst: 60,
            ..Self::default()
        }
    }

    /// Unofficial price endpoint: unstable, so it trips sooner and rests longer.
    pub fn yahoo_finance_default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_secs: 120.0,
            tokens_per_minute: 2,
            burst: 10,
            ..Self::default()
        }
    }

    /// Filings registry allowing 8 requests per second.
    pub fn sec_edgar_default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60.0,
            tokens_per_minute: 480,
            burst: 8,
            ..Self::default()
        }
    }

    /// Macro series provider.
    pub fn fred_default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60.0,
            tokens_per_minute: 100,
            burst: 100,
            ..Self::default()
        }
    }

    pub fn default_for(source: &str) -> Option<Self> {
        match source {
            "stooq" => Some(Self::stooq_default()),
            "yahoo_finance" => Some(Self::yahoo_finance_default()),
            "sec_edgar" => Some(Self::sec_edgar_default()),
            "fred" => Some(Self::fred_default()),
            _ => None,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn validate(&self, source_name: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidSource {
            source_name: source_name.to_owned(),
            reason: reason.to_owned(),
        };

        if self.failure_threshold == 0 {
            return Err(invalid("failure_threshold must be greater than zero"));
        }
        if !self.recovery_timeout_secs.is_finite() || self.recovery_timeout_secs < 0.0 {
            return Err(invalid("recovery_timeout_secs must be a finite, non-negative number"));
        }
        if self.tokens_per_minute == 0 {
            return Err(invalid("tokens_per_minute must be greater than zero"));
        }
        if self.burst == 0 {
            return Err(invalid("burst must be greater than zero"));
        }
        if self.timeout_ms == 0 {
            return Err(invalid("timeout_ms must be greater than zero"));
        }
        if let FailurePolicy::Windowed { window } = self.failure_policy {
            if window.is_zero() {
                return Err(invalid("windowed failure policy needs a non-zero window"));
            }
        }
        Ok(())
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.max(1),
            recovery_timeout: Duration::try_from_secs_f64(self.recovery_timeout_secs)
                .unwrap_or(Duration::ZERO),
            failure_policy: self.failure_policy,
        }
    }

    pub fn quota(&self) -> Quota {
        let rate = NonZeroU32::new(self.tokens_per_minute).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(self.burst).unwrap_or(NonZeroU32::MIN);
        Quota::per_minute(rate).allow_burst(burst)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
