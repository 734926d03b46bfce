use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::Instrument;

use crate::cache::{CacheMode, CacheStatus, CacheStore, Fetched};
use crate::circuit_breaker::{Admission, CircuitState, Transition};
use crate::data_source::{Candidate, SourceError};
use crate::error::{ResilienceError, SourceAttempt, ValidationError};
use crate::metrics::SourceMetrics;
use crate::registry::SourceRegistry;
use crate::SourceId;

/// Value returned to callers together with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResult<V> {
    pub value: V,
    /// Source that produced the value, including on the cached and stale paths.
    pub source: SourceId,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
    pub cached: bool,
    pub stale: bool,
}

/// Top-level entry point: walks an ordered candidate list behind the cache.
///
/// Candidates are tried strictly in the given order. A candidate is skipped
/// without a network call when it is disabled, its circuit is open, or its
/// token bucket is empty; a timed-out or rejected call is recorded and the next
/// candidate is tried. Each source is attempted at most once per call.
pub struct FallbackOrchestrator<V> {
    registry: Arc<SourceRegistry>,
    cache: CacheStore<V>,
}

impl<V> Clone for FallbackOrchestrator<V> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            cache: self.cache.clone(),
        }
    }
}

impl<V> FallbackOrchestrator<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(registry: Arc<SourceRegistry>, cache: CacheStore<V>) -> Self {
        Self { registry, cache }
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &CacheStore<V> {
        &self.cache
    }

    pub async fn fetch(
        &self,
        key: &str,
        candidates: Vec<Candidate<V>>,
        ttl: Duration,
    ) -> Result<FetchResult<V>, ResilienceError> {
        self.fetch_with_mode(key, candidates, ttl, CacheMode::Use)
            .await
    }

    pub async fn fetch_with_mode(
        &self,
        key: &str,
        candidates: Vec<Candidate<V>>,
        ttl: Duration,
        mode: CacheMode,
    ) -> Result<FetchResult<V>, ResilienceError> {
        if key.trim().is_empty() {
            return Err(ValidationError::EmptyCacheKey.into());
        }

        let registry = Arc::clone(&self.registry);
        let chain_key = self.cache.versioned_key(key);
        let span = tracing::info_span!("fallback", key = %chain_key);
        let lookup = self
            .cache
            .get_or_fetch_with_mode(key, ttl, mode, move || {
                run_chain(registry, chain_key, dedupe_candidates(candidates)).instrument(span)
            })
            .await;

        match lookup {
            Ok((entry, status)) => Ok(FetchResult {
                value: entry.value.clone(),
                source: entry.source.clone(),
                as_of: entry.as_of,
                cached: status != CacheStatus::Miss,
                stale: status == CacheStatus::Stale,
            }),
            Err(error) => {
                tracing::error!(key, error = %error, "no source or cached value available");
                Err(error)
            }
        }
    }
}

async fn run_chain<V>(
    registry: Arc<SourceRegistry>,
    key: String,
    candidates: Vec<Candidate<V>>,
) -> Result<Fetched<V>, ResilienceError>
where
    V: Send + 'static,
{
    let mut attempts = Vec::with_capacity(candidates.len());

    for candidate in &candidates {
        let source = candidate.source().clone();
        let span = tracing::debug_span!("candidate", source = %source);
        match attempt(&registry, candidate).instrument(span).await {
            Ok(value) => {
                if !attempts.is_empty() {
                    tracing::info!(
                        source = %source,
                        skipped = attempts.len(),
                        "source fallback succeeded after earlier candidates were unavailable"
                    );
                }
                return Ok(Fetched {
                    value,
                    source,
                    as_of: OffsetDateTime::now_utc(),
                });
            }
            Err(error) => attempts.push(SourceAttempt { source, error }),
        }
    }

    tracing::warn!(attempted = attempts.len(), "fallback chain exhausted");
    Err(ResilienceError::AllSourcesUnavailable { key, attempts })
}

async fn attempt<V>(registry: &SourceRegistry, candidate: &Candidate<V>) -> Result<V, SourceError> {
    let source = candidate.source();
    let Some(metrics) = registry.get(source) else {
        tracing::warn!("candidate source is not registered, skipping");
        return Err(SourceError::not_registered(source));
    };

    if !metrics.is_enabled() {
        tracing::debug!("source disabled, skipping");
        return Err(SourceError::disabled(source));
    }

    let admission = metrics.breaker().try_admit();
    if admission == Admission::Rejected {
        tracing::debug!("circuit open, skipping");
        return Err(SourceError::circuit_open(format!(
            "circuit for '{source}' is {}",
            metrics.breaker().state().as_str()
        )));
    }
    let mut trial = TrialGuard::new(&metrics, admission == Admission::Trial);

    if !metrics.rate_limiter().try_acquire() {
        let wait = metrics.rate_limiter().retry_after();
        tracing::debug!(retry_after_ms = wait.as_millis() as u64, "rate limited, skipping");
        return Err(SourceError::rate_limited(format!(
            "'{source}' token bucket empty; retry in {:.2}s",
            wait.as_secs_f64()
        )));
    }

    let timeout = candidate
        .timeout()
        .unwrap_or_else(|| metrics.config().timeout());
    let started = Instant::now();
    let outcome = match tokio::time::timeout(timeout, candidate.start()).await {
        Ok(result) => result,
        Err(_) => Err(SourceError::timeout(format!(
            "no response from '{source}' within {}ms",
            timeout.as_millis()
        ))),
    };
    let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;

    match &outcome {
        Ok(_) => {
            trial.disarm();
            log_transition(metrics.record_admitted(admission, latency_ms, true));
        }
        Err(error) if error.kind().counts_as_failure() => {
            trial.disarm();
            tracing::warn!(latency_ms, error = %error, "source call failed");
            log_transition(metrics.record_admitted(admission, latency_ms, false));
        }
        Err(error) => {
            tracing::debug!(error = %error, "source call ended without a health signal");
        }
    }

    outcome
}

fn log_transition(transition: Option<Transition>) {
    match transition {
        Some(Transition {
            to: CircuitState::Open,
            from,
        }) => tracing::warn!(from = from.as_str(), "circuit opened"),
        Some(Transition { from, to }) => {
            tracing::info!(from = from.as_str(), to = to.as_str(), "circuit state changed")
        }
        None => {}
    }
}

/// Returns an unused half-open trial to the breaker when the holder never
/// reports an outcome: rate-limited, cancelled mid-call, or a non-health error.
struct TrialGuard<'a> {
    metrics: &'a SourceMetrics,
    armed: bool,
}

impl<'a> TrialGuard<'a> {
    fn new(metrics: &'a SourceMetrics, holds_trial: bool) -> Self {
        Self {
            metrics,
            armed: holds_trial,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.metrics.breaker().release_trial();
        }
    }
}

fn dedupe_candidates<V>(candidates: Vec<Candidate<V>>) -> Vec<Candidate<V>> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|candidate| seen.insert(candidate.source().clone()))
        .collect()
}
