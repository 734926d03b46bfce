use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::circuit_breaker::{CircuitState, Transition};
use crate::metrics::{SourceMetrics, SourceStats, DEFAULT_METRICS_WINDOW, DEFAULT_RECORD_CAPACITY};
use crate::provider_policy::SourceConfig;
use crate::SourceId;

/// Aggregate health label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Health report consumed by observability endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    pub status: HealthStatus,
    pub degraded_sources: Vec<SourceId>,
    pub sources: Vec<SourceStats>,
}

/// Readiness over a set of interchangeable sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub available_sources: Vec<SourceId>,
}

/// Registry of every upstream source and the resilience state it owns.
///
/// Built once at startup and shared by `Arc` with the orchestrator and the
/// health reporting path. Each source's breaker, bucket and request log sit
/// behind that source's own locks; the map itself is sharded.
#[derive(Debug)]
pub struct SourceRegistry {
    sources: DashMap<SourceId, Arc<SourceMetrics>>,
    window: Duration,
    capacity: usize,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_METRICS_WINDOW, DEFAULT_RECORD_CAPACITY)
    }

    /// Registry whose sources use the given stats window and record capacity.
    pub fn with_limits(window: Duration, capacity: usize) -> Self {
        Self {
            sources: DashMap::new(),
            window,
            capacity,
        }
    }

    /// Registers a source, replacing any previous registration and its state.
    pub fn register(&self, source: SourceId, config: SourceConfig) -> Arc<SourceMetrics> {
        let metrics = Arc::new(SourceMetrics::with_limits(
            source.clone(),
            config,
            self.window,
            self.capacity,
        ));
        if self.sources.insert(source.clone(), Arc::clone(&metrics)).is_some() {
            tracing::info!(source = %source, "source re-registered, resilience state reset");
        }
        metrics
    }

    pub fn get(&self, source: &SourceId) -> Option<Arc<SourceMetrics>> {
        self.sources.get(source).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, source: &SourceId) -> bool {
        self.sources.contains_key(source)
    }

    /// Flips the feature flag while keeping breaker and telemetry state.
    /// Returns `false` when the source is not registered.
    pub fn set_enabled(&self, source: &SourceId, enabled: bool) -> bool {
        match self.get(source) {
            Some(metrics) => {
                metrics.set_enabled(enabled);
                tracing::info!(source = %source, enabled, "source feature flag changed");
                true
            }
            None => false,
        }
    }

    /// Enabled and not tripped. Claims the half-open trial when one is due.
    /// Unregistered sources are never available.
    pub fn is_available(&self, source: &SourceId) -> bool {
        self.get(source)
            .map(|metrics| metrics.is_available())
            .unwrap_or(false)
    }

    pub fn record_request(
        &self,
        source: &SourceId,
        latency_ms: f64,
        success: bool,
    ) -> Option<Transition> {
        self.get(source)
            .and_then(|metrics| metrics.record_request(latency_ms, success))
    }

    /// Stats for every registered source, ordered by source name.
    pub fn all_stats(&self) -> Vec<SourceStats> {
        let mut handles = self
            .sources
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect::<Vec<_>>();
        handles.sort_by(|left, right| left.source().cmp(right.source()));
        handles.iter().map(|metrics| metrics.stats()).collect()
    }

    pub fn health_summary(&self) -> HealthSummary {
        let sources = self.all_stats();
        let degraded_sources = sources
            .iter()
            .filter(|stats| !stats.enabled || stats.circuit_state != CircuitState::Closed)
            .map(|stats| stats.source.clone())
            .collect::<Vec<_>>();

        HealthSummary {
            status: if degraded_sources.is_empty() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            degraded_sources,
            sources,
        }
    }

    /// Ready when at least one of `sources` could take a request right now.
    /// Does not claim half-open trials.
    pub fn readiness(&self, sources: &[SourceId]) -> Readiness {
        let available_sources = sources
            .iter()
            .filter(|source| {
                self.get(source)
                    .map(|metrics| metrics.is_enabled() && metrics.breaker().would_allow())
                    .unwrap_or(false)
            })
            .cloned()
            .collect::<Vec<_>>();

        Readiness {
            ready: !available_sources.is_empty(),
            available_sources,
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> SourceId {
        SourceId::parse(name).expect("valid source")
    }

    fn tight_config() -> SourceConfig {
        SourceConfig {
            failure_threshold: 2,
            recovery_timeout_secs: 60.0,
            ..SourceConfig::default()
        }
    }

    #[test]
    fn healthy_when_all_sources_closed_and_enabled() {
        let registry = SourceRegistry::new();
        registry.register(id("stooq"), tight_config());
        registry.register(id("fred"), tight_config());

        let summary = registry.health_summary();
        assert_eq!(summary.status, HealthStatus::Healthy);
        assert!(summary.degraded_sources.is_empty());
        assert_eq!(summary.sources.len(), 2);
        assert_eq!(summary.sources[0].source, id("fred"));
    }

    #[test]
    fn degraded_when_a_source_is_disabled() {
        let registry = SourceRegistry::new();
        registry.register(id("stooq"), tight_config());
        registry.register(id("yahoo_finance"), tight_config().with_enabled(false));

        let summary = registry.health_summary();
        assert_eq!(summary.status, HealthStatus::Degraded);
        assert_eq!(summary.degraded_sources, vec![id("yahoo_finance")]);
    }

    #[test]
    fn degraded_when_a_circuit_opens() {
        let registry = SourceRegistry::new();
        registry.register(id("stooq"), tight_config());

        registry.record_request(&id("stooq"), 100.0, false);
        assert_eq!(registry.health_summary().status, HealthStatus::Healthy);
        let transition = registry.record_request(&id("stooq"), 100.0, false);

        assert_eq!(transition.map(|t| t.to), Some(CircuitState::Open));
        assert!(!registry.is_available(&id("stooq")));
        assert_eq!(registry.health_summary().degraded_sources, vec![id("stooq")]);
    }

    #[test]
    fn unregistered_sources_are_unavailable_and_unrecorded() {
        let registry = SourceRegistry::new();
        assert!(!registry.is_available(&id("ghost")));
        assert_eq!(registry.record_request(&id("ghost"), 1.0, false), None);
        assert!(registry.all_stats().is_empty());
    }

    #[test]
    fn set_enabled_keeps_telemetry() {
        let registry = SourceRegistry::new();
        registry.register(id("stooq"), tight_config());
        registry.record_request(&id("stooq"), 10.0, true);

        assert!(registry.set_enabled(&id("stooq"), false));
        assert!(!registry.is_available(&id("stooq")));
        assert_eq!(registry.all_stats()[0].requests_in_window, 1);

        assert!(registry.set_enabled(&id("stooq"), true));
        assert!(registry.is_available(&id("stooq")));
        assert!(!registry.set_enabled(&id("ghost"), true));
    }

    #[test]
    fn re_register_overwrites_state() {
        let registry = SourceRegistry::new();
        registry.register(id("stooq"), tight_config());
        registry.record_request(&id("stooq"), 10.0, false);
        registry.record_request(&id("stooq"), 10.0, false);
        assert!(!registry.is_available(&id("stooq")));

        registry.register(id("stooq"), tight_config());
        assert!(registry.is_available(&id("stooq")));
        assert_eq!(registry.all_stats()[0].requests_in_window, 0);
    }

    #[test]
    fn readiness_needs_one_available_source() {
        let registry = SourceRegistry::new();
        registry.register(id("stooq"), tight_config().with_enabled(false));
        registry.register(id("yahoo_finance"), tight_config());

        let ready = registry.readiness(&[id("stooq"), id("yahoo_finance")]);
        assert!(ready.ready);
        assert_eq!(ready.available_sources, vec![id("yahoo_finance")]);

        let not_ready = registry.readiness(&[id("stooq"), id("ghost")]);
        assert!(!not_ready.ready);
    }
}
