//! Behavior-driven tests for fallback orchestration
//!
//! These tests verify WHAT a caller observes when upstream sources fail,
//! trip their breakers, or run out of tokens, focusing on the returned
//! provenance and the telemetry left behind.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use feedline_core::{
    CacheStore, Candidate, CircuitState, FallbackOrchestrator, ResilienceError, SourceConfig,
    SourceError, SourceErrorKind, SourceId, SourceRegistry,
};

fn id(name: &str) -> SourceId {
    SourceId::parse(name).expect("valid source name")
}

fn orchestrator_with(sources: &[(&str, SourceConfig)]) -> FallbackOrchestrator<String> {
    let registry = Arc::new(SourceRegistry::new());
    for (name, config) in sources {
        registry.register(id(name), config.clone());
    }
    FallbackOrchestrator::new(registry, CacheStore::new("v1"))
}

fn answering(name: &str, value: &'static str, calls: &Arc<AtomicUsize>) -> Candidate<String> {
    let calls = Arc::clone(calls);
    Candidate::new(id(name), move || {
        calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, SourceError>(String::from(value)) }
    })
}

fn hanging(name: &str) -> Candidate<String> {
    Candidate::new(id(name), || async {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok::<_, SourceError>(String::from("never"))
    })
}

fn failing(name: &str, status: u16) -> Candidate<String> {
    Candidate::new(id(name), move || async move {
        Err::<String, _>(SourceError::rejected(format!("HTTP {status}"), true))
    })
}

fn quick_timeout() -> SourceConfig {
    SourceConfig {
        timeout_ms: 200,
        ..SourceConfig::default()
    }
}

// =============================================================================
// Orchestration: Skipping Unhealthy Sources
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_primary_circuit_is_open_system_uses_fallback_without_calling_primary() {
    // Given: stooq has tripped its breaker and yahoo_finance is healthy
    let orchestrator = orchestrator_with(&[
        (
            "stooq",
            SourceConfig {
                failure_threshold: 1,
                recovery_timeout_secs: 60.0,
                ..SourceConfig::default()
            },
        ),
        ("yahoo_finance", SourceConfig::default()),
    ]);
    let stooq = orchestrator.registry().get(&id("stooq")).expect("registered");
    stooq.breaker().record_failure();
    assert_eq!(stooq.breaker().state(), CircuitState::Open);

    let stooq_calls = Arc::new(AtomicUsize::new(0));
    let yahoo_calls = Arc::new(AtomicUsize::new(0));

    // When: A caller fetches bars with stooq first in line
    let result = orchestrator
        .fetch(
            "bars:AAPL",
            vec![
                answering("stooq", "stooq bars", &stooq_calls),
                answering("yahoo_finance", "yahoo bars", &yahoo_calls),
            ],
            Duration::from_secs(60),
        )
        .await
        .expect("fallback should succeed");

    // Then: The value comes from yahoo_finance and stooq was never called
    assert_eq!(result.source, id("yahoo_finance"));
    assert_eq!(result.value, "yahoo bars");
    assert_eq!(stooq_calls.load(Ordering::SeqCst), 0);

    // And: stooq recorded nothing while yahoo_finance recorded one success
    let stats = orchestrator.registry().all_stats();
    assert_eq!(stats[0].source, id("stooq"));
    assert_eq!(stats[0].requests_in_window, 0);
    assert_eq!(stats[1].requests_in_window, 1);
    assert_eq!(stats[1].failures_in_window, 0);
}

#[tokio::test(start_paused = true)]
async fn when_source_is_disabled_system_skips_it_and_keeps_it_closed() {
    // Given: stooq is switched off by its feature flag
    let orchestrator = orchestrator_with(&[
        ("stooq", SourceConfig::default().with_enabled(false)),
        ("yahoo_finance", SourceConfig::default()),
    ]);
    let calls = Arc::new(AtomicUsize::new(0));

    // When: A caller fetches a quote
    let result = orchestrator
        .fetch(
            "quote:MSFT",
            vec![
                answering("stooq", "stooq quote", &calls),
                answering("yahoo_finance", "yahoo quote", &calls),
            ],
            Duration::from_secs(300),
        )
        .await
        .expect("fallback should succeed");

    // Then: Only yahoo_finance was called and stooq's breaker is untouched
    assert_eq!(result.source, id("yahoo_finance"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = orchestrator.registry().all_stats();
    assert_eq!(stats[0].circuit_state, CircuitState::Closed);
    assert!(!stats[0].enabled);
}

// =============================================================================
// Orchestration: Exhausted Candidates
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_every_source_times_out_system_names_each_one_in_the_error() {
    // Given: Two sources that never answer within their deadline
    let orchestrator = orchestrator_with(&[("stooq", quick_timeout()), ("yahoo_finance", quick_timeout())]);

    // When: A caller fetches with no cached value available
    let error = orchestrator
        .fetch(
            "bars:NVDA",
            vec![hanging("stooq"), hanging("yahoo_finance")],
            Duration::from_secs(60),
        )
        .await
        .expect_err("nothing can answer");

    // Then: The single error lists both sources as timed out, in order
    assert!(matches!(error, ResilienceError::AllSourcesUnavailable { .. }));
    assert_eq!(error.code(), "orchestrator.all_sources_unavailable");
    let attempts = error.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].source, id("stooq"));
    assert_eq!(attempts[1].source, id("yahoo_finance"));
    assert!(attempts
        .iter()
        .all(|attempt| attempt.error.kind() == SourceErrorKind::Timeout));

    let message = error.to_string();
    assert!(message.contains("stooq"));
    assert!(message.contains("yahoo_finance"));

    // And: Each timeout counted as one failure for its source
    for stats in orchestrator.registry().all_stats() {
        assert_eq!(stats.failures_in_window, 1);
    }
}

#[tokio::test(start_paused = true)]
async fn when_failures_reach_threshold_system_opens_circuit_and_stops_calling() {
    // Given: A source that trips after three failures
    let orchestrator = orchestrator_with(&[(
        "yahoo_finance",
        SourceConfig {
            failure_threshold: 3,
            recovery_timeout_secs: 120.0,
            ..SourceConfig::default()
        },
    )]);

    // When: Three distinct requests fail
    for symbol in ["AAPL", "MSFT", "GOOG"] {
        let _ = orchestrator
            .fetch(
                &format!("quote:{symbol}"),
                vec![failing("yahoo_finance", 503)],
                Duration::from_secs(300),
            )
            .await;
    }

    // Then: The circuit is open and the next call is skipped locally
    let error = orchestrator
        .fetch(
            "quote:AMZN",
            vec![failing("yahoo_finance", 503)],
            Duration::from_secs(300),
        )
        .await
        .expect_err("circuit is open");
    assert_eq!(error.attempts()[0].error.kind(), SourceErrorKind::CircuitOpen);
    assert_eq!(orchestrator.registry().all_stats()[0].requests_in_window, 3);

    // And: After the recovery timeout one trial is let through and closes it
    tokio::time::advance(Duration::from_secs(120)).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let result = orchestrator
        .fetch(
            "quote:AMZN",
            vec![answering("yahoo_finance", "recovered", &calls)],
            Duration::from_secs(300),
        )
        .await
        .expect("trial succeeds");
    assert_eq!(result.value, "recovered");
    assert_eq!(
        orchestrator.registry().all_stats()[0].circuit_state,
        CircuitState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn when_call_from_before_the_trip_fails_during_recovery_system_lets_the_trial_decide() {
    // Given: A source that trips on one failure, recovers after 1s and allows minute-long calls
    let orchestrator = orchestrator_with(&[(
        "stooq",
        SourceConfig {
            failure_threshold: 1,
            recovery_timeout_secs: 1.0,
            timeout_ms: 60_000,
            ..SourceConfig::default()
        },
    )]);
    let metrics = orchestrator.registry().get(&id("stooq")).expect("registered");

    // And: A slow call admitted while the circuit was still closed
    let slow_started = Arc::new(Notify::new());
    let slow_call = {
        let orchestrator = orchestrator.clone();
        let started = Arc::clone(&slow_started);
        tokio::spawn(async move {
            let candidate = Candidate::new(id("stooq"), move || {
                started.notify_one();
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Err::<String, _>(SourceError::rejected("HTTP 503", true))
                }
            });
            orchestrator
                .fetch("quote:AAPL", vec![candidate], Duration::from_secs(60))
                .await
        })
    };
    slow_started.notified().await;

    // And: A fast failure trips the circuit
    orchestrator
        .fetch("quote:MSFT", vec![failing("stooq", 503)], Duration::from_secs(60))
        .await
        .expect_err("source rejected the call");
    assert_eq!(metrics.breaker().state(), CircuitState::Open);

    // And: After recovery a trial call is in flight
    tokio::time::advance(Duration::from_millis(1_500)).await;
    let trial_started = Arc::new(Notify::new());
    let trial_call = {
        let orchestrator = orchestrator.clone();
        let started = Arc::clone(&trial_started);
        tokio::spawn(async move {
            let candidate = Candidate::new(id("stooq"), move || {
                started.notify_one();
                async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<_, SourceError>(String::from("recovered quote"))
                }
            });
            orchestrator
                .fetch("quote:GOOG", vec![candidate], Duration::from_secs(60))
                .await
        })
    };
    trial_started.notified().await;
    assert_eq!(metrics.breaker().state(), CircuitState::HalfOpen);

    // When: The slow call fails while the trial is still running
    let slow_result = slow_call.await.expect("task");
    assert!(slow_result.is_err());

    // Then: The circuit still waits on the trial and admits nobody else
    assert_eq!(metrics.breaker().state(), CircuitState::HalfOpen);
    assert!(!metrics.breaker().would_allow());

    // And: The trial's success closes the circuit
    let trial_result = trial_call.await.expect("task").expect("trial succeeds");
    assert_eq!(trial_result.value, "recovered quote");
    assert_eq!(metrics.breaker().state(), CircuitState::Closed);

    // And: The late failure still shows up in telemetry
    let stats = metrics.stats();
    assert_eq!(stats.requests_in_window, 3);
    assert_eq!(stats.failures_in_window, 2);
}

// =============================================================================
// Orchestration: Cache and Stale Fallback
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_ttl_expires_and_sources_fail_system_serves_stale_value_with_provenance() {
    // Given: A value cached from stooq at t=0 with a 60s TTL
    let orchestrator = orchestrator_with(&[("stooq", quick_timeout())]);
    let calls = Arc::new(AtomicUsize::new(0));
    let first = orchestrator
        .fetch(
            "bars:AAPL",
            vec![answering("stooq", "old bars", &calls)],
            Duration::from_secs(60),
        )
        .await
        .expect("initial fetch");
    assert!(!first.cached);

    // When: At t=61 the refresh times out
    tokio::time::advance(Duration::from_secs(61)).await;
    let stale = orchestrator
        .fetch("bars:AAPL", vec![hanging("stooq")], Duration::from_secs(60))
        .await
        .expect("stale fallback");

    // Then: The old value is returned, flagged stale, with the source that produced it
    assert_eq!(stale.value, "old bars");
    assert!(stale.cached);
    assert!(stale.stale);
    assert_eq!(stale.source, id("stooq"));
    assert_eq!(stale.as_of, first.as_of);
}

#[tokio::test(start_paused = true)]
async fn when_ttl_expires_and_source_recovers_system_returns_new_value() {
    // Given: A value cached at t=0 with a 60s TTL
    let orchestrator = orchestrator_with(&[("stooq", SourceConfig::default())]);
    let calls = Arc::new(AtomicUsize::new(0));
    orchestrator
        .fetch(
            "bars:AAPL",
            vec![answering("stooq", "old bars", &calls)],
            Duration::from_secs(60),
        )
        .await
        .expect("initial fetch");

    // When: Within the TTL the cache answers, after it the source is called
    let cached = orchestrator
        .fetch(
            "bars:AAPL",
            vec![answering("stooq", "unused", &calls)],
            Duration::from_secs(60),
        )
        .await
        .expect("cache hit");
    tokio::time::advance(Duration::from_secs(61)).await;
    let refreshed = orchestrator
        .fetch(
            "bars:AAPL",
            vec![answering("stooq", "new bars", &calls)],
            Duration::from_secs(60),
        )
        .await
        .expect("refresh");

    // Then: The hit was served from cache and the refresh is fresh, not stale
    assert!(cached.cached);
    assert_eq!(cached.value, "old bars");
    assert_eq!(refreshed.value, "new bars");
    assert!(!refreshed.cached);
    assert!(!refreshed.stale);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn when_many_callers_miss_together_system_fetches_once() {
    // Given: A slow source and an empty cache
    let orchestrator = orchestrator_with(&[("fred", SourceConfig::default())]);
    let calls = Arc::new(AtomicUsize::new(0));

    // When: Ten callers ask for the same series concurrently
    let mut handles = Vec::new();
    for _ in 0..10 {
        let orchestrator = orchestrator.clone();
        let calls = Arc::clone(&calls);
        handles.push(tokio::spawn(async move {
            let candidate = Candidate::new(id("fred"), move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok::<_, SourceError>(String::from("GDP series"))
                }
            });
            orchestrator
                .fetch("macro:GDP", vec![candidate], Duration::from_secs(3_600))
                .await
        }));
    }

    // Then: Exactly one upstream call was made and everyone got the same value
    let mut fresh = 0;
    for handle in handles {
        let result = handle.await.expect("task").expect("fetch");
        assert_eq!(result.value, "GDP series");
        if !result.cached {
            fresh += 1;
        }
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(fresh, 1);
}
