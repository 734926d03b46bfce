//! Behavior-driven tests for the cache-through layer
//!
//! These tests verify HOW cached values are served, refreshed, versioned and
//! shared between concurrent callers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use feedline_core::{
    request_key, CacheMode, CacheStatus, CacheStore, Fetched, ResilienceError, SourceId,
};
use time::OffsetDateTime;

fn fetched(value: &str) -> Fetched<String> {
    Fetched {
        value: value.to_owned(),
        source: SourceId::parse("stooq").expect("valid"),
        as_of: OffsetDateTime::now_utc(),
    }
}

fn unavailable(key: &str) -> ResilienceError {
    ResilienceError::AllSourcesUnavailable {
        key: key.to_owned(),
        attempts: Vec::new(),
    }
}

// =============================================================================
// Cache: Modes
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_refresh_mode_is_used_system_refetches_despite_fresh_entry() {
    // Given: A fresh entry for a search result
    let cache = CacheStore::new("v1");
    let key = request_key("search", &["apple"]);
    cache.put(&key, fetched("cached"), Duration::from_secs(3_600));

    // When: The caller asks for a forced refresh
    let (entry, status) = cache
        .get_or_fetch_with_mode(&key, Duration::from_secs(3_600), CacheMode::Refresh, || async {
            Ok(fetched("refetched"))
        })
        .await
        .expect("refresh");

    // Then: The new value replaces the old one
    assert_eq!(status, CacheStatus::Miss);
    assert_eq!(entry.value, "refetched");
    assert_eq!(cache.get(&key).map(|entry| entry.value.clone()), Some(String::from("refetched")));
}

#[tokio::test(start_paused = true)]
async fn when_bypass_mode_is_used_system_leaves_cache_untouched() {
    // Given: An empty cache
    let cache = CacheStore::<String>::new("v1");

    // When: A bypass lookup runs
    let (entry, status) = cache
        .get_or_fetch_with_mode("quote:AAPL", Duration::from_secs(300), CacheMode::Bypass, || async {
            Ok(fetched("direct"))
        })
        .await
        .expect("bypass");

    // Then: The value is returned but nothing was written
    assert_eq!(status, CacheStatus::Miss);
    assert_eq!(entry.value, "direct");
    assert!(cache.is_empty());
}

// =============================================================================
// Cache: Versioning and Housekeeping
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_cache_version_changes_system_ignores_old_entries() {
    // Given: Two stores over different versions
    let v1 = CacheStore::new("v1");
    let v2: CacheStore<String> = CacheStore::new("v2");
    v1.put("bars:AAPL", fetched("v1 bars"), Duration::from_secs(60));

    // Then: Keys are namespaced by version
    assert_eq!(v1.versioned_key("bars:AAPL"), "bars:AAPL:v1");
    assert!(v2.get("bars:AAPL").is_none());
    assert!(v1.get("bars:AAPL").is_some());
}

#[tokio::test(start_paused = true)]
async fn when_entries_expire_system_keeps_them_for_stale_fallback_until_purged() {
    // Given: An entry with a 60s TTL
    let cache = CacheStore::new("v1");
    cache.put("filings:AAPL", fetched("10-K"), Duration::from_secs(60));
    assert_eq!(cache.remaining_ttl("filings:AAPL"), Some(Duration::from_secs(60)));

    // When: Time moves past the TTL
    tokio::time::advance(Duration::from_secs(90)).await;

    // Then: The entry is no longer fresh but is still held
    assert!(cache.get("filings:AAPL").is_none());
    assert_eq!(cache.remaining_ttl("filings:AAPL"), Some(Duration::ZERO));
    assert_eq!(cache.len(), 1);

    // And: A failing refresh serves it as stale
    let (entry, status) = cache
        .get_or_fetch("filings:AAPL", Duration::from_secs(60), || async {
            Err(unavailable("filings:AAPL:v1"))
        })
        .await
        .expect("stale");
    assert_eq!(status, CacheStatus::Stale);
    assert_eq!(entry.value, "10-K");

    // And: Purging by age removes it
    assert_eq!(cache.purge_older_than(Duration::from_secs(60)), 1);
    assert!(cache.is_empty());
}

// =============================================================================
// Cache: Coalescing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_fetch_fails_for_coalesced_callers_system_propagates_to_all() {
    // Given: No entry and a fetch that fails after a delay
    let cache = CacheStore::<String>::new("v1");
    let calls = Arc::new(AtomicUsize::new(0));

    // When: Five callers wait on the same key
    let mut handles = Vec::new();
    for _ in 0..5 {
        let cache = cache.clone();
        let calls = Arc::clone(&calls);
        handles.push(tokio::spawn(async move {
            cache
                .get_or_fetch("fundamentals:TSLA", Duration::from_secs(60), move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Err(unavailable("fundamentals:TSLA:v1"))
                    }
                })
                .await
        }));
    }

    // Then: One fetch ran, every caller saw the error, nothing is left in flight
    for handle in handles {
        let outcome = handle.await.expect("task");
        assert!(matches!(outcome, Err(ResilienceError::AllSourcesUnavailable { .. })));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.in_flight(), 0);
    assert!(cache.is_empty());
}
