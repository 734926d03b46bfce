//! Versioned, TTL'd cache-through layer with single-flight request coalescing.
//!
//! At most one fetch per key runs at a time. The fetch executes on its own
//! task and every concurrent caller subscribes to its shared result, so a
//! caller that is cancelled neither aborts the fetch nor disturbs the others.
//! Expired entries are kept and served as a stale fallback when a refresh
//! fails. With a stale retention set, an entry is dropped once it has been
//! expired for longer than the retention; writes periodically sweep such
//! entries so keys that are never requested again do not accumulate.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::error::ResilienceError;
use crate::SourceId;

/// Defines the behavior of the in-memory cache for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Read from the cache if a non-expired entry is present;
    /// otherwise fetch and write the response to the cache. (Default)
    #[default]
    Use,
    /// Always fetch, bypassing any fresh entry, and write the new response.
    /// Coalescing and stale fallback still apply.
    Refresh,
    /// Always fetch and neither read from nor write to the cache.
    Bypass,
}

/// How a lookup was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from an unexpired entry, or from a fetch another caller started.
    Hit,
    /// This caller triggered the fetch that produced the value.
    Miss,
    /// The fetch failed and an expired entry was served instead.
    Stale,
}

/// One cached value with its provenance. Entries are replaced whole, never
/// mutated in place.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub source: SourceId,
    pub as_of: OffsetDateTime,
    pub cached_at: Instant,
    pub ttl: Duration,
    pub version: String,
}

impl<V> CacheEntry<V> {
    pub fn expires_at(&self) -> Instant {
        self.cached_at + self.ttl
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now > self.expires_at()
    }
}

/// Value produced by a successful upstream fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<V> {
    pub value: V,
    pub source: SourceId,
    pub as_of: OffsetDateTime,
}

/// Writes between two retention sweeps.
const SWEEP_EVERY_WRITES: usize = 64;

type FetchOutcome<V> = Result<Arc<CacheEntry<V>>, ResilienceError>;
type SharedFetch<V> = Shared<BoxFuture<'static, FetchOutcome<V>>>;

struct CacheInner<V> {
    entries: DashMap<String, Arc<CacheEntry<V>>>,
    in_flight: DashMap<String, SharedFetch<V>>,
    version: String,
    stale_retention: Option<Duration>,
    writes: AtomicUsize,
}

/// Removes the in-flight marker when the fetch task ends, including by panic.
struct InFlightGuard<V> {
    inner: Arc<CacheInner<V>>,
    key: String,
}

impl<V> Drop for InFlightGuard<V> {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.key);
    }
}

/// Thread-safe cache keyed by logical request key, namespaced by version.
///
/// Both maps are sharded, so unrelated keys never contend on a lock.
pub struct CacheStore<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for CacheStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> std::fmt::Debug for CacheStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("version", &self.inner.version)
            .field("entries", &self.inner.entries.len())
            .field("in_flight", &self.inner.in_flight.len())
            .field("stale_retention", &self.inner.stale_retention)
            .finish()
    }
}

/// Joins a request prefix and its parameters into a logical cache key,
/// e.g. `request_key("bars", &["AAPL", "1d"])` is `"bars:AAPL:1d"`.
pub fn request_key(prefix: &str, parts: &[&str]) -> String {
    let mut key = String::from(prefix);
    for part in parts {
        key.push(':');
        key.push_str(part);
    }
    key
}

impl<V> CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache whose keys are namespaced by `version`. Bumping the
    /// version makes every existing entry unreachable without a sweep.
    pub fn new(version: impl Into<String>) -> Self {
        Self::build(version.into(), None)
    }

    /// Like [`new`](Self::new), but entries expired for longer than
    /// `retention` are no longer served as stale and get swept on writes.
    pub fn with_stale_retention(version: impl Into<String>, retention: Duration) -> Self {
        Self::build(version.into(), Some(retention))
    }

    fn build(version: String, stale_retention: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                in_flight: DashMap::new(),
                version,
                stale_retention,
                writes: AtomicUsize::new(0),
            }),
        }
    }

    pub fn stale_retention(&self) -> Option<Duration> {
        self.inner.stale_retention
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }

    pub fn versioned_key(&self, key: &str) -> String {
        format!("{key}:{}", self.inner.version)
    }

    /// Returns a fresh value, or runs `fetch` at most once across concurrent
    /// callers for the same key.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<(Arc<CacheEntry<V>>, CacheStatus), ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Fetched<V>, ResilienceError>> + Send + 'static,
    {
        self.get_or_fetch_with_mode(key, ttl, CacheMode::Use, fetch)
            .await
    }

    pub async fn get_or_fetch_with_mode<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        mode: CacheMode,
        fetch: F,
    ) -> Result<(Arc<CacheEntry<V>>, CacheStatus), ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Fetched<V>, ResilienceError>> + Send + 'static,
    {
        let full_key = self.versioned_key(key);

        if mode == CacheMode::Bypass {
            let fetched = fetch().await?;
            let entry = self.build_entry(full_key, fetched, ttl);
            return Ok((Arc::new(entry), CacheStatus::Miss));
        }

        if mode == CacheMode::Use {
            if let Some(entry) = self.fresh(&full_key) {
                return Ok((entry, CacheStatus::Hit));
            }
        }

        let (shared, leader) = match self.inner.in_flight.entry(full_key.clone()) {
            Entry::Occupied(occupied) => (occupied.get().clone(), false),
            Entry::Vacant(vacant) => {
                // A fetch may have finished between the first check and taking
                // the in-flight slot.
                if mode == CacheMode::Use {
                    if let Some(entry) = self.fresh(&full_key) {
                        return Ok((entry, CacheStatus::Hit));
                    }
                }
                // The vacant entry holds the shard lock, so the task's guard
                // cannot remove the marker before it is inserted.
                let shared = self.spawn_fetch(full_key.clone(), ttl, fetch());
                vacant.insert(shared.clone());
                (shared, true)
            }
        };

        match shared.await {
            Ok(entry) => {
                let status = if leader {
                    CacheStatus::Miss
                } else {
                    CacheStatus::Hit
                };
                Ok((entry, status))
            }
            Err(error) => {
                let now = Instant::now();
                let Some(previous) = self
                    .get_any(key)
                    .filter(|entry| self.is_retained(entry, now))
                else {
                    return Err(error);
                };
                if previous.is_expired_at(now) {
                    tracing::warn!(
                        key = %full_key,
                        source = %previous.source,
                        error = %error,
                        "refresh failed, serving stale entry"
                    );
                    Ok((previous, CacheStatus::Stale))
                } else {
                    Ok((previous, CacheStatus::Hit))
                }
            }
        }
    }

    fn spawn_fetch<Fut>(&self, full_key: String, ttl: Duration, fetch: Fut) -> SharedFetch<V>
    where
        Fut: Future<Output = Result<Fetched<V>, ResilienceError>> + Send + 'static,
    {
        let store = self.clone();
        let guard = InFlightGuard {
            inner: Arc::clone(&self.inner),
            key: full_key.clone(),
        };
        let task = tokio::spawn(async move {
            let guard = guard;
            let fetched = fetch.await?;
            let entry = Arc::new(store.build_entry(guard.key.clone(), fetched, ttl));
            store.insert(guard.key.clone(), Arc::clone(&entry));
            Ok::<_, ResilienceError>(entry)
        });

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(ResilienceError::Internal {
                    key: full_key,
                    message: join_error.to_string(),
                }),
            }
        }
        .boxed()
        .shared()
    }

    fn build_entry(&self, full_key: String, fetched: Fetched<V>, ttl: Duration) -> CacheEntry<V> {
        CacheEntry {
            key: full_key,
            value: fetched.value,
            source: fetched.source,
            as_of: fetched.as_of,
            cached_at: Instant::now(),
            ttl,
            version: self.inner.version.clone(),
        }
    }

    fn insert(&self, full_key: String, entry: Arc<CacheEntry<V>>) {
        self.inner.entries.insert(full_key, entry);
        let writes = self.inner.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY_WRITES == 0 {
            let removed = self.purge_expired();
            if removed > 0 {
                tracing::debug!(removed, "swept entries past stale retention");
            }
        }
    }

    fn is_retained(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        match self.inner.stale_retention {
            Some(retention) => now.saturating_duration_since(entry.expires_at()) <= retention,
            None => true,
        }
    }

    fn fresh(&self, full_key: &str) -> Option<Arc<CacheEntry<V>>> {
        let entry = self.inner.entries.get(full_key)?;
        if entry.is_expired_at(Instant::now()) {
            None
        } else {
            Some(Arc::clone(entry.value()))
        }
    }

    /// Unexpired entry for `key`, if any.
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry<V>>> {
        self.fresh(&self.versioned_key(key))
    }

    /// Entry for `key` regardless of age.
    pub fn get_any(&self, key: &str) -> Option<Arc<CacheEntry<V>>> {
        self.inner
            .entries
            .get(&self.versioned_key(key))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Writes (overwrites) an entry directly.
    pub fn put(&self, key: &str, fetched: Fetched<V>, ttl: Duration) -> Arc<CacheEntry<V>> {
        let full_key = self.versioned_key(key);
        let entry = Arc::new(self.build_entry(full_key.clone(), fetched, ttl));
        self.insert(full_key, Arc::clone(&entry));
        entry
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.inner
            .entries
            .remove(&self.versioned_key(key))
            .is_some()
    }

    /// Time until the entry expires; `Some(ZERO)` once expired, `None` if absent.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let entry = self.inner.entries.get(&self.versioned_key(key))?;
        Some(entry.expires_at().saturating_duration_since(Instant::now()))
    }

    /// Drops entries cached more than `max_age` ago, expired or not. Returns
    /// how many were removed.
    pub fn purge_older_than(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.inner.entries.len();
        self.inner
            .entries
            .retain(|_, entry| now.saturating_duration_since(entry.cached_at) <= max_age);
        before.saturating_sub(self.inner.entries.len())
    }

    /// Drops entries that have been expired for longer than the stale
    /// retention. Without a retention nothing is removed.
    pub fn purge_expired(&self) -> usize {
        if self.inner.stale_retention.is_none() {
            return 0;
        }
        let now = Instant::now();
        let before = self.inner.entries.len();
        self.inner
            .entries
            .retain(|_, entry| self.is_retained(entry, now));
        before.saturating_sub(self.inner.entries.len())
    }

    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    /// Number of entries, including expired ones kept for stale fallback.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }
}
