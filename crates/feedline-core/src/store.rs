//! Canonical store interface.
//!
//! The orchestrator never writes here itself; callers persist a successful
//! [`FetchResult`] after `fetch` returns. Stale results are skipped so an old
//! value never overwrites a newer one written by another path.

use std::future::Future;
use std::pin::Pin;

use dashmap::DashMap;
use thiserror::Error;

use crate::routing::FetchResult;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("failed to write '{key}': {message}")]
    Write { key: String, message: String },
}

/// Persistent home for canonical values, keyed by logical request key.
pub trait CanonicalStore<V>: Send + Sync {
    fn upsert<'a>(&'a self, key: &'a str, result: &'a FetchResult<V>) -> StoreFuture<'a, ()>;

    fn load<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<FetchResult<V>>>;
}

/// Writes `result` unless it came from the stale path. Returns whether a
/// write happened.
pub async fn write_through<V, S>(
    store: &S,
    key: &str,
    result: &FetchResult<V>,
) -> Result<bool, StoreError>
where
    S: CanonicalStore<V> + ?Sized,
{
    if result.stale {
        tracing::debug!(key, source = %result.source, "stale result not persisted");
        return Ok(false);
    }
    store.upsert(key, result).await?;
    Ok(true)
}

/// Process-local store.
#[derive(Debug)]
pub struct MemoryStore<V> {
    rows: DashMap<String, FetchResult<V>>,
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl<V> CanonicalStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync,
{
    fn upsert<'a>(&'a self, key: &'a str, result: &'a FetchResult<V>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.rows.insert(key.to_owned(), result.clone());
            Ok(())
        })
    }

    fn load<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<FetchResult<V>>> {
        Box::pin(async move { Ok(self.rows.get(key).map(|row| row.value().clone())) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SourceId;
    use time::OffsetDateTime;

    fn result(value: &str, stale: bool) -> FetchResult<String> {
        FetchResult {
            value: value.to_owned(),
            source: SourceId::parse("stooq").expect("valid"),
            as_of: OffsetDateTime::UNIX_EPOCH,
            cached: stale,
            stale,
        }
    }

    #[tokio::test]
    async fn fresh_results_are_persisted() {
        let store = MemoryStore::new();
        let written = write_through(&store, "bars:AAPL", &result("fresh", false))
            .await
            .expect("write");

        assert!(written);
        let loaded = store.load("bars:AAPL").await.expect("load");
        assert_eq!(loaded.map(|row| row.value), Some(String::from("fresh")));
    }

    #[tokio::test]
    async fn stale_results_are_skipped() {
        let store = MemoryStore::new();
        write_through(&store, "bars:AAPL", &result("new", false))
            .await
            .expect("write");
        let written = write_through(&store, "bars:AAPL", &result("old", true))
            .await
            .expect("write");

        assert!(!written);
        assert_eq!(store.len(), 1);
        let loaded = store.load("bars:AAPL").await.expect("load");
        assert_eq!(loaded.map(|row| row.value), Some(String::from("new")));
    }
}
