//! Upstream fetch contract and per-source error classification.
//!
//! Every upstream source is reached through a [`SourceFetch`] capability that
//! turns a request into the canonical value type `V`. Vendor wire formats,
//! HTTP details and per-source retries live entirely inside the capability; the
//! orchestrator only sees `Result<V, SourceError>`.
//!
//! # Error kinds
//!
//! | Kind | Counts as failure | Origin |
//! |------|-------------------|--------|
//! | [`Timeout`](SourceErrorKind::Timeout) | yes | fetch exceeded its deadline |
//! | [`Rejected`](SourceErrorKind::Rejected) | yes | non-2xx, connection error, malformed payload |
//! | [`RateLimited`](SourceErrorKind::RateLimited) | no | local token bucket denied the call |
//! | [`CircuitOpen`](SourceErrorKind::CircuitOpen) | no | breaker open or trial already in flight |
//! | [`Disabled`](SourceErrorKind::Disabled) | no | feature flag off |
//! | [`NotRegistered`](SourceErrorKind::NotRegistered) | no | source unknown to the registry |
//! | [`Cancelled`](SourceErrorKind::Cancelled) | no | caller gave up |
//!
//! # Example
//!
//! ```rust,ignore
//! use feedline_core::{Candidate, SourceError, SourceId};
//!
//! let candidate = Candidate::new(SourceId::parse("stooq")?, || async {
//!     Ok::<_, SourceError>(String::from("2024-01-02,185.64"))
//! });
//! ```

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::SourceId;

/// Boxed future returned by [`SourceFetch::fetch`].
pub type FetchFuture<V> = Pin<Box<dyn Future<Output = Result<V, SourceError>> + Send + 'static>>;

/// Per-source error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceErrorKind {
    Timeout,
    Rejected,
    RateLimited,
    CircuitOpen,
    Disabled,
    NotRegistered,
    Cancelled,
}

impl SourceErrorKind {
    /// Whether this outcome reflects source health and must reach the breaker.
    pub const fn counts_as_failure(self) -> bool {
        matches!(self, Self::Timeout | Self::Rejected)
    }

    /// Whether the source was skipped locally without a network call.
    pub const fn is_local_skip(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::CircuitOpen | Self::Disabled | Self::NotRegistered
        )
    }
}

/// Structured source error used by orchestrator fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceError {
    kind: SourceErrorKind,
    message: String,
    retryable: bool,
}

impl SourceError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Timeout,
            message: message.into(),
            retryable: true,
        }
    }

    /// Non-2xx response, connection failure or malformed payload.
    pub fn rejected(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind: SourceErrorKind::Rejected,
            message: message.into(),
            retryable,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::RateLimited,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::CircuitOpen,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn disabled(source: &SourceId) -> Self {
        Self {
            kind: SourceErrorKind::Disabled,
            message: format!("source '{source}' is disabled"),
            retryable: false,
        }
    }

    pub fn not_registered(source: &SourceId) -> Self {
        Self {
            kind: SourceErrorKind::NotRegistered,
            message: format!("source '{source}' is not registered"),
            retryable: false,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Cancelled,
            message: message.into(),
            retryable: true,
        }
    }

    pub const fn kind(&self) -> SourceErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            SourceErrorKind::Timeout => "source.timeout",
            SourceErrorKind::Rejected => "source.rejected",
            SourceErrorKind::RateLimited => "source.rate_limited",
            SourceErrorKind::CircuitOpen => "source.circuit_open",
            SourceErrorKind::Disabled => "source.disabled",
            SourceErrorKind::NotRegistered => "source.not_registered",
            SourceErrorKind::Cancelled => "source.cancelled",
        }
    }
}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for SourceError {}

/// Upstream fetch capability for one source.
///
/// The returned future must own everything it needs: the orchestrator may run
/// it on a background task so that a cancelled caller does not abort a fetch
/// other callers are waiting on.
///
/// Closures returning a `Send + 'static` future implement this trait.
pub trait SourceFetch<V>: Send + Sync {
    fn fetch(&self) -> FetchFuture<V>;
}

impl<V, F, Fut> SourceFetch<V> for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<V, SourceError>> + Send + 'static,
{
    fn fetch(&self) -> FetchFuture<V> {
        Box::pin(self())
    }
}

/// One entry of an ordered candidate list.
pub struct Candidate<V> {
    source: SourceId,
    fetch: Arc<dyn SourceFetch<V>>,
    timeout: Option<Duration>,
}

impl<V> Clone for Candidate<V> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            fetch: Arc::clone(&self.fetch),
            timeout: self.timeout,
        }
    }
}

impl<V> std::fmt::Debug for Candidate<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("source", &self.source)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<V: 'static> Candidate<V> {
    pub fn new(source: SourceId, fetch: impl SourceFetch<V> + 'static) -> Self {
        Self {
            source,
            fetch: Arc::new(fetch),
            timeout: None,
        }
    }

    pub fn from_shared(source: SourceId, fetch: Arc<dyn SourceFetch<V>>) -> Self {
        Self {
            source,
            fetch,
            timeout: None,
        }
    }

    /// Overrides the source's configured timeout for this candidate only.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<V> Candidate<V> {
    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn start(&self) -> FetchFuture<V> {
        self.fetch.fetch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_and_rejections_count_as_failures() {
        assert!(SourceErrorKind::Timeout.counts_as_failure());
        assert!(SourceErrorKind::Rejected.counts_as_failure());
        assert!(!SourceErrorKind::RateLimited.counts_as_failure());
        assert!(!SourceErrorKind::CircuitOpen.counts_as_failure());
        assert!(!SourceErrorKind::Cancelled.counts_as_failure());
        assert!(!SourceErrorKind::Disabled.counts_as_failure());
    }

    #[test]
    fn display_includes_stable_code() {
        let error = SourceError::rejected("HTTP 503", true);
        assert_eq!(error.to_string(), "HTTP 503 (source.rejected)");
        assert!(error.retryable());
        assert_eq!(error.kind(), SourceErrorKind::Rejected);
    }

    #[tokio::test]
    async fn closures_act_as_fetch_capabilities() {
        let source = SourceId::parse("stooq").expect("valid");
        let candidate = Candidate::new(source.clone(), || async { Ok::<_, SourceError>(42_u32) })
            .with_timeout(Duration::from_millis(250));

        assert_eq!(candidate.source(), &source);
        assert_eq!(candidate.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(candidate.start().await, Ok(42));
    }
}
