//! # Feedline Core
//!
//! Source resilience and fallback orchestration for unreliable, rate-limited
//! market data upstreams.
//!
//! ## Overview
//!
//! Every outbound read goes through a [`FallbackOrchestrator`], which decides
//! whether to call a source, which candidates to try and in what order, and
//! when to serve a cached or stale answer instead of failing:
//!
//! - **Token buckets** admit or deny calls per source without queuing
//! - **Circuit breakers** stop calling a failing source and retry it lazily
//! - **Rolling telemetry** drives health and readiness reporting
//! - **Cache-through layer** coalesces concurrent identical lookups
//! - **Provenance** on every result, including the stale path
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Versioned TTL cache with single-flight fetches |
//! | [`circuit_breaker`] | Per-source Closed / Open / HalfOpen state machine |
//! | [`config`] | TOML + environment configuration |
//! | [`data_source`] | Fetch capability contract and source errors |
//! | [`error`] | Validation, configuration and orchestration errors |
//! | [`http_client`] | HTTP transport abstraction |
//! | [`http_source`] | HTTP-backed fetch capability |
//! | [`metrics`] | Per-source request log and statistics |
//! | [`provider_policy`] | Per-source resilience settings |
//! | [`registry`] | Source registry, health and readiness |
//! | [`retry`] | Backoff schedules and retry helper |
//! | [`routing`] | Fallback orchestrator |
//! | [`source`] | Source identifiers |
//! | [`store`] | Canonical store interface |
//! | [`throttling`] | Token bucket rate limiting |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use feedline_core::{Candidate, FallbackOrchestrator, FeedlineConfig, SourceError, SourceId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FeedlineConfig::from_env()?;
//!     let orchestrator = FallbackOrchestrator::new(config.build_registry(), config.build_cache());
//!
//!     let stooq = Candidate::new(SourceId::parse("stooq")?, || async {
//!         Ok::<_, SourceError>(String::from("185.64"))
//!     });
//!     let result = orchestrator
//!         .fetch("quote:AAPL", vec![stooq], Duration::from_secs(300))
//!         .await?;
//!     println!("{} from {} (cached: {})", result.value, result.source, result.cached);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  Caller / CLI        │
//! └──────────┬───────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐     ┌──────────────────┐
//! │ FallbackOrchestrator │────▶│ CacheStore       │
//! └──────────┬───────────┘     │ (single-flight)  │
//!            │                 └──────────────────┘
//!            ▼
//! ┌──────────────────────┐     ┌──────────────────┐
//! │ SourceRegistry       │────▶│ CircuitBreaker   │
//! │ (SourceMetrics)      │     │ RateLimiter      │
//! └──────────┬───────────┘     └──────────────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐     ┌──────────────────┐
//! │ Candidate fetch      │────▶│ HttpClient       │
//! │ (SourceFetch)        │     │ (reqwest)        │
//! └──────────────────────┘     └──────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! Sources report a [`SourceError`]; only timeouts and rejections count
//! against a source's breaker. Callers see a single [`ResilienceError`]:
//!
//! ```rust
//! use feedline_core::{ResilienceError, SourceErrorKind};
//!
//! fn report(error: &ResilienceError) {
//!     for attempt in error.attempts() {
//!         match attempt.error.kind() {
//!             SourceErrorKind::CircuitOpen | SourceErrorKind::RateLimited => {
//!                 // Skipped locally, no call was made
//!             }
//!             _ => eprintln!("{}: {}", attempt.source, attempt.error),
//!         }
//!     }
//! }
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod data_source;
pub mod error;
pub mod http_client;
pub mod http_source;
pub mod metrics;
pub mod provider_policy;
pub mod registry;
pub mod retry;
pub mod routing;
pub mod source;
pub mod store;
pub mod throttling;

pub use cache::{request_key, CacheEntry, CacheMode, CacheStatus, CacheStore, Fetched};
pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState, FailurePolicy, Transition,
};
pub use config::{FeedlineConfig, RequestKind, SourceSettings, TtlConfig, DEFAULT_STALE_RETENTION};
pub use data_source::{Candidate, FetchFuture, SourceError, SourceErrorKind, SourceFetch};
pub use error::{ConfigError, ResilienceError, SourceAttempt, ValidationError};
pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpRequest, HttpResponse, ReqwestHttpClient,
    ScriptedHttpClient,
};
pub use http_source::{HttpSource, PayloadParser};
pub use metrics::{RequestRecord, SourceMetrics, SourceStats};
pub use provider_policy::SourceConfig;
pub use registry::{HealthStatus, HealthSummary, Readiness, SourceRegistry};
pub use retry::{retry_with_backoff, Backoff, RetryConfig};
pub use routing::{FallbackOrchestrator, FetchResult};
pub use source::SourceId;
pub use store::{write_through, CanonicalStore, MemoryStore, StoreError};
pub use throttling::{RateLimiter, TokenBucket};
