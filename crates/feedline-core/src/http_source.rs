//! HTTP-backed fetch capability.
//!
//! An [`HttpSource`] owns everything vendor-specific about one upstream: the
//! URL template, credentials, retry policy and payload parser. It hands the
//! orchestrator a plain [`Candidate`] per request so the fallback chain never
//! sees status codes or wire formats.
//!
//! | Outcome | Mapped to |
//! |---------|-----------|
//! | 2xx, parser ok | value |
//! | 2xx, parser error | `Rejected`, not retryable |
//! | 408 / 429 / 5xx | `Rejected`, retryable |
//! | other non-2xx | `Rejected`, not retryable |
//! | transport timeout | `Timeout` |
//! | connection error | `Rejected`, retryable |

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::data_source::{Candidate, FetchFuture, SourceError};
use crate::http_client::{HttpAuth, HttpClient, HttpRequest};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::SourceId;

/// Turns a response body into the canonical value.
pub type PayloadParser<V> = Arc<dyn Fn(&str) -> Result<V, String> + Send + Sync>;

pub struct HttpSource<V> {
    source: SourceId,
    client: Arc<dyn HttpClient>,
    url_template: String,
    auth: HttpAuth,
    retry: RetryConfig,
    request_timeout: Duration,
    parser: PayloadParser<V>,
}

impl<V> Clone for HttpSource<V> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            client: Arc::clone(&self.client),
            url_template: self.url_template.clone(),
            auth: self.auth.clone(),
            retry: self.retry.clone(),
            request_timeout: self.request_timeout,
            parser: Arc::clone(&self.parser),
        }
    }
}

impl<V> Debug for HttpSource<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSource")
            .field("source", &self.source)
            .field("url_template", &self.url_template)
            .field("retry", &self.retry)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl<V: Send + 'static> HttpSource<V> {
    /// `url_template` may contain `{symbol}`, which is percent-encoded on use.
    pub fn new(
        source: SourceId,
        client: Arc<dyn HttpClient>,
        url_template: impl Into<String>,
        parser: impl Fn(&str) -> Result<V, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            client,
            url_template: url_template.into(),
            auth: HttpAuth::None,
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(30),
            parser: Arc::new(parser),
        }
    }

    pub fn with_auth(mut self, auth: HttpAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Transport timeout for each attempt. The orchestrator's deadline still
    /// bounds the whole call including retries.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn url_for(&self, symbol: &str) -> String {
        self.url_template
            .replace("{symbol}", &urlencoding::encode(symbol))
    }

    /// Candidate that fetches `symbol` from this source.
    pub fn candidate(&self, symbol: &str) -> Candidate<V> {
        let this = self.clone();
        let symbol = symbol.to_owned();
        Candidate::new(self.source.clone(), move || this.fetch_symbol(&symbol))
    }

    pub fn fetch_symbol(&self, symbol: &str) -> FetchFuture<V> {
        let this = self.clone();
        let url = self.url_for(symbol);
        Box::pin(async move {
            let body = retry_with_backoff(&this.retry, || this.get_body(&url)).await?;
            (this.parser)(&body).map_err(|reason| {
                SourceError::rejected(
                    format!("{} returned an unparseable payload: {reason}", this.source),
                    false,
                )
            })
        })
    }

    async fn get_body(&self, url: &str) -> Result<String, SourceError> {
        let request = HttpRequest::get(url)
            .with_auth(&self.auth)
            .with_timeout(self.request_timeout);
        let response = self.client.execute(request).await?;
        if !response.is_success() {
            return Err(SourceError::rejected(
                format!("{} returned HTTP {}", self.source, response.status),
                self.retry.should_retry_status(response.status),
            ));
        }
        Ok(response.body)
    }
}
