//! Runtime configuration.
//!
//! Resolution order is built-in defaults, then the TOML file, then
//! environment overrides, then validation. Source sections are partial: a
//! `[sources.yahoo_finance]` table that only sets `enabled = false` keeps every
//! other built-in setting for that source.
//!
//! ```toml
//! cache_version = "v2"
//! stale_retention_secs = 172800
//!
//! [ttl]
//! quote = 120
//!
//! [sources.stooq]
//! tokens_per_minute = 30
//! url_template = "https://stooq.com/q/d/l/?s={symbol}&i=d"
//!
//! [routes]
//! bars = ["stooq", "yahoo_finance"]
//! ```
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `FEEDLINE_ENABLE_<SOURCE>` | `true`/`false`/`1`/`0`, toggles one source |
//! | `FEEDLINE_CACHE_VERSION` | replaces `cache_version` |

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheStore;
use crate::circuit_breaker::FailurePolicy;
use crate::error::ConfigError;
use crate::metrics::{DEFAULT_METRICS_WINDOW, DEFAULT_RECORD_CAPACITY};
use crate::provider_policy::SourceConfig;
use crate::registry::SourceRegistry;
use crate::retry::RetryConfig;
use crate::SourceId;

pub const ENV_PREFIX_ENABLE: &str = "FEEDLINE_ENABLE_";
pub const ENV_CACHE_VERSION: &str = "FEEDLINE_CACHE_VERSION";

/// How long an expired entry stays usable as a stale fallback.
pub const DEFAULT_STALE_RETENTION: Duration = Duration::from_secs(7 * 24 * 3_600);

/// Logical request kinds, each with its own TTL and candidate route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Search,
    Quote,
    Bars,
    Fundamentals,
    Filings,
    Macro,
}

impl RequestKind {
    pub const ALL: [Self; 6] = [
        Self::Search,
        Self::Quote,
        Self::Bars,
        Self::Fundamentals,
        Self::Filings,
        Self::Macro,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Quote => "quote",
            Self::Bars => "bars",
            Self::Fundamentals => "fundamentals",
            Self::Filings => "filings",
            Self::Macro => "macro",
        }
    }
}

impl Display for RequestKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| format!("unknown request kind '{value}'"))
    }
}

/// Cache TTL per request kind, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    pub search: u64,
    pub quote: u64,
    pub bars: u64,
    pub fundamentals: u64,
    pub filings: u64,
    #[serde(rename = "macro")]
    pub macro_series: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            search: 3_600,
            quote: 300,
            bars: 86_400,
            fundamentals: 3_600,
            filings: 900,
            macro_series: 3_600,
        }
    }
}

impl TtlConfig {
    pub fn for_kind(&self, kind: RequestKind) -> Duration {
        let secs = match kind {
            RequestKind::Search => self.search,
            RequestKind::Quote => self.quote,
            RequestKind::Bars => self.bars,
            RequestKind::Fundamentals => self.fundamentals,
            RequestKind::Filings => self.filings,
            RequestKind::Macro => self.macro_series,
        };
        Duration::from_secs(secs)
    }
}

/// Partial `[sources.<name>]` table as written in the file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceSection {
    enabled: Option<bool>,
    failure_threshold: Option<u32>,
    recovery_timeout_secs: Option<f64>,
    tokens_per_minute: Option<u32>,
    burst: Option<u32>,
    timeout_ms: Option<u64>,
    failure_policy: Option<FailurePolicy>,
    url_template: Option<String>,
    retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    cache_version: Option<String>,
    metrics_window_secs: Option<u64>,
    metrics_capacity: Option<usize>,
    stale_retention_secs: Option<u64>,
    default_timeout_ms: Option<u64>,
    ttl: TtlConfig,
    sources: BTreeMap<String, SourceSection>,
    routes: BTreeMap<RequestKind, Vec<String>>,
}

/// Fully resolved settings for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    pub config: SourceConfig,
    pub url_template: Option<String>,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedlineConfig {
    pub cache_version: String,
    pub metrics_window_secs: u64,
    pub metrics_capacity: usize,
    pub stale_retention_secs: u64,
    pub default_timeout_ms: u64,
    pub ttl: TtlConfig,
    pub sources: BTreeMap<SourceId, SourceSettings>,
    pub routes: BTreeMap<RequestKind, Vec<SourceId>>,
}

impl Default for FeedlineConfig {
    fn default() -> Self {
        let default_timeout_ms = SourceConfig::default().timeout_ms;
        let sources = builtin_sources()
            .into_iter()
            .filter_map(|(name, url)| {
                let id = SourceId::parse(name).ok()?;
                let config = SourceConfig::default_for(name)?;
                Some((
                    id,
                    SourceSettings {
                        config,
                        url_template: Some(url.to_owned()),
                        retry: RetryConfig::default(),
                    },
                ))
            })
            .collect();

        Self {
            cache_version: String::from("v1"),
            metrics_window_secs: DEFAULT_METRICS_WINDOW.as_secs(),
            metrics_capacity: DEFAULT_RECORD_CAPACITY,
            stale_retention_secs: DEFAULT_STALE_RETENTION.as_secs(),
            default_timeout_ms,
            ttl: TtlConfig::default(),
            sources,
            routes: builtin_routes(),
        }
    }
}

fn builtin_sources() -> [(&'static str, &'static str); 4] {
    [
        ("stooq", "https://stooq.com/q/d/l/?s={symbol}&i=d"),
        (
            "yahoo_finance",
            "https://query1.finance.yahoo.com/v8/finance/chart/{symbol}?interval=1d&range=1mo",
        ),
        ("sec_edgar", "https://data.sec.gov/submissions/CIK{symbol}.json"),
        (
            "fred",
            "https://api.stlouisfed.org/fred/series/observations?series_id={symbol}&file_type=json",
        ),
    ]
}

fn builtin_routes() -> BTreeMap<RequestKind, Vec<SourceId>> {
    let route = |names: &[&str]| {
        names
            .iter()
            .filter_map(|name| SourceId::parse(name).ok())
            .collect::<Vec<_>>()
    };
    BTreeMap::from([
        (RequestKind::Search, route(&["yahoo_finance"])),
        (RequestKind::Quote, route(&["stooq", "yahoo_finance"])),
        (RequestKind::Bars, route(&["stooq", "yahoo_finance"])),
        (RequestKind::Fundamentals, route(&["yahoo_finance"])),
        (RequestKind::Filings, route(&["sec_edgar"])),
        (RequestKind::Macro, route(&["fred"])),
    ])
}

impl FeedlineConfig {
    /// Reads `path`, applies process environment overrides and validates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults with process environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Merges a TOML document over the built-in defaults. Does not validate.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        let mut config = Self::default();

        if let Some(version) = raw.cache_version {
            config.cache_version = version;
        }
        if let Some(window) = raw.metrics_window_secs {
            config.metrics_window_secs = window;
        }
        if let Some(capacity) = raw.metrics_capacity {
            config.metrics_capacity = capacity;
        }
        if let Some(retention) = raw.stale_retention_secs {
            config.stale_retention_secs = retention;
        }
        if let Some(timeout_ms) = raw.default_timeout_ms {
            config.default_timeout_ms = timeout_ms;
            for settings in config.sources.values_mut() {
                settings.config.timeout_ms = timeout_ms;
            }
        }
        config.ttl = raw.ttl;

        for (name, section) in raw.sources {
            let id = SourceId::parse(&name)?;
            let settings = config.sources.remove(&id).unwrap_or_else(|| SourceSettings {
                config: SourceConfig {
                    timeout_ms: config.default_timeout_ms,
                    ..SourceConfig::default()
                },
                url_template: None,
                retry: RetryConfig::default(),
            });
            config.sources.insert(id, merge_section(settings, section));
        }

        for (kind, names) in raw.routes {
            let route = names
                .iter()
                .map(|name| SourceId::parse(name))
                .collect::<Result<Vec<_>, _>>()?;
            config.routes.insert(kind, route);
        }

        Ok(config)
    }

    /// Applies `FEEDLINE_*` overrides from `vars`. Unrelated variables are ignored.
    pub fn apply_env(
        &mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), ConfigError> {
        for (name, value) in vars {
            if name == ENV_CACHE_VERSION {
                let version = value.trim();
                if version.is_empty() {
                    return Err(ConfigError::InvalidEnv { name, value });
                }
                self.cache_version = version.to_owned();
                continue;
            }

            let Some(suffix) = name.strip_prefix(ENV_PREFIX_ENABLE) else {
                continue;
            };
            let Some(enabled) = parse_flag(&value) else {
                return Err(ConfigError::InvalidEnv { name, value });
            };
            let source = suffix.to_ascii_lowercase();
            match self
                .sources
                .iter_mut()
                .find(|(id, _)| id.as_str() == source)
            {
                Some((_, settings)) => settings.config.enabled = enabled,
                None => tracing::warn!(variable = %name, "override names an unknown source"),
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_version.trim().is_empty() {
            return Err(ConfigError::InvalidSource {
                source_name: String::from("*"),
                reason: String::from("cache_version cannot be empty"),
            });
        }
        for (id, settings) in &self.sources {
            settings.config.validate(id.as_str())?;
        }
        for (kind, route) in &self.routes {
            if let Some(unknown) = route.iter().find(|id| !self.sources.contains_key(*id)) {
                return Err(ConfigError::UnknownRouteSource {
                    route: kind.to_string(),
                    source_name: unknown.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn metrics_window(&self) -> Duration {
        Duration::from_secs(self.metrics_window_secs)
    }

    pub fn stale_retention(&self) -> Duration {
        Duration::from_secs(self.stale_retention_secs)
    }

    /// Empty cache namespaced by `cache_version`, bounded by the stale retention.
    pub fn build_cache<V>(&self) -> CacheStore<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        CacheStore::with_stale_retention(self.cache_version.clone(), self.stale_retention())
    }

    pub fn ttl_for(&self, kind: RequestKind) -> Duration {
        self.ttl.for_kind(kind)
    }

    /// Candidate order for `kind`; empty when no route is configured.
    pub fn route(&self, kind: RequestKind) -> &[SourceId] {
        self.routes.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Builds a registry holding every configured source.
    pub fn build_registry(&self) -> Arc<SourceRegistry> {
        let registry = SourceRegistry::with_limits(self.metrics_window(), self.metrics_capacity);
        for (id, settings) in &self.sources {
            registry.register(id.clone(), settings.config.clone());
        }
        tracing::debug!(sources = registry.len(), "source registry built");
        Arc::new(registry)
    }
}

fn merge_section(mut settings: SourceSettings, section: SourceSection) -> SourceSettings {
    let config = &mut settings.config;
    if let Some(enabled) = section.enabled {
        config.enabled = enabled;
    }
    if let Some(threshold) = section.failure_threshold {
        config.failure_threshold = threshold;
    }
    if let Some(recovery) = section.recovery_timeout_secs {
        config.recovery_timeout_secs = recovery;
    }
    if let Some(rate) = section.tokens_per_minute {
        config.tokens_per_minute = rate;
    }
    if let Some(burst) = section.burst {
        config.burst = burst;
    }
    if let Some(timeout_ms) = section.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if let Some(policy) = section.failure_policy {
        config.failure_policy = policy;
    }
    if section.url_template.is_some() {
        settings.url_template = section.url_template;
    }
    if let Some(retry) = section.retry {
        settings.retry = retry;
    }
    settings
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
