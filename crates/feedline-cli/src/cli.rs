//! CLI argument definitions for feedline.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sources` | Health summary, per-source stats and per-route readiness |
//! | `fetch` | Run the fallback chain for one request kind and symbol |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--config` | none | TOML configuration file |
//! | `--pretty` | `false` | Pretty-print JSON output |
//!
//! # Examples
//!
//! ```bash
//! # Show configured sources and their health
//! feedline sources --pretty
//!
//! # Fetch daily bars through the configured route
//! feedline fetch bars aapl.us
//!
//! # Watch the breaker trip and the fallback take over, offline
//! feedline fetch bars AAPL --mock --fail stooq --repeat 8 --cache-mode bypass
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use feedline_core::{CacheMode, RequestKind};

/// Resilient multi-source market data fetcher.
#[derive(Debug, Parser)]
#[command(
    name = "feedline",
    author,
    version,
    about = "Resilient multi-source market data fetcher",
    long_about = "feedline reads market data through an ordered list of upstream sources, \
skipping sources that are disabled, rate limited or tripped, and serving cached or stale \
values when every source fails.\n\
\n\
Logging goes to stderr and is controlled with RUST_LOG (default: info)."
)]
pub struct Cli {
    /// TOML configuration file. Built-in defaults are used when omitted.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show health, statistics and readiness for every configured source.
    Sources(SourcesArgs),

    /// Fetch one symbol through the route configured for a request kind.
    ///
    /// # Examples
    ///
    ///   feedline fetch quote aapl.us
    ///   feedline fetch macro GDP --cache-mode refresh
    ///   feedline fetch bars AAPL --mock --fail stooq --repeat 5
    Fetch(FetchArgs),
}

#[derive(Debug, Args)]
pub struct SourcesArgs {
    /// Include the resolved per-source settings.
    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Request kind: search, quote, bars, fundamentals, filings or macro.
    pub kind: RequestKind,

    /// Symbol, series id or query substituted into each source's URL template.
    pub symbol: String,

    /// Number of times to run the same request, sequentially.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=1000))]
    pub repeat: u32,

    /// Answer from in-process mock sources instead of the network.
    #[arg(long, default_value_t = false)]
    pub mock: bool,

    /// With --mock, sources that always reject (repeatable).
    #[arg(long = "fail", requires = "mock")]
    pub fail: Vec<String>,

    #[arg(long, value_enum, default_value_t = CacheModeArg::Use)]
    pub cache_mode: CacheModeArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CacheModeArg {
    /// Serve fresh cache entries, fetch otherwise.
    Use,
    /// Always fetch, still writing the cache.
    Refresh,
    /// Always fetch, never touching the cache.
    Bypass,
}

impl From<CacheModeArg> for CacheMode {
    fn from(value: CacheModeArg) -> Self {
        match value {
            CacheModeArg::Use => Self::Use,
            CacheModeArg::Refresh => Self::Refresh,
            CacheModeArg::Bypass => Self::Bypass,
        }
    }
}
