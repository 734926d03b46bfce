mod fetch;
mod sources;

use feedline_core::FeedlineConfig;
use serde::Serialize;
use serde_json::Value;

use crate::cli::{Cli, Command};
use crate::error::CliError;

/// Output of one command: data plus non-fatal warnings and per-request errors.
#[derive(Debug, Serialize)]
pub struct CommandResult {
    pub data: Value,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors.extend(errors);
        self
    }
}

pub async fn run(cli: &Cli) -> Result<CommandResult, CliError> {
    let config = load_config(cli)?;

    match &cli.command {
        Command::Sources(args) => sources::run(args, &config),
        Command::Fetch(args) => fetch::run(args, &config).await,
    }
}

fn load_config(cli: &Cli) -> Result<FeedlineConfig, CliError> {
    let config = match &cli.config {
        Some(path) => FeedlineConfig::load(path)?,
        None => FeedlineConfig::from_env()?,
    };
    tracing::debug!(
        sources = config.sources.len(),
        cache_version = %config.cache_version,
        "configuration loaded"
    );
    Ok(config)
}
