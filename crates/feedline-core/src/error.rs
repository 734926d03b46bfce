use std::fmt::Write as _;

use thiserror::Error;

use crate::data_source::SourceError;
use crate::SourceId;

/// Validation errors for identifiers and request keys exposed by `feedline-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("source name cannot be empty")]
    EmptySourceName,
    #[error("source name length {len} exceeds max {max}")]
    SourceNameTooLong { len: usize, max: usize },
    #[error("source name contains invalid character '{ch}' at index {index}")]
    SourceNameInvalidChar { ch: char, index: usize },

    #[error("cache key cannot be empty")]
    EmptyCacheKey,
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("source '{source_name}': {reason}")]
    InvalidSource { source_name: String, reason: String },

    #[error("route '{route}' references unknown source '{source_name}'")]
    UnknownRouteSource { route: String, source_name: String },

    #[error("invalid value for {name}: '{value}'")]
    InvalidEnv { name: String, value: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// One candidate that was tried (or skipped) during an orchestration call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAttempt {
    pub source: SourceId,
    pub error: SourceError,
}

/// Terminal errors returned to orchestration callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    /// Every candidate was skipped or failed and no cached value of any age exists.
    #[error("all sources unavailable for '{key}': {}", describe_attempts(.attempts))]
    AllSourcesUnavailable {
        key: String,
        attempts: Vec<SourceAttempt>,
    },

    #[error("fetch task for '{key}' aborted: {message}")]
    Internal { key: String, message: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ResilienceError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AllSourcesUnavailable { .. } => "orchestrator.all_sources_unavailable",
            Self::Internal { .. } => "orchestrator.internal",
            Self::Validation(_) => "orchestrator.invalid_request",
        }
    }

    /// Sources tried for this call in priority order, empty for non-fallback errors.
    pub fn attempts(&self) -> &[SourceAttempt] {
        match self {
            Self::AllSourcesUnavailable { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

fn describe_attempts(attempts: &[SourceAttempt]) -> String {
    if attempts.is_empty() {
        return String::from("no candidates");
    }

    let mut output = String::new();
    for (index, attempt) in attempts.iter().enumerate() {
        if index > 0 {
            output.push_str("; ");
        }
        let _ = write!(output, "{}: {}", attempt.source, attempt.error);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_sources_unavailable_lists_each_attempt() {
        let error = ResilienceError::AllSourcesUnavailable {
            key: String::from("bars:AAPL:v1"),
            attempts: vec![
                SourceAttempt {
                    source: SourceId::parse("stooq").expect("valid"),
                    error: SourceError::timeout("no response within 30000ms"),
                },
                SourceAttempt {
                    source: SourceId::parse("yahoo_finance").expect("valid"),
                    error: SourceError::circuit_open("circuit is open"),
                },
            ],
        };

        let message = error.to_string();
        assert!(message.contains("stooq: no response within 30000ms (source.timeout)"));
        assert!(message.contains("yahoo_finance: circuit is open (source.circuit_open)"));
        assert_eq!(error.attempts().len(), 2);
        assert_eq!(error.code(), "orchestrator.all_sources_unavailable");
    }
}
