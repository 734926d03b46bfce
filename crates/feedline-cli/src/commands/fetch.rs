use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use feedline_core::{
    request_key, write_through, CacheMode, Candidate, FallbackOrchestrator,
    FeedlineConfig, HealthSummary, HttpClient, HttpSource, MemoryStore, ReqwestHttpClient,
    SourceError, SourceId,
};

use crate::cli::FetchArgs;
use crate::error::CliError;

use super::CommandResult;

#[derive(Debug, Serialize)]
struct FetchRun {
    run: u32,
    source: SourceId,
    #[serde(with = "time::serde::rfc3339")]
    as_of: OffsetDateTime,
    cached: bool,
    stale: bool,
    value: String,
}

#[derive(Debug, Serialize)]
struct FetchResponseData {
    key: String,
    kind: &'static str,
    route: Vec<SourceId>,
    runs: Vec<FetchRun>,
    persisted: usize,
    health: HealthSummary,
}

pub async fn run(args: &FetchArgs, config: &FeedlineConfig) -> Result<CommandResult, CliError> {
    let route = config.route(args.kind).to_vec();
    if route.is_empty() {
        return Err(CliError::Command(format!(
            "no route configured for '{}' requests",
            args.kind
        )));
    }

    let failing = args
        .fail
        .iter()
        .map(|name| SourceId::parse(name))
        .collect::<Result<Vec<_>, _>>()?;

    let orchestrator = FallbackOrchestrator::new(config.build_registry(), config.build_cache());
    let store = MemoryStore::new();
    let key = request_key(args.kind.as_str(), &[args.symbol.as_str()]);
    let ttl = config.ttl_for(args.kind);
    let mode = CacheMode::from(args.cache_mode);

    let mut warnings = Vec::new();
    let candidates = if args.mock {
        mock_candidates(&route, &args.symbol, &failing)
    } else {
        http_candidates(config, &route, &args.symbol, &mut warnings)
    };

    let mut runs = Vec::new();
    let mut errors = Vec::new();
    let mut persisted = 0;
    for run in 1..=args.repeat {
        match orchestrator
            .fetch_with_mode(&key, candidates.clone(), ttl, mode)
            .await
        {
            Ok(result) => {
                match write_through(&store, &key, &result).await {
                    Ok(true) => persisted += 1,
                    Ok(false) => {}
                    Err(error) => warnings.push(format!("run {run}: {error}")),
                }
                runs.push(FetchRun {
                    run,
                    source: result.source,
                    as_of: result.as_of,
                    cached: result.cached,
                    stale: result.stale,
                    value: result.value,
                });
            }
            Err(error) => errors.push(format!("run {run}: {error}")),
        }
    }

    let data = serde_json::to_value(FetchResponseData {
        key,
        kind: args.kind.as_str(),
        route,
        runs,
        persisted,
        health: orchestrator.registry().health_summary(),
    })?;

    Ok(CommandResult::ok(data)
        .with_warnings(warnings)
        .with_errors(errors))
}

fn mock_candidates(route: &[SourceId], symbol: &str, failing: &[SourceId]) -> Vec<Candidate<String>> {
    route
        .iter()
        .map(|source| {
            let fails = failing.contains(source);
            let name = source.clone();
            let symbol = symbol.to_owned();
            Candidate::new(source.clone(), move || {
                let outcome = if fails {
                    Err(SourceError::rejected(format!("{name} mock returned HTTP 503"), true))
                } else {
                    Ok(format!("{name}:{symbol}:mock"))
                };
                async move { outcome }
            })
        })
        .collect()
}

fn http_candidates(
    config: &FeedlineConfig,
    route: &[SourceId],
    symbol: &str,
    warnings: &mut Vec<String>,
) -> Vec<Candidate<String>> {
    let client: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new());
    route
        .iter()
        .filter_map(|source| {
            let settings = config.sources.get(source)?;
            let Some(template) = settings.url_template.as_deref() else {
                warnings.push(format!("source '{source}' has no url_template, skipped"));
                return None;
            };
            let http = HttpSource::new(source.clone(), Arc::clone(&client), template, |body| {
                if body.trim().is_empty() {
                    Err(String::from("empty body"))
                } else {
                    Ok(body.to_owned())
                }
            })
            .with_retry(settings.retry.clone())
            .with_request_timeout(settings.config.timeout());
            Some(http.candidate(symbol))
        })
        .collect()
}
