use std::collections::BTreeMap;

use serde::Serialize;

use feedline_core::{FeedlineConfig, HealthSummary, Readiness, SourceConfig, SourceId};

use crate::cli::SourcesArgs;
use crate::error::CliError;

use super::CommandResult;

#[derive(Debug, Serialize)]
struct SourceSettingsView<'a> {
    source: &'a SourceId,
    config: &'a SourceConfig,
    url_template: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct SourcesResponseData<'a> {
    health: HealthSummary,
    readiness: BTreeMap<&'static str, Readiness>,
    #[serde(skip_serializing_if = "Option::is_none")]
    settings: Option<Vec<SourceSettingsView<'a>>>,
}

pub fn run(args: &SourcesArgs, config: &FeedlineConfig) -> Result<CommandResult, CliError> {
    let registry = config.build_registry();

    let readiness = config
        .routes
        .iter()
        .map(|(kind, route)| (kind.as_str(), registry.readiness(route)))
        .collect::<BTreeMap<_, _>>();

    let settings = args.verbose.then(|| {
        config
            .sources
            .iter()
            .map(|(source, settings)| SourceSettingsView {
                source,
                config: &settings.config,
                url_template: settings.url_template.as_deref(),
            })
            .collect::<Vec<_>>()
    });

    let warnings = readiness
        .iter()
        .filter(|(_, readiness)| !readiness.ready)
        .map(|(kind, _)| format!("no source available for '{kind}' requests"))
        .collect::<Vec<_>>();

    let data = serde_json::to_value(SourcesResponseData {
        health: registry.health_summary(),
        readiness,
        settings,
    })?;

    Ok(CommandResult::ok(data).with_warnings(warnings))
}
