use std::fs;
use std::path::Path;

use cadence_core::config::{AppConfig, LoadOptions};
use cadence_core::templates::{parse_template, TemplateError, TemplateLoader};
use serde::Serialize;
use serde_json::json;

use crate::commands::CommandResult;

#[derive(Debug, Serialize)]
struct TemplateSummary {
    template_id: String,
    intent: String,
    required_slots: Vec<String>,
    optional_slots: Vec<String>,
    conditional_rules: usize,
}

/// Lists the templates the server would load: `dir` when given, otherwise
/// the configured directory or the builtin set.
pub fn list(dir: Option<&Path>) -> CommandResult {
    let loaded = match dir {
        Some(dir) => TemplateLoader::load_dir(dir),
        None => match AppConfig::load(LoadOptions::default()) {
            Ok(config) => match &config.templates.path {
                Some(path) => TemplateLoader::load_dir(path),
                None => TemplateLoader::builtin(),
            },
            Err(error) => {
                return CommandResult::failure(
                    "templates list",
                    "config_validation",
                    format!("configuration issue: {error}"),
                    2,
                );
            }
        },
    };

    let loader = match loaded {
        Ok(loader) => loader,
        Err(error) => return template_failure("templates list", error),
    };

    let mut summaries: Vec<TemplateSummary> = loader
        .templates()
        .iter()
        .map(|template| TemplateSummary {
            template_id: template.template_id.clone(),
            intent: template.intent.clone(),
            required_slots: template.required_slots(),
            optional_slots: template.optional_slots(),
            conditional_rules: template.completion_rules.conditional_required.len(),
        })
        .collect();
    summaries.sort_by(|left, right| left.template_id.cmp(&right.template_id));

    CommandResult::success_with_details(
        "templates list",
        format!("{} templates", summaries.len()),
        Some(json!({ "templates": summaries })),
    )
}

/// Checks a single template document or every `*.toml` in a directory.
pub fn validate(path: &Path) -> CommandResult {
    let loaded = if path.is_dir() {
        TemplateLoader::load_dir(path)
    } else {
        fs::read_to_string(path)
            .map_err(|source| TemplateError::ReadFile { path: path.to_path_buf(), source })
            .and_then(|raw| parse_template(&path.display().to_string(), &raw))
            .and_then(|template| TemplateLoader::from_templates(vec![template]))
    };

    match loaded {
        Ok(loader) if loader.is_empty() => CommandResult::failure(
            "templates validate",
            "template_validation",
            format!("no templates found in `{}`", path.display()),
            2,
        ),
        Ok(loader) => {
            let mut ids: Vec<String> =
                loader.templates().iter().map(|template| template.template_id.clone()).collect();
            ids.sort();
            CommandResult::success_with_details(
                "templates validate",
                format!("{} templates valid", ids.len()),
                Some(json!({ "template_ids": ids })),
            )
        }
        Err(error) => template_failure("templates validate", error),
    }
}

fn template_failure(command: &str, error: TemplateError) -> CommandResult {
    let error_class = match &error {
        TemplateError::ReadFile { .. } => "template_read",
        TemplateError::ParseFile { .. } => "template_parse",
        TemplateError::Config { .. } | TemplateError::NotFound { .. } => "template_validation",
    };
    CommandResult::failure(command, error_class, error.to_string(), 2)
}
