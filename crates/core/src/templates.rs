//! Template loading and lookup.
//!
//! Templates are parsed and validated once, then served from in-process maps.
//! Any inconsistency (a completion rule naming an unknown slot, an invalid
//! pattern, a duplicated intent) is a [`TemplateError::Config`] and aborts
//! startup.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveTime;
use regex::Regex;
use thiserror::Error;
use tracing::info;

use crate::domain::template::SlotTemplate;

const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    ("book_lesson.toml", include_str!("../../../templates/book_lesson.toml")),
    ("modify_lesson.toml", include_str!("../../../templates/modify_lesson.toml")),
    ("cancel_lesson.toml", include_str!("../../../templates/cancel_lesson.toml")),
];

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template not found: {key}")]
    NotFound { key: String },
    #[error("invalid template `{template_id}`: {message}")]
    Config { template_id: String, message: String },
    #[error("could not read template source `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse template `{origin}`: {source}")]
    ParseFile { origin: String, source: toml::de::Error },
}

impl TemplateError {
    fn config(template_id: &str, message: impl Into<String>) -> Self {
        Self::Config { template_id: template_id.to_string(), message: message.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Debug, Default)]
pub struct TemplateLoader {
    by_id: HashMap<String, Arc<SlotTemplate>>,
    by_intent: HashMap<String, String>,
    patterns: HashMap<(String, String), Regex>,
}

impl TemplateLoader {
    pub fn from_templates(templates: Vec<SlotTemplate>) -> Result<Self, TemplateError> {
        let mut loader = Self::default();
        for template in templates {
            loader.insert(template)?;
        }
        Ok(loader)
    }

    /// The templates shipped with the workspace under `templates/`.
    pub fn builtin() -> Result<Self, TemplateError> {
        let templates = BUILTIN_TEMPLATES
            .iter()
            .map(|(origin, raw)| parse_template(origin, raw))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_templates(templates)
    }

    /// A loader holding a single template parsed from `raw`.
    pub fn from_toml_str(raw: &str) -> Result<Self, TemplateError> {
        Self::from_templates(vec![parse_template("inline", raw)?])
    }

    /// Loads every `*.toml` document in `dir`, in file-name order.
    pub fn load_dir(dir: &Path) -> Result<Self, TemplateError> {
        let entries = fs::read_dir(dir)
            .map_err(|source| TemplateError::ReadFile { path: dir.to_path_buf(), source })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|source| TemplateError::ReadFile { path: dir.to_path_buf(), source })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("toml") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut templates = Vec::with_capacity(paths.len());
        for path in &paths {
            let raw = fs::read_to_string(path)
                .map_err(|source| TemplateError::ReadFile { path: path.clone(), source })?;
            templates.push(parse_template(&path.display().to_string(), &raw)?);
        }

        let loader = Self::from_templates(templates)?;
        info!(
            event_name = "system.templates.loaded",
            correlation_id = "bootstrap",
            template_count = loader.len(),
            source = %dir.display(),
            "slot templates loaded"
        );
        Ok(loader)
    }

    pub fn get_template(&self, template_id: &str) -> Result<Arc<SlotTemplate>, TemplateError> {
        self.by_id.get(template_id).cloned().ok_or_else(|| TemplateError::NotFound {
            key: format!("template `{template_id}`"),
        })
    }

    pub fn get_template_by_intent(&self, intent: &str) -> Result<Arc<SlotTemplate>, TemplateError> {
        let template_id = self
            .by_intent
            .get(intent)
            .ok_or_else(|| TemplateError::NotFound { key: format!("intent `{intent}`") })?;
        self.get_template(template_id)
    }

    /// Compiled `validation.pattern` for a slot, when it declares one.
    pub fn pattern(&self, template_id: &str, slot: &str) -> Option<&Regex> {
        self.patterns.get(&(template_id.to_string(), slot.to_string()))
    }

    pub fn templates(&self) -> Vec<Arc<SlotTemplate>> {
        let mut all: Vec<Arc<SlotTemplate>> = self.by_id.values().cloned().collect();
        all.sort_by(|a, b| a.template_id.cmp(&b.template_id));
        all
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn insert(&mut self, template: SlotTemplate) -> Result<(), TemplateError> {
        let patterns = validate_template(&template)?;
        let id = template.template_id.clone();

        if self.by_id.contains_key(&id) {
            return Err(TemplateError::config(&id, "duplicate template_id"));
        }
        if let Some(existing) = self.by_intent.get(&template.intent) {
            return Err(TemplateError::config(
                &id,
                format!("intent `{}` is already served by `{existing}`", template.intent),
            ));
        }

        for (slot, regex) in patterns {
            self.patterns.insert((id.clone(), slot), regex);
        }
        self.by_intent.insert(template.intent.clone(), id.clone());
        self.by_id.insert(id, Arc::new(template));
        Ok(())
    }
}

pub fn parse_template(origin: &str, raw: &str) -> Result<SlotTemplate, TemplateError> {
    toml::from_str::<SlotTemplate>(raw)
        .map_err(|source| TemplateError::ParseFile { origin: origin.to_string(), source })
}

fn validate_template(template: &SlotTemplate) -> Result<Vec<(String, Regex)>, TemplateError> {
    let id = template.template_id.as_str();
    if id.trim().is_empty() {
        return Err(TemplateError::config("<unnamed>", "template_id must not be empty"));
    }
    if template.intent.trim().is_empty() {
        return Err(TemplateError::config(id, "intent must not be empty"));
    }
    if template.slots.is_empty() {
        return Err(TemplateError::config(id, "template declares no slots"));
    }

    let unknown: BTreeSet<String> = template
        .referenced_slots()
        .into_iter()
        .filter(|name| !template.slots.contains_key(name))
        .collect();
    if !unknown.is_empty() {
        let names = unknown.into_iter().collect::<Vec<_>>().join(", ");
        return Err(TemplateError::config(
            id,
            format!("completion rules reference unknown slots: {names}"),
        ));
    }

    for name in &template.field_order {
        if !template.slots.contains_key(name) {
            return Err(TemplateError::config(id, format!("field_order names unknown slot `{name}`")));
        }
    }
    for name in template.question_templates.keys() {
        if !template.slots.contains_key(name) {
            return Err(TemplateError::config(
                id,
                format!("question template for unknown slot `{name}`"),
            ));
        }
    }

    let mut patterns = Vec::new();
    for (name, slot) in &template.slots {
        for dependency in &slot.depends_on {
            if dependency == name || !template.slots.contains_key(dependency) {
                return Err(TemplateError::config(
                    id,
                    format!("slot `{name}` depends on unknown slot `{dependency}`"),
                ));
            }
        }

        let rules = &slot.validation;
        if let (Some(min), Some(max)) = (rules.min_length, rules.max_length) {
            if min > max {
                return Err(TemplateError::config(
                    id,
                    format!("slot `{name}` has min_length greater than max_length"),
                ));
            }
        }
        if let Some(range) = &rules.allowed_range {
            let start = NaiveTime::parse_from_str(&range.start, "%H:%M");
            let end = NaiveTime::parse_from_str(&range.end, "%H:%M");
            match (start, end) {
                (Ok(start), Ok(end)) if start <= end => {}
                _ => {
                    return Err(TemplateError::config(
                        id,
                        format!("slot `{name}` has an invalid allowed_range"),
                    ))
                }
            }
        }
        if let Some(pattern) = &rules.pattern {
            let regex = Regex::new(pattern).map_err(|error| {
                TemplateError::config(id, format!("slot `{name}` pattern does not compile: {error}"))
            })?;
            patterns.push((name.clone(), regex));
        }
    }

    Ok(patterns)
}
