//! Replays a JSONL script of extractor turns through an in-memory dialogue
//! runtime. Each line is either a turn
//! `{"userId", "intent", "slotState", "rawText", "confidence", "at"}` or a
//! cancellation `{"userId", "cancel": true}`. Blank lines and lines starting
//! with `#` are skipped.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use cadence_agent::executor::AcknowledgingExecutor;
use cadence_agent::runtime::DialogueRuntime;
use cadence_core::config::{AppConfig, LoadOptions};
use cadence_core::domain::dialogue::{Extraction, UserId};
use cadence_core::domain::slot::SlotState;
use cadence_core::templates::TemplateLoader;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::commands::{command_runtime, CommandResult};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScriptLine {
    user_id: String,
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    slot_state: SlotState,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    raw_text: String,
    #[serde(default)]
    at: Option<DateTime<Utc>>,
    #[serde(default)]
    cancel: bool,
}

#[derive(Debug, Serialize)]
struct TurnRecord {
    line: usize,
    user_id: String,
    outcome: String,
    reply: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    detail: Value,
}

pub fn run(script: &Path, templates_dir: Option<&Path>) -> CommandResult {
    let lines = match read_script(script) {
        Ok(lines) => lines,
        Err(message) => return CommandResult::failure("simulate", "script_parse", message, 2),
    };

    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "simulate",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let templates_dir = templates_dir.or(config.templates.path.as_deref());
    let loaded = match templates_dir {
        Some(dir) => TemplateLoader::load_dir(dir),
        None => TemplateLoader::builtin(),
    };
    let templates = match loaded {
        Ok(loader) => Arc::new(loader),
        Err(error) => {
            return CommandResult::failure("simulate", "template_validation", error.to_string(), 2)
        }
    };

    let runtime = match command_runtime("simulate") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let dialogue = DialogueRuntime::in_memory(&config.dialogue, templates, Arc::new(AcknowledgingExecutor));
    let records = runtime.block_on(replay(&dialogue, lines));

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for record in &records {
        *counts.entry(record.outcome.clone()).or_default() += 1;
    }
    let executed = counts.get("executed").copied().unwrap_or(0);

    CommandResult::success_with_details(
        "simulate",
        format!("replayed {} turns, {executed} executed", records.len()),
        Some(json!({ "turns": records, "outcomes": counts })),
    )
}

fn read_script(script: &Path) -> Result<Vec<(usize, ScriptLine)>, String> {
    let raw = fs::read_to_string(script)
        .map_err(|error| format!("could not read script `{}`: {error}", script.display()))?;

    let mut lines = Vec::new();
    for (index, text) in raw.lines().enumerate() {
        let number = index + 1;
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line: ScriptLine = serde_json::from_str(trimmed)
            .map_err(|error| format!("line {number}: {error}"))?;
        if !line.cancel && line.intent.as_deref().map_or(true, |intent| intent.trim().is_empty()) {
            return Err(format!("line {number}: a turn needs an `intent`"));
        }
        lines.push((number, line));
    }
    Ok(lines)
}

async fn replay(runtime: &DialogueRuntime, lines: Vec<(usize, ScriptLine)>) -> Vec<TurnRecord> {
    let mut records = Vec::with_capacity(lines.len());
    for (number, line) in lines {
        let user_id = UserId(line.user_id.clone());
        let now = line.at.unwrap_or_else(Utc::now);
        let correlation_id = format!("sim-{number}");

        let record = if line.cancel {
            match runtime.cancel_at(&user_id, now, &correlation_id).await {
                Ok(task_id) => TurnRecord {
                    line: number,
                    user_id: line.user_id,
                    outcome: "cancelled".to_string(),
                    reply: "Okay, I've cancelled that request.".to_string(),
                    detail: json!({ "task_id": task_id }),
                },
                Err(error) => error_record(number, line.user_id, error.to_string()),
            }
        } else {
            let mut extraction = Extraction::new(line.intent.unwrap_or_default(), line.slot_state)
                .with_raw_text(line.raw_text);
            if let Some(confidence) = line.confidence {
                extraction = extraction.with_confidence(confidence.clamp(0.0, 1.0));
            }
            match runtime.handle_turn_at(&user_id, extraction, now, &correlation_id).await {
                Ok(outcome) => TurnRecord {
                    line: number,
                    user_id: line.user_id,
                    outcome: outcome.kind().to_string(),
                    reply: outcome.reply_text(),
                    detail: serde_json::to_value(&outcome).unwrap_or(Value::Null),
                },
                Err(error) => error_record(number, line.user_id, error.to_string()),
            }
        };
        records.push(record);
    }
    records
}

fn error_record(line: usize, user_id: String, message: String) -> TurnRecord {
    TurnRecord { line, user_id, outcome: "error".to_string(), reply: message, detail: Value::Null }
}
