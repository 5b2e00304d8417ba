//! Folds one turn's extraction into the user's dialogue state.
//!
//! Merging is pure: it takes the current [`DialogueState`] by reference and
//! returns a wholly new one. Persisting it (and bumping `version`) is the
//! store's job.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::dialogue::{
    ActiveTask, Conflict, ConflictStrategy, DialogueState, Extraction, HistoryEntry, TaskId,
    UserSettings,
};
use crate::domain::slot::{is_empty_value, values_equivalent, SlotState};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergerConfig {
    pub task_timeout: Duration,
    pub default_strategy: ConflictStrategy,
    /// Per-slot overrides; these win over user settings.
    pub slot_strategies: BTreeMap<String, ConflictStrategy>,
    pub max_history_entries: usize,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::minutes(30),
            default_strategy: ConflictStrategy::Overwrite,
            slot_strategies: BTreeMap::new(),
            max_history_entries: 50,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementReason {
    Expired,
    Closed,
    IntentSwitch,
}

impl ReplacementReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Closed => "closed",
            Self::IntentSwitch => "intent_switch",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacedTask {
    pub task_id: TaskId,
    pub intent: String,
    pub reason: ReplacementReason,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MergeOutcome {
    pub state: DialogueState,
    pub started_new_task: bool,
    pub replaced: Option<ReplacedTask>,
    pub conflicts: Vec<Conflict>,
}

enum Continuation<'a> {
    Continue(&'a ActiveTask),
    Start(Option<ReplacedTask>),
}

#[derive(Clone, Debug, Default)]
pub struct SlotMerger {
    config: MergerConfig,
}

impl SlotMerger {
    pub fn new(config: MergerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MergerConfig {
        &self.config
    }

    pub fn merge(&self, current: &DialogueState, extraction: &Extraction, template_id: &str) -> MergeOutcome {
        self.merge_at(current, extraction, template_id, Utc::now())
    }

    pub fn merge_at(
        &self,
        current: &DialogueState,
        extraction: &Extraction,
        template_id: &str,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        let mut state = current.clone();
        state.updated_at = now;

        match self.continuation(current, extraction, now) {
            Continuation::Start(replaced) => {
                let mut task = ActiveTask::new(&extraction.intent, template_id, now);
                task.slot_state = extracted_values(&extraction.slot_state);
                let entry = history_entry(&task, extraction, Vec::new(), ConflictStrategy::Overwrite, true, now);
                task.history.push(entry);
                state.active_task = Some(task);
                MergeOutcome { state, started_new_task: true, replaced, conflicts: Vec::new() }
            }
            Continuation::Continue(existing) => {
                let mut task = existing.clone();
                let mut conflicts = Vec::new();
                let mut strategy = self.strategy_for(None, &current.settings);

                for (slot, incoming) in &extraction.slot_state {
                    if is_empty_value(incoming) {
                        continue;
                    }
                    let current_value = match task.slot_state.get(slot) {
                        Some(value) if !is_empty_value(value) => value.clone(),
                        _ => {
                            task.slot_state.insert(slot.clone(), incoming.clone());
                            continue;
                        }
                    };
                    if values_equivalent(&current_value, incoming) {
                        continue;
                    }

                    strategy = self.strategy_for(Some(slot), &current.settings);
                    let resolved = resolve(strategy, &current_value, incoming);
                    conflicts.push(Conflict {
                        slot: slot.clone(),
                        current_value,
                        new_value: incoming.clone(),
                        resolved_value: resolved.clone(),
                        confidence: extraction.confidence,
                        resolution_strategy: strategy,
                        timestamp: now,
                    });
                    task.slot_state.insert(slot.clone(), resolved);
                }

                let entry = history_entry(&task, extraction, conflicts.clone(), strategy, false, now);
                task.history.push(entry);
                let overflow = task.history.len().saturating_sub(self.config.max_history_entries.max(1));
                task.history.drain(..overflow);
                task.updated_at = now;

                state.active_task = Some(task);
                MergeOutcome { state, started_new_task: false, replaced: None, conflicts }
            }
        }
    }

    fn continuation<'a>(
        &self,
        current: &'a DialogueState,
        extraction: &Extraction,
        now: DateTime<Utc>,
    ) -> Continuation<'a> {
        let Some(task) = current.active_task.as_ref() else {
            return Continuation::Start(None);
        };
        let reason = if task.status.is_closed() {
            ReplacementReason::Closed
        } else if task.is_expired(now, self.config.task_timeout) {
            ReplacementReason::Expired
        } else if task.intent != extraction.intent {
            ReplacementReason::IntentSwitch
        } else {
            return Continuation::Continue(task);
        };
        Continuation::Start(Some(ReplacedTask {
            task_id: task.task_id.clone(),
            intent: task.intent.clone(),
            reason,
        }))
    }

    /// Per-slot override, then the user's preference, then the configured default.
    pub fn strategy_for(&self, slot: Option<&str>, settings: &UserSettings) -> ConflictStrategy {
        slot.and_then(|slot| self.config.slot_strategies.get(slot).copied())
            .or(settings.conflict_strategy)
            .unwrap_or(self.config.default_strategy)
    }
}

fn extracted_values(slot_state: &SlotState) -> SlotState {
    slot_state
        .iter()
        .filter(|(_, value)| !is_empty_value(value))
        .map(|(slot, value)| (slot.clone(), value.clone()))
        .collect()
}

fn resolve(strategy: ConflictStrategy, current: &Value, incoming: &Value) -> Value {
    match (strategy, current, incoming) {
        (ConflictStrategy::KeepExisting, _, _) => current.clone(),
        (ConflictStrategy::Union, Value::Array(existing), Value::Array(added)) => {
            let mut merged = existing.clone();
            for item in added {
                if !merged.iter().any(|present| values_equivalent(present, item)) {
                    merged.push(item.clone());
                }
            }
            Value::Array(merged)
        }
        _ => incoming.clone(),
    }
}

fn history_entry(
    task: &ActiveTask,
    extraction: &Extraction,
    conflicts: Vec<Conflict>,
    strategy: ConflictStrategy,
    started_new_task: bool,
    now: DateTime<Utc>,
) -> HistoryEntry {
    HistoryEntry {
        turn: task.next_turn(),
        raw_text: extraction.raw_text.clone(),
        extracted: extraction.slot_state.clone(),
        conflicts,
        strategy,
        confidence: extraction.confidence,
        started_new_task,
        recorded_at: now,
    }
}
