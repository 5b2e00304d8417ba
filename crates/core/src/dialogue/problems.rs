//! Structural inspection of a slot set.
//!
//! The detector never judges content against business rules (that is the
//! validator's job); it finds values that are missing, placeholders, too vague
//! to book, of the wrong JSON shape, or contaminated with tokens that belong
//! to a different slot.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dialogue::temporal::TemporalVocabulary;
use crate::domain::slot::{is_empty_value, is_filled, SlotState};
use crate::domain::template::{FieldRoles, SlotTemplate, SlotType};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlotProblem {
    pub slot: String,
    pub value: Value,
    pub reason: String,
}

/// Which foreign tokens a label absorbed, most specific first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixedPattern {
    DateTimeLabel,
    DateLabel,
    TimeLabel,
    PersonLabel,
}

impl MixedPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DateTimeLabel => "date_time_label",
            Self::DateLabel => "date_label",
            Self::TimeLabel => "time_label",
            Self::PersonLabel => "person_label",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MixedExtraction {
    pub slot: String,
    pub value: String,
    pub pattern: MixedPattern,
    pub separation: LabelSeparation,
}

/// A label split into the parts it was hiding.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSeparation {
    pub date: Option<String>,
    pub time: Option<String>,
    pub person: Option<String>,
    pub label: String,
}

impl LabelSeparation {
    /// The single best diagnosis, or `None` when the label is clean.
    pub fn pattern(&self) -> Option<MixedPattern> {
        match (&self.date, &self.time, &self.person) {
            (Some(_), Some(_), _) => Some(MixedPattern::DateTimeLabel),
            (Some(_), None, _) => Some(MixedPattern::DateLabel),
            (None, Some(_), _) => Some(MixedPattern::TimeLabel),
            (None, None, Some(_)) => Some(MixedPattern::PersonLabel),
            (None, None, None) => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProblemReport {
    pub invalid_date: Vec<SlotProblem>,
    pub vague_time: Vec<SlotProblem>,
    pub missing_required: Vec<String>,
    pub mixed_extraction: Vec<MixedExtraction>,
    pub format_errors: Vec<SlotProblem>,
}

impl ProblemReport {
    pub fn is_empty(&self) -> bool {
        self.invalid_date.is_empty()
            && self.vague_time.is_empty()
            && self.missing_required.is_empty()
            && self.mixed_extraction.is_empty()
            && self.format_errors.is_empty()
    }

    /// Slots whose values are present but structurally unusable. Missing
    /// slots are not counted: they are simply asked for.
    pub fn problem_slots(&self) -> BTreeSet<String> {
        self.invalid_date
            .iter()
            .chain(&self.vague_time)
            .chain(&self.format_errors)
            .map(|problem| problem.slot.clone())
            .chain(self.mixed_extraction.iter().map(|mixed| mixed.slot.clone()))
            .collect()
    }

    pub fn vague_time_for(&self, slot: &str) -> Option<&SlotProblem> {
        self.vague_time.iter().find(|problem| problem.slot == slot)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProblemDetectorConfig {
    pub vocabulary: TemporalVocabulary,
    /// Leading words that are never a person's name.
    pub reserved_terms: Vec<String>,
    pub person_token_chars: usize,
    pub min_label_chars: usize,
}

impl Default for ProblemDetectorConfig {
    fn default() -> Self {
        Self {
            vocabulary: TemporalVocabulary::default(),
            reserved_terms: [
                "my", "an", "to", "at", "on", "in", "of", "by", "go", "do", "me", "we", "us",
                "it", "is", "be", "up", "so", "no", "or", "if", "as", "am", "pm", "ok", "pe",
                "lesson", "lessons", "class", "course", "session", "practice", "tutoring",
            ]
            .iter()
            .map(|term| term.to_string())
            .collect(),
            person_token_chars: 2,
            min_label_chars: 3,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProblemDetector {
    config: ProblemDetectorConfig,
}

impl ProblemDetector {
    pub fn new(config: ProblemDetectorConfig) -> Self {
        Self { config }
    }

    pub fn vocabulary(&self) -> &TemporalVocabulary {
        &self.config.vocabulary
    }

    pub fn detect_problems(&self, state: &SlotState, template: &SlotTemplate) -> ProblemReport {
        let mut report = ProblemReport::default();
        self.detect_missing_required(state, template, &mut report);
        self.detect_temporal_placeholders(state, template, &mut report);
        self.detect_format_errors(state, template, &mut report);
        self.detect_mixed_extraction(state, &template.fields, &mut report);
        report
    }

    fn detect_missing_required(
        &self,
        state: &SlotState,
        template: &SlotTemplate,
        report: &mut ProblemReport,
    ) {
        for (name, _) in template.requirements(state) {
            if !is_filled(state, &name) {
                report.missing_required.push(name);
            }
        }
    }

    fn detect_temporal_placeholders(
        &self,
        state: &SlotState,
        template: &SlotTemplate,
        report: &mut ProblemReport,
    ) {
        let vocabulary = &self.config.vocabulary;
        for (name, slot) in &template.slots {
            let Some(Value::String(text)) = state.get(name) else {
                continue;
            };
            match slot.slot_type {
                SlotType::Date if vocabulary.is_placeholder_date(text) => {
                    report.invalid_date.push(SlotProblem {
                        slot: name.clone(),
                        value: Value::String(text.clone()),
                        reason: "placeholder is not a date".to_string(),
                    });
                }
                SlotType::Time if vocabulary.is_vague_time(text) => {
                    report.vague_time.push(SlotProblem {
                        slot: name.clone(),
                        value: Value::String(text.clone()),
                        reason: "daypart without a clock time".to_string(),
                    });
                }
                _ => {}
            }
        }
    }

    fn detect_format_errors(
        &self,
        state: &SlotState,
        template: &SlotTemplate,
        report: &mut ProblemReport,
    ) {
        for (name, slot) in &template.slots {
            let Some(value) = state.get(name) else {
                continue;
            };
            if is_empty_value(value) {
                continue;
            }
            let reason = match (slot.slot_type, value) {
                (SlotType::Number, Value::Number(_)) => None,
                (SlotType::Number, Value::String(text)) if text.trim().parse::<f64>().is_ok() => {
                    None
                }
                (SlotType::Number, _) => Some("expected a number"),
                (SlotType::Object, Value::Object(_)) => None,
                (SlotType::Object, _) => Some("expected an object"),
                (SlotType::Array, Value::Array(_)) => None,
                (SlotType::Array, _) => Some("expected a list"),
                (SlotType::String | SlotType::Date | SlotType::Time, Value::String(_)) => None,
                (SlotType::String, Value::Number(_) | Value::Bool(_)) => None,
                (SlotType::String | SlotType::Date | SlotType::Time, _) => {
                    Some("expected text")
                }
            };
            if let Some(reason) = reason {
                report.format_errors.push(SlotProblem {
                    slot: name.clone(),
                    value: value.clone(),
                    reason: reason.to_string(),
                });
            }
        }
    }

    fn detect_mixed_extraction(
        &self,
        state: &SlotState,
        roles: &FieldRoles,
        report: &mut ProblemReport,
    ) {
        let Some(Value::String(text)) = state.get(&roles.label) else {
            return;
        };
        let separation = self.split_label(text);
        if let Some(pattern) = separation.pattern() {
            report.mixed_extraction.push(MixedExtraction {
                slot: roles.label.clone(),
                value: text.clone(),
                pattern,
                separation,
            });
        }
    }

    /// Splits a label into leading relative date, leading time, and an
    /// optional short person token.
    pub fn split_label(&self, text: &str) -> LabelSeparation {
        let vocabulary = &self.config.vocabulary;
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let mut cursor = 0;
        let mut separation = LabelSeparation::default();

        if let Some(span) = vocabulary.leading_relative_date(&tokens) {
            separation.date = Some(tokens[..span].join(" "));
            cursor = span;
        }
        if let Some((span, kept)) = vocabulary.leading_time(&tokens[cursor..]) {
            separation.time = Some(kept);
            cursor += span;
        }

        let rest = tokens[cursor..].join(" ");
        match self.split_person(&rest) {
            Some((person, label)) => {
                separation.person = Some(person);
                separation.label = label;
            }
            None => separation.label = rest,
        }
        separation
    }

    fn split_person(&self, rest: &str) -> Option<(String, String)> {
        let config = &self.config;
        let (person, remainder, spaced) = match rest.split_once(' ') {
            Some((head, tail)) => (head.to_string(), tail.trim().to_string(), true),
            // Unspaced scripts: take the fixed-width prefix directly.
            None if !rest.is_empty() && rest.chars().all(|ch| !ch.is_ascii()) => {
                let head: String = rest.chars().take(config.person_token_chars).collect();
                let tail: String = rest.chars().skip(config.person_token_chars).collect();
                (head, tail, false)
            }
            None => return None,
        };

        if person.chars().count() != config.person_token_chars
            || !person.chars().all(char::is_alphabetic)
            || remainder.chars().count() < config.min_label_chars
        {
            return None;
        }

        let person_lower = person.to_lowercase();
        let remainder_lower = remainder.to_lowercase();
        let remainder_head = remainder_lower.split_whitespace().next().unwrap_or_default();
        let reserved = config.reserved_terms.iter().any(|term| {
            *term == person_lower
                || if spaced {
                    remainder_head == term.as_str()
                } else {
                    remainder_lower.starts_with(term.as_str())
                }
        });
        if reserved {
            return None;
        }
        Some((person, remainder))
    }

    /// Repairs a contaminated label using the default field roles.
    pub fn separate_mixed_slots(&self, state: &SlotState) -> SlotState {
        self.separate_mixed_slots_with(state, &FieldRoles::default())
    }

    /// Returns a new slot state in which the label has been stripped of
    /// foreign tokens and those tokens moved into empty date/time/person
    /// slots. Filled slots are never overwritten.
    pub fn separate_mixed_slots_with(&self, state: &SlotState, roles: &FieldRoles) -> SlotState {
        let mut repaired = state.clone();
        let Some(Value::String(text)) = state.get(&roles.label) else {
            return repaired;
        };

        let separation = self.split_label(text);
        if separation.pattern().is_none() {
            return repaired;
        }

        let parts = [
            (&roles.date, separation.date),
            (&roles.time, separation.time),
            (&roles.person, separation.person),
        ];
        for (field, part) in parts {
            if let Some(part) = part {
                if !is_filled(&repaired, field) {
                    repaired.insert(field.clone(), Value::String(part));
                }
            }
        }

        if separation.label.is_empty() {
            repaired.remove(&roles.label);
        } else {
            repaired.insert(roles.label.clone(), Value::String(separation.label));
        }
        repaired
    }
}
