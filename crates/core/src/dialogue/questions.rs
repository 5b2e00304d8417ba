use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dialogue::problems::ProblemReport;
use crate::dialogue::temporal::{daypart_suggestions, DATE_FORMAT};
use crate::dialogue::validator::{ValidationCode, ValidationResult};
use crate::domain::dialogue::HistoryEntry;
use crate::domain::slot::display_value;
use crate::domain::template::{SlotTemplate, SlotType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    /// Too many things are wrong at once; ask for the whole request again.
    Restate,
    Fix,
    /// The value is usable in spirit but too coarse to book (e.g. "afternoon").
    Clarify,
    Ask,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub kind: QuestionKind,
    pub slot: Option<String>,
    pub text: String,
    pub suggestions: Vec<String>,
    pub format_hint: Option<String>,
}

/// Per-turn inputs beyond the validation result.
#[derive(Clone, Debug, PartialEq)]
pub struct QuestionContext {
    pub problems: ProblemReport,
    /// Slot name to the last turn the user mentioned it.
    pub recency: BTreeMap<String, u32>,
    pub today: NaiveDate,
}

impl QuestionContext {
    pub fn new(problems: ProblemReport, today: NaiveDate) -> Self {
        Self { problems, recency: BTreeMap::new(), today }
    }

    pub fn with_history(mut self, history: &[HistoryEntry]) -> Self {
        for entry in history {
            for slot in entry.extracted.keys() {
                self.recency.insert(slot.clone(), entry.turn);
            }
        }
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuestionGeneratorConfig {
    pub restate_threshold: usize,
    pub max_suggestions: usize,
}

impl Default for QuestionGeneratorConfig {
    fn default() -> Self {
        Self { restate_threshold: 1, max_suggestions: 3 }
    }
}

#[derive(Clone, Debug, Default)]
pub struct QuestionGenerator {
    config: QuestionGeneratorConfig,
}

struct FixTarget {
    slot: String,
    value: Value,
    code: Option<ValidationCode>,
}

impl QuestionGenerator {
    pub fn new(config: QuestionGeneratorConfig) -> Self {
        Self { config }
    }

    /// Distinct slots carrying a structural problem or a validation error.
    /// A cross-field error is attributed to its primary slot only.
    pub fn independent_problems(validation: &ValidationResult, problems: &ProblemReport) -> BTreeSet<String> {
        let mut slots = problems.problem_slots();
        slots.extend(validation.validation_errors.iter().map(|issue| issue.slot.clone()));
        slots
    }

    /// True when this turn should fall back to asking for the whole request again.
    pub fn needs_restate(&self, validation: &ValidationResult, problems: &ProblemReport) -> bool {
        Self::independent_problems(validation, problems).len() > self.config.restate_threshold
    }

    /// The next thing to ask, or `None` when the slots are valid and complete.
    pub fn generate(
        &self,
        validation: &ValidationResult,
        template: &SlotTemplate,
        context: &QuestionContext,
    ) -> Option<Question> {
        let problem_slots = Self::independent_problems(validation, &context.problems);
        if problem_slots.len() > self.config.restate_threshold {
            return Some(self.restate(template, &problem_slots));
        }

        if let Some(target) = fix_target(validation, &context.problems, template) {
            return Some(self.fix(template, context, target));
        }

        let missing: BTreeSet<&str> = validation.missing_slots.iter().map(|m| m.slot.as_str()).collect();
        let next = validation.missing_slots.iter().min_by_key(|missing_slot| {
            let blocked = template
                .slot(&missing_slot.slot)
                .map(|slot| slot.depends_on.iter().any(|dependency| missing.contains(dependency.as_str())))
                .unwrap_or(false);
            (
                blocked,
                missing_slot.requirement,
                missing_slot.priority.rank(),
                template.field_position(&missing_slot.slot),
                Reverse(context.recency.get(&missing_slot.slot).copied().unwrap_or(0)),
            )
        });

        next.map(|missing_slot| self.ask(template, context, &missing_slot.slot))
    }

    fn restate(&self, template: &SlotTemplate, problem_slots: &BTreeSet<String>) -> Question {
        let mut labels: Vec<(usize, &str)> = problem_slots
            .iter()
            .map(|slot| (template.field_position(slot), template.display_label(slot)))
            .collect();
        labels.sort();
        let listed = labels.iter().map(|(_, label)| *label).collect::<Vec<_>>().join(", ");
        let request = template.description.as_deref().unwrap_or("request").to_lowercase();

        Question {
            kind: QuestionKind::Restate,
            slot: None,
            text: format!(
                "I couldn't make sense of the {listed}. Could you describe the whole request again in one message? ({request})"
            ),
            suggestions: Vec::new(),
            format_hint: None,
        }
    }

    fn fix(&self, template: &SlotTemplate, context: &QuestionContext, target: FixTarget) -> Question {
        let label = template.display_label(&target.slot).to_string();
        let value = display_value(&target.value);

        if let Some(vague) = context.problems.vague_time_for(&target.slot) {
            let daypart = display_value(&vague.value);
            return Question {
                kind: QuestionKind::Clarify,
                slot: Some(target.slot.clone()),
                text: format!("\"{daypart}\" is a bit broad. What exact {label} should I book?"),
                suggestions: self.limit(daypart_suggestions(&daypart)),
                format_hint: format_hint(template, &target.slot),
            };
        }

        let text = if target.code == Some(ValidationCode::DatetimeInPast) {
            "That date and time have already passed. When should it be instead?".to_string()
        } else {
            let raw = template
                .question_templates
                .get(&target.slot)
                .and_then(|question| question.fix.clone())
                .unwrap_or_else(|| "\"{value}\" doesn't work for the {label}. Could you give it again?".to_string());
            render(&raw, &variables(&label, &value))
        };

        Question {
            kind: QuestionKind::Fix,
            slot: Some(target.slot.clone()),
            text,
            suggestions: self.suggestions(template, context, &target.slot),
            format_hint: format_hint(template, &target.slot),
        }
    }

    fn ask(&self, template: &SlotTemplate, context: &QuestionContext, slot: &str) -> Question {
        let label = template.display_label(slot).to_string();
        let raw = template
            .question_templates
            .get(slot)
            .map(|question| question.ask.clone())
            .filter(|ask| !ask.trim().is_empty())
            .unwrap_or_else(|| "What {label} should I use?".to_string());

        Question {
            kind: QuestionKind::Ask,
            slot: Some(slot.to_string()),
            text: render(&raw, &variables(&label, "")),
            suggestions: self.suggestions(template, context, slot),
            format_hint: format_hint(template, slot),
        }
    }

    fn suggestions(&self, template: &SlotTemplate, context: &QuestionContext, slot: &str) -> Vec<String> {
        let suggestions = match template.slot(slot).map(|definition| definition.slot_type) {
            Some(SlotType::Date) => (1..=3)
                .filter_map(|offset| context.today.checked_add_signed(Duration::days(offset)))
                .map(|date| date.format(DATE_FORMAT).to_string())
                .collect(),
            _ => template
                .question_templates
                .get(slot)
                .map(|question| question.suggestions.clone())
                .unwrap_or_default(),
        };
        self.limit(suggestions)
    }

    fn limit(&self, mut suggestions: Vec<String>) -> Vec<String> {
        suggestions.truncate(self.config.max_suggestions);
        suggestions
    }
}

/// Highest-ranked slot that needs fixing: validation errors and structural
/// problems together, by priority tier then field order.
fn fix_target(validation: &ValidationResult, problems: &ProblemReport, template: &SlotTemplate) -> Option<FixTarget> {
    let mut candidates: Vec<FixTarget> = validation
        .validation_errors
        .iter()
        .map(|issue| FixTarget { slot: issue.slot.clone(), value: issue.value.clone(), code: Some(issue.code) })
        .collect();
    candidates.extend(
        problems
            .invalid_date
            .iter()
            .chain(&problems.vague_time)
            .chain(&problems.format_errors)
            .map(|problem| FixTarget { slot: problem.slot.clone(), value: problem.value.clone(), code: None }),
    );
    candidates.extend(problems.mixed_extraction.iter().map(|mixed| FixTarget {
        slot: mixed.slot.clone(),
        value: Value::String(mixed.value.clone()),
        code: None,
    }));

    // Prefer the structural diagnosis for a slot when both exist; it phrases better.
    candidates.sort_by_key(|target| {
        (template.priority_rank(&target.slot), template.field_position(&target.slot), target.code.is_some())
    });
    candidates.into_iter().next()
}

fn format_hint(template: &SlotTemplate, slot: &str) -> Option<String> {
    if let Some(hint) = template.question_templates.get(slot).and_then(|question| question.format_hint.clone()) {
        return Some(hint);
    }
    match template.slot(slot)?.slot_type {
        SlotType::Date => Some("YYYY-MM-DD".to_string()),
        SlotType::Time => Some("HH:MM (24-hour)".to_string()),
        SlotType::Number => Some("a number".to_string()),
        SlotType::String | SlotType::Object | SlotType::Array => None,
    }
}

fn variables(label: &str, value: &str) -> HashMap<&'static str, String> {
    HashMap::from([("label", label.to_string()), ("value", value.to_string())])
}

fn render(raw: &str, variables: &HashMap<&'static str, String>) -> String {
    variables.iter().fold(raw.to_string(), |text, (key, value)| text.replace(&format!("{{{key}}}"), value))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use serde_json::json;

    use super::{QuestionContext, QuestionGenerator, QuestionKind};
    use crate::dialogue::problems::ProblemDetector;
    use crate::dialogue::validator::SlotValidator;
    use crate::domain::dialogue::{ConflictStrategy, HistoryEntry};
    use crate::domain::slot::SlotState;
    use crate::templates::{parse_template, TemplateLoader};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 5, 15, 10, 0, 0).single().expect("valid timestamp")
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 5, 15).expect("valid date")
    }

    fn state(pairs: &[(&str, serde_json::Value)]) -> SlotState {
        pairs.iter().map(|(key, value)| (key.to_string(), value.clone())).collect()
    }

    fn ask(loader: Arc<TemplateLoader>, intent: &str, slots: &SlotState) -> super::Question {
        let template = loader.get_template_by_intent(intent).expect("template");
        let validation = SlotValidator::new(loader.clone()).validate_template_at(slots, &template, now(), 0);
        let problems = ProblemDetector::default().detect_problems(slots, &template);
        QuestionGenerator::default()
            .generate(&validation, &template, &QuestionContext::new(problems, today()))
            .expect("something to ask")
    }

    fn builtin() -> Arc<TemplateLoader> {
        Arc::new(TemplateLoader::builtin().expect("builtin templates"))
    }

    #[test]
    fn missing_required_time_is_asked_before_optional_location() {
        let question = ask(
            builtin(),
            "book_lesson",
            &state(&[("label", json!("cello")), ("date", json!("2030-06-01"))]),
        );

        assert_eq!(question.kind, QuestionKind::Ask);
        assert_eq!(question.slot.as_deref(), Some("time"));
        assert_eq!(question.text, "What time should it start?");
        assert_eq!(question.format_hint.as_deref(), Some("24-hour HH:MM, e.g. 15:30"));
    }

    #[test]
    fn vague_time_gets_clarifying_question_with_daypart_times() {
        let question = ask(
            builtin(),
            "book_lesson",
            &state(&[("label", json!("cello")), ("date", json!("2030-06-01")), ("time", json!("afternoon"))]),
        );

        assert_eq!(question.kind, QuestionKind::Clarify);
        assert_eq!(question.slot.as_deref(), Some("time"));
        assert_eq!(question.suggestions, vec!["14:00", "15:00", "16:00"]);
    }

    #[test]
    fn two_broken_slots_fall_back_to_restate() {
        let question = ask(
            builtin(),
            "book_lesson",
            &state(&[("label", json!("cello")), ("date", json!("someday")), ("time", json!("afternoon"))]),
        );

        assert_eq!(question.kind, QuestionKind::Restate);
        assert!(question.slot.is_none());
        assert!(question.text.contains("date"));
        assert!(question.text.contains("start time"));
    }

    #[test]
    fn invalid_value_outranks_missing_field() {
        let question = ask(builtin(), "book_lesson", &state(&[("label", json!("c")), ("date", json!("2030-06-01"))]));

        assert_eq!(question.kind, QuestionKind::Fix);
        assert_eq!(question.slot.as_deref(), Some("label"));
        assert_eq!(question.text, "I couldn't use \"c\" as a lesson name. What should I call it?");
        assert_eq!(question.suggestions.len(), 3);
    }

    #[test]
    fn date_questions_suggest_upcoming_days() {
        let question = ask(builtin(), "book_lesson", &state(&[("label", json!("cello"))]));

        assert_eq!(question.slot.as_deref(), Some("date"));
        assert_eq!(question.suggestions, vec!["2030-05-16", "2030-05-17", "2030-05-18"]);
    }

    #[test]
    fn past_datetime_gets_its_own_wording() {
        let question = ask(
            builtin(),
            "cancel_lesson",
            &state(&[("label", json!("cello")), ("date", json!("2030-05-15")), ("time", json!("08:00"))]),
        );

        assert_eq!(question.kind, QuestionKind::Fix);
        assert_eq!(question.slot.as_deref(), Some("date"));
        assert!(question.text.contains("already passed"));
    }

    const DEPENDENT: &str = r#"
template_id = "tutor_call"
intent = "book_call"
field_order = ["topic", "dial_in", "host"]

[completion_rules]
minimum_required = ["dial_in", "host", "topic"]

[slots.dial_in]
type = "string"
priority = "critical"
depends_on = ["host"]

[slots.host]
type = "string"
priority = "low"

[slots.topic]
type = "string"
"#;

    #[test]
    fn slot_waiting_on_a_missing_dependency_is_asked_later() {
        let template = parse_template("inline", DEPENDENT).expect("parses");
        let loader = Arc::new(TemplateLoader::from_templates(vec![template]).expect("valid"));

        let question = ask(loader, "book_call", &state(&[("topic", json!("algebra"))]));
        assert_eq!(question.slot.as_deref(), Some("host"));
        assert_eq!(question.text, "What host should I use?");
    }

    #[test]
    fn recently_mentioned_slot_breaks_ties() {
        let raw = r#"
template_id = "tutor_call"
intent = "book_call"

[completion_rules]
minimum_required = ["agenda", "notes"]

[slots.agenda]
type = "string"

[slots.notes]
type = "string"
"#;
        let template = parse_template("inline", raw).expect("parses");
        let loader = Arc::new(TemplateLoader::from_templates(vec![template]).expect("valid"));
        let template = loader.get_template_by_intent("book_call").expect("template");
        let slots = SlotState::new();

        let history = vec![HistoryEntry {
            turn: 2,
            raw_text: "notes later".to_string(),
            extracted: state(&[("notes", json!(""))]),
            conflicts: Vec::new(),
            strategy: ConflictStrategy::Overwrite,
            confidence: 1.0,
            started_new_task: false,
            recorded_at: now(),
        }];
        let validation = SlotValidator::new(loader.clone()).validate_template_at(&slots, &template, now(), 0);
        let problems = ProblemDetector::default().detect_problems(&slots, &template);
        let context = QuestionContext::new(problems, today()).with_history(&history);

        let question = QuestionGenerator::default().generate(&validation, &template, &context).expect("question");
        assert_eq!(question.slot.as_deref(), Some("notes"));
    }

    #[test]
    fn complete_valid_slots_leave_nothing_to_ask() {
        let loader = builtin();
        let template = loader.get_template_by_intent("book_lesson").expect("template");
        let slots = state(&[("label", json!("cello")), ("date", json!("2030-06-01")), ("time", json!("15:00"))]);
        let validation = SlotValidator::new(loader.clone()).validate_template_at(&slots, &template, now(), 0);
        let problems = ProblemDetector::default().detect_problems(&slots, &template);

        assert!(validation.is_ready());
        let question = QuestionGenerator::default().generate(&validation, &template, &QuestionContext::new(problems, today()));
        assert_eq!(question, None);
    }
}
