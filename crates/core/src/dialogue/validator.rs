use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dialogue::temporal::{DATE_FORMAT, TIME_FORMAT};
use crate::domain::slot::{display_value, is_empty_value, is_filled, value_as_text, SlotState};
use crate::domain::template::{RequirementKind, SlotDefinition, SlotPriority, SlotTemplate, SlotType};
use crate::templates::{TemplateError, TemplateLoader};

const REQUIRED_WEIGHT: f64 = 0.8;
const OPTIONAL_WEIGHT: f64 = 0.2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    InvalidType,
    TooShort,
    TooLong,
    PatternMismatch,
    NotAllowed,
    NotANumber,
    BelowMinimum,
    AboveMaximum,
    InvalidDateFormat,
    DateInPast,
    InvalidTimeFormat,
    TimeOutOfRange,
    NotAnObject,
    MissingNestedKey,
    TooManyItems,
    DatetimeInPast,
    InvalidRepeatFrequency,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidType => "INVALID_TYPE",
            Self::TooShort => "TOO_SHORT",
            Self::TooLong => "TOO_LONG",
            Self::PatternMismatch => "PATTERN_MISMATCH",
            Self::NotAllowed => "NOT_ALLOWED",
            Self::NotANumber => "NOT_A_NUMBER",
            Self::BelowMinimum => "BELOW_MINIMUM",
            Self::AboveMaximum => "ABOVE_MAXIMUM",
            Self::InvalidDateFormat => "INVALID_DATE_FORMAT",
            Self::DateInPast => "DATE_IN_PAST",
            Self::InvalidTimeFormat => "INVALID_TIME_FORMAT",
            Self::TimeOutOfRange => "TIME_OUT_OF_RANGE",
            Self::NotAnObject => "NOT_AN_OBJECT",
            Self::MissingNestedKey => "MISSING_NESTED_KEY",
            Self::TooManyItems => "TOO_MANY_ITEMS",
            Self::DatetimeInPast => "DATETIME_IN_PAST",
            Self::InvalidRepeatFrequency => "INVALID_REPEAT_FREQUENCY",
        }
    }

    pub fn is_cross_field(&self) -> bool {
        matches!(self, Self::DatetimeInPast | Self::InvalidRepeatFrequency)
    }
}

/// A per-field (or cross-field) content error. Always recoverable by asking.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub slot: String,
    pub code: ValidationCode,
    pub message: String,
    pub value: Value,
    /// Every slot involved; just `slot` for single-field rules.
    pub related: Vec<String>,
}

impl ValidationIssue {
    fn field(slot: &str, code: ValidationCode, message: impl Into<String>, value: &Value) -> Self {
        Self {
            slot: slot.to_string(),
            code,
            message: message.into(),
            value: value.clone(),
            related: vec![slot.to_string()],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingSlot {
    pub slot: String,
    pub requirement: RequirementKind,
    pub priority: SlotPriority,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    FixInvalid,
    AskMissing,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub slot: String,
    pub kind: RecommendationKind,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub is_complete: bool,
    pub missing_slots: Vec<MissingSlot>,
    pub completion_score: f64,
    pub validation_errors: Vec<ValidationIssue>,
    pub recommendations: Vec<Recommendation>,
}

impl ValidationResult {
    pub fn missing_slot_names(&self) -> Vec<String> {
        self.missing_slots.iter().map(|missing| missing.slot.clone()).collect()
    }

    pub fn has_error(&self, code: ValidationCode) -> bool {
        self.validation_errors.iter().any(|issue| issue.code == code)
    }

    pub fn is_ready(&self) -> bool {
        self.is_valid && self.is_complete
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub default_utc_offset_minutes: i32,
}

pub struct SlotValidator {
    templates: Arc<TemplateLoader>,
    config: ValidatorConfig,
}

impl SlotValidator {
    pub fn new(templates: Arc<TemplateLoader>) -> Self {
        Self::with_config(templates, ValidatorConfig::default())
    }

    pub fn with_config(templates: Arc<TemplateLoader>, config: ValidatorConfig) -> Self {
        Self { templates, config }
    }

    pub fn validate(&self, state: &SlotState, intent: &str) -> Result<ValidationResult, TemplateError> {
        self.validate_at(state, intent, Utc::now(), self.config.default_utc_offset_minutes)
    }

    pub fn validate_at(
        &self,
        state: &SlotState,
        intent: &str,
        now: DateTime<Utc>,
        utc_offset_minutes: i32,
    ) -> Result<ValidationResult, TemplateError> {
        let template = self.templates.get_template_by_intent(intent)?;
        Ok(self.validate_template_at(state, &template, now, utc_offset_minutes))
    }

    pub fn validate_template_at(
        &self,
        state: &SlotState,
        template: &SlotTemplate,
        now: DateTime<Utc>,
        utc_offset_minutes: i32,
    ) -> ValidationResult {
        let local_now =
            (now + Duration::minutes(i64::from(utc_offset_minutes))).naive_utc();

        let mut errors = Vec::new();
        for (name, slot) in &template.slots {
            let Some(value) = state.get(name) else {
                continue;
            };
            if is_empty_value(value) {
                continue;
            }
            if let Some(issue) = self.validate_field(template, name, slot, value, local_now) {
                errors.push(issue);
            }
        }
        errors.extend(check_datetime_in_future(state, template, local_now));
        errors.extend(check_repeat_frequency(state, template));

        let missing_slots = missing_slots(state, template);
        let completion_score = completion_score(state, template);
        let recommendations = recommendations(template, &errors, &missing_slots);

        ValidationResult {
            is_valid: errors.is_empty(),
            is_complete: missing_slots.is_empty(),
            missing_slots,
            completion_score,
            validation_errors: errors,
            recommendations,
        }
    }

    fn validate_field(
        &self,
        template: &SlotTemplate,
        name: &str,
        slot: &SlotDefinition,
        value: &Value,
        local_now: NaiveDateTime,
    ) -> Option<ValidationIssue> {
        match slot.slot_type {
            SlotType::String => self.validate_string(template, name, slot, value),
            SlotType::Number => validate_number(name, slot, value),
            SlotType::Date => validate_date(name, slot, value, local_now.date()),
            SlotType::Time => validate_time(name, slot, value),
            SlotType::Object => validate_object(name, slot, value),
            SlotType::Array => validate_array(name, slot, value),
        }
    }

    fn validate_string(
        &self,
        template: &SlotTemplate,
        name: &str,
        slot: &SlotDefinition,
        value: &Value,
    ) -> Option<ValidationIssue> {
        let Some(text) = value_as_text(value) else {
            return Some(ValidationIssue::field(name, ValidationCode::InvalidType, "expected text", value));
        };
        let rules = &slot.validation;
        let length = text.chars().count();

        if let Some(min) = rules.min_length {
            if length < min {
                return Some(ValidationIssue::field(
                    name,
                    ValidationCode::TooShort,
                    format!("must be at least {min} characters"),
                    value,
                ));
            }
        }
        if let Some(max) = rules.max_length {
            if length > max {
                return Some(ValidationIssue::field(
                    name,
                    ValidationCode::TooLong,
                    format!("must be at most {max} characters"),
                    value,
                ));
            }
        }
        if let Some(pattern) = self.templates.pattern(&template.template_id, name) {
            if !pattern.is_match(&text) {
                return Some(ValidationIssue::field(
                    name,
                    ValidationCode::PatternMismatch,
                    "does not match the expected format",
                    value,
                ));
            }
        }
        if !rules.allowed_values.is_empty()
            && !rules.allowed_values.iter().any(|allowed| allowed.eq_ignore_ascii_case(&text))
        {
            return Some(ValidationIssue::field(
                name,
                ValidationCode::NotAllowed,
                format!("must be one of: {}", rules.allowed_values.join(", ")),
                value,
            ));
        }
        None
    }
}

fn validate_number(name: &str, slot: &SlotDefinition, value: &Value) -> Option<ValidationIssue> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    let Some(number) = number.filter(|number| number.is_finite()) else {
        return Some(ValidationIssue::field(name, ValidationCode::NotANumber, "expected a number", value));
    };

    let rules = &slot.validation;
    if let Some(min) = rules.min {
        if number < min {
            return Some(ValidationIssue::field(
                name,
                ValidationCode::BelowMinimum,
                format!("must be at least {min}"),
                value,
            ));
        }
    }
    if let Some(max) = rules.max {
        if number > max {
            return Some(ValidationIssue::field(
                name,
                ValidationCode::AboveMaximum,
                format!("must be at most {max}"),
                value,
            ));
        }
    }
    None
}

/// Strict `YYYY-MM-DD`.
pub fn parse_strict_date(value: &Value) -> Option<NaiveDate> {
    let text = value.as_str()?.trim();
    if text.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(text, DATE_FORMAT).ok()
}

/// Strict 24-hour `HH:MM`.
pub fn parse_strict_time(value: &Value) -> Option<NaiveTime> {
    let text = value.as_str()?.trim();
    if text.len() != 5 {
        return None;
    }
    NaiveTime::parse_from_str(text, TIME_FORMAT).ok()
}

fn validate_date(
    name: &str,
    slot: &SlotDefinition,
    value: &Value,
    today: NaiveDate,
) -> Option<ValidationIssue> {
    let Some(date) = parse_strict_date(value) else {
        return Some(ValidationIssue::field(
            name,
            ValidationCode::InvalidDateFormat,
            "expected a date as YYYY-MM-DD",
            value,
        ));
    };
    if slot.validation.future_only && date < today {
        return Some(ValidationIssue::field(
            name,
            ValidationCode::DateInPast,
            "date is in the past",
            value,
        ));
    }
    None
}

fn validate_time(name: &str, slot: &SlotDefinition, value: &Value) -> Option<ValidationIssue> {
    let Some(time) = parse_strict_time(value) else {
        return Some(ValidationIssue::field(
            name,
            ValidationCode::InvalidTimeFormat,
            "expected a time as HH:MM",
            value,
        ));
    };
    if let Some(range) = &slot.validation.allowed_range {
        let start = NaiveTime::parse_from_str(&range.start, TIME_FORMAT).ok();
        let end = NaiveTime::parse_from_str(&range.end, TIME_FORMAT).ok();
        if let (Some(start), Some(end)) = (start, end) {
            if time < start || time > end {
                return Some(ValidationIssue::field(
                    name,
                    ValidationCode::TimeOutOfRange,
                    format!("must be between {} and {}", range.start, range.end),
                    value,
                ));
            }
        }
    }
    None
}

fn validate_object(name: &str, slot: &SlotDefinition, value: &Value) -> Option<ValidationIssue> {
    let Value::Object(map) = value else {
        return Some(ValidationIssue::field(name, ValidationCode::NotAnObject, "expected an object", value));
    };
    for key in &slot.validation.required_keys {
        let present = map.get(key).map(|nested| !is_empty_value(nested)).unwrap_or(false);
        if !present {
            return Some(ValidationIssue::field(
                name,
                ValidationCode::MissingNestedKey,
                format!("`{key}` is required"),
                value,
            ));
        }
    }
    None
}

fn validate_array(name: &str, slot: &SlotDefinition, value: &Value) -> Option<ValidationIssue> {
    let Value::Array(items) = value else {
        return Some(ValidationIssue::field(name, ValidationCode::InvalidType, "expected a list", value));
    };
    if let Some(max) = slot.validation.max_items {
        if items.len() > max {
            return Some(ValidationIssue::field(
                name,
                ValidationCode::TooManyItems,
                format!("at most {max} entries"),
                value,
            ));
        }
    }
    None
}

fn check_datetime_in_future(
    state: &SlotState,
    template: &SlotTemplate,
    local_now: NaiveDateTime,
) -> Option<ValidationIssue> {
    let roles = &template.fields;
    let date_value = state.get(&roles.date)?;
    let time_value = state.get(&roles.time)?;
    let date = parse_strict_date(date_value)?;
    let time = parse_strict_time(time_value)?;

    let start = date.and_time(time);
    if start > local_now {
        return None;
    }
    Some(ValidationIssue {
        slot: roles.date.clone(),
        code: ValidationCode::DatetimeInPast,
        message: format!("{} {} has already passed", display_value(date_value), display_value(time_value)),
        value: Value::String(start.format("%Y-%m-%dT%H:%M").to_string()),
        related: vec![roles.date.clone(), roles.time.clone()],
    })
}

/// Upper bound on the repeat interval for each recurrence pattern.
fn max_frequency(pattern: &str) -> Option<u64> {
    match pattern {
        "daily" => Some(30),
        "weekly" => Some(12),
        "monthly" => Some(12),
        _ => None,
    }
}

fn check_repeat_frequency(state: &SlotState, template: &SlotTemplate) -> Option<ValidationIssue> {
    let repeat_field = &template.fields.repeat;
    let value = state.get(repeat_field)?;
    let Value::Object(spec) = value else {
        return None;
    };
    let pattern = spec.get("pattern").and_then(Value::as_str)?.trim().to_lowercase();
    if pattern == "once" {
        return None;
    }

    let frequency = match spec.get("frequency") {
        None | Some(Value::Null) => Some(1),
        Some(Value::Number(number)) => number.as_u64(),
        Some(Value::String(text)) => text.trim().parse::<u64>().ok(),
        Some(_) => None,
    };

    let sane = match (max_frequency(&pattern), frequency) {
        (Some(max), Some(frequency)) => (1..=max).contains(&frequency),
        _ => false,
    };
    if sane {
        return None;
    }
    Some(ValidationIssue::field(
        repeat_field,
        ValidationCode::InvalidRepeatFrequency,
        format!("frequency is not valid for a `{pattern}` schedule"),
        value,
    ))
}

fn missing_slots(state: &SlotState, template: &SlotTemplate) -> Vec<MissingSlot> {
    let mut missing: Vec<MissingSlot> = template
        .requirements(state)
        .into_iter()
        .filter(|(name, _)| !is_filled(state, name))
        .map(|(name, requirement)| MissingSlot {
            priority: template.slot(&name).map(|slot| slot.priority).unwrap_or_default(),
            slot: name,
            requirement,
        })
        .collect();
    missing.sort_by_key(|slot| {
        (slot.requirement, slot.priority.rank(), template.field_position(&slot.slot))
    });
    missing
}

/// Denominators come from unconditional requirements only, so filling more
/// fields can never lower the score.
fn completion_score(state: &SlotState, template: &SlotTemplate) -> f64 {
    let required = template.required_slots();
    let optional = template.optional_slots();
    let filled = |names: &[String]| names.iter().filter(|name| is_filled(state, name)).count();

    let mut score = 0.0;
    if !required.is_empty() {
        score += REQUIRED_WEIGHT * filled(&required) as f64 / required.len() as f64;
    }
    if !optional.is_empty() {
        score += OPTIONAL_WEIGHT * filled(&optional) as f64 / optional.len() as f64;
    }
    (score * 100.0).round() / 100.0
}

fn recommendations(
    template: &SlotTemplate,
    errors: &[ValidationIssue],
    missing: &[MissingSlot],
) -> Vec<Recommendation> {
    let mut ranked_errors: Vec<&ValidationIssue> = errors.iter().collect();
    ranked_errors.sort_by_key(|issue| {
        (template.priority_rank(&issue.slot), template.field_position(&issue.slot))
    });

    let mut seen = BTreeSet::new();
    let mut recommendations = Vec::new();
    for issue in ranked_errors {
        if seen.insert(issue.slot.clone()) {
            recommendations.push(Recommendation {
                slot: issue.slot.clone(),
                kind: RecommendationKind::FixInvalid,
                reason: issue.code.as_str().to_string(),
            });
        }
    }
    for slot in missing {
        if seen.insert(slot.slot.clone()) {
            recommendations.push(Recommendation {
                slot: slot.slot.clone(),
                kind: RecommendationKind::AskMissing,
                reason: match slot.requirement {
                    RequirementKind::Required => "required".to_string(),
                    RequirementKind::Conditional => "required by another answer".to_string(),
                },
            });
        }
    }
    recommendations
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    use super::{RecommendationKind, SlotValidator, ValidationCode};
    use crate::domain::slot::SlotState;
    use crate::domain::template::RequirementKind;
    use crate::templates::TemplateLoader;

    fn validator() -> SlotValidator {
        SlotValidator::new(Arc::new(TemplateLoader::builtin().expect("builtin templates")))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 5, 15, 10, 0, 0).single().expect("valid timestamp")
    }

    fn state(pairs: &[(&str, serde_json::Value)]) -> SlotState {
        pairs.iter().map(|(key, value)| (key.to_string(), value.clone())).collect()
    }

    #[test]
    fn far_future_datetime_passes_and_past_datetime_fails() {
        let validator = validator();

        let future = validator
            .validate_at(
                &state(&[("label", json!("cello")), ("date", json!("2099-01-01")), ("time", json!("14:00"))]),
                "book_lesson",
                now(),
                0,
            )
            .expect("template exists");
        assert!(future.is_valid, "unexpected errors: {:?}", future.validation_errors);
        assert!(future.is_complete);

        let past = validator
            .validate_at(
                &state(&[("label", json!("cello")), ("date", json!("2000-01-01")), ("time", json!("14:00"))]),
                "book_lesson",
                now(),
                0,
            )
            .expect("template exists");
        assert!(!past.is_valid);
        assert!(past.has_error(ValidationCode::DatetimeInPast));
        assert!(past.is_complete, "completeness is independent of validity");
    }

    #[test]
    fn same_day_earlier_time_is_in_the_past_in_user_offset() {
        let validator = validator();
        let slots = state(&[("label", json!("cello")), ("date", json!("2030-05-15")), ("time", json!("11:00"))]);

        let utc = validator.validate_at(&slots, "book_lesson", now(), 0).expect("template exists");
        assert!(utc.is_valid);

        let plus_two = validator.validate_at(&slots, "book_lesson", now(), 120).expect("template exists");
        assert!(plus_two.has_error(ValidationCode::DatetimeInPast));
    }

    #[test]
    fn completion_score_weights_required_and_optional() {
        let validator = validator();

        let empty = validator.validate_at(&SlotState::new(), "book_lesson", now(), 0).expect("ok");
        assert_eq!(empty.completion_score, 0.0);

        let partial = validator
            .validate_at(&state(&[("label", json!("cello")), ("date", json!("2030-06-01"))]), "book_lesson", now(), 0)
            .expect("ok");
        // 0.8 * 2/3
        assert_eq!(partial.completion_score, 0.53);

        let with_optional = validator
            .validate_at(
                &state(&[
                    ("label", json!("cello")),
                    ("date", json!("2030-06-01")),
                    ("time", json!("15:00")),
                    ("location", json!("Room 4")),
                ]),
                "book_lesson",
                now(),
                0,
            )
            .expect("ok");
        // 0.8 + 0.2 * 1/6
        assert_eq!(with_optional.completion_score, 0.83);
    }

    #[test]
    fn completion_score_never_drops_as_fields_are_added() {
        let validator = validator();
        let steps = [
            ("label", json!("cello")),
            ("date", json!("2030-06-01")),
            // A weekly repeat activates the conditional `repeat_until` requirement.
            ("repeat", json!({ "pattern": "weekly" })),
            ("time", json!("15:00")),
            ("repeat_until", json!("2030-08-31")),
            ("person", json!("Mia")),
            ("location", json!("Room 4")),
            ("duration", json!(45)),
            ("reminder", json!(30)),
        ];

        let mut filled = SlotState::new();
        let mut previous = validator.validate_at(&filled, "book_lesson", now(), 0).expect("ok").completion_score;
        for (slot, value) in steps {
            filled.insert(slot.to_string(), value);
            let score = validator.validate_at(&filled, "book_lesson", now(), 0).expect("ok").completion_score;
            assert!(score >= previous, "adding `{slot}` lowered the score from {previous} to {score}");
            previous = score;
        }
        assert_eq!(previous, 1.0);
    }

    #[test]
    fn valid_but_incomplete_lists_missing_in_priority_order() {
        let validator = validator();
        let result = validator
            .validate_at(
                &state(&[("label", json!("cello")), ("repeat", json!({ "pattern": "weekly", "frequency": 2 }))]),
                "book_lesson",
                now(),
                0,
            )
            .expect("ok");

        assert!(result.is_valid);
        assert!(!result.is_complete);
        assert_eq!(result.missing_slot_names(), vec!["date", "time", "repeat_until"]);
        assert_eq!(result.missing_slots[2].requirement, RequirementKind::Conditional);
    }

    #[test]
    fn type_rules_reject_bad_values() {
        let validator = validator();
        let result = validator
            .validate_at(
                &state(&[
                    ("label", json!("c")),
                    ("date", json!("01/06/2030")),
                    ("time", json!("23:30")),
                    ("duration", json!("500")),
                    ("repeat", json!(["weekly"])),
                ]),
                "book_lesson",
                now(),
                0,
            )
            .expect("ok");

        let codes: Vec<ValidationCode> = result.validation_errors.iter().map(|issue| issue.code).collect();
        assert!(codes.contains(&ValidationCode::TooShort));
        assert!(codes.contains(&ValidationCode::InvalidDateFormat));
        assert!(codes.contains(&ValidationCode::TimeOutOfRange));
        assert!(codes.contains(&ValidationCode::AboveMaximum));
        assert!(codes.contains(&ValidationCode::NotAnObject));
    }

    #[test]
    fn repeat_frequency_must_suit_pattern() {
        let validator = validator();
        let base = [("label", json!("cello")), ("date", json!("2030-06-01")), ("time", json!("15:00"))];

        let check = |repeat: serde_json::Value| {
            let mut slots = state(&base);
            slots.insert("repeat".to_string(), repeat);
            validator
                .validate_at(&slots, "book_lesson", now(), 0)
                .expect("ok")
                .has_error(ValidationCode::InvalidRepeatFrequency)
        };

        assert!(!check(json!({ "pattern": "weekly", "frequency": 2 })));
        assert!(!check(json!({ "pattern": "daily" })));
        assert!(!check(json!({ "pattern": "once", "frequency": 99 })));
        assert!(check(json!({ "pattern": "weekly", "frequency": 40 })));
        assert!(check(json!({ "pattern": "monthly", "frequency": 0 })));
        assert!(check(json!({ "pattern": "hourly", "frequency": 1 })));
    }

    #[test]
    fn recommendations_put_fixes_first_and_deduplicate() {
        let validator = validator();
        let result = validator
            .validate_at(&state(&[("label", json!("cello")), ("date", json!("tomorrow"))]), "book_lesson", now(), 0)
            .expect("ok");

        assert_eq!(result.recommendations[0].slot, "date");
        assert_eq!(result.recommendations[0].kind, RecommendationKind::FixInvalid);
        assert_eq!(result.recommendations[1].slot, "time");
        assert_eq!(result.recommendations[1].kind, RecommendationKind::AskMissing);
        assert_eq!(result.recommendations.len(), 2);
    }

    #[test]
    fn unknown_intent_is_template_not_found() {
        let validator = validator();
        let error = validator.validate_at(&SlotState::new(), "order_pizza", now(), 0).expect_err("unknown");
        assert!(error.is_not_found());
    }
}
