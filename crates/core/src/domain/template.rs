//! Per-intent slot schemas.
//!
//! A [`SlotTemplate`] is loaded once from a static document and shared
//! read-only afterwards. It declares which slots an intent collects, how each
//! slot is validated, which slots are required (unconditionally or when a
//! [`Condition`] holds), and how follow-up questions are phrased.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::slot::{is_filled, lookup_path, values_equivalent, SlotState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotType {
    String,
    Number,
    Date,
    Time,
    Object,
    Array,
}

impl SlotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Date => "date",
            Self::Time => "time",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// Static priority tier used when ranking what to ask next.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl SlotPriority {
    /// Lower ranks are asked first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeRange {
    /// Inclusive `HH:MM`.
    pub start: String,
    /// Inclusive `HH:MM`.
    pub end: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationRules {
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<String>,
    pub allowed_values: Vec<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub future_only: bool,
    pub allowed_range: Option<TimeRange>,
    pub required_keys: Vec<String>,
    pub max_items: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlotDefinition {
    #[serde(rename = "type")]
    pub slot_type: SlotType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub priority: SlotPriority,
    /// Display name used in question text; falls back to the slot name.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub validation: ValidationRules,
    /// Alternative names an extractor may use for this slot.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Slots that must be filled before asking for this one makes sense.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    #[default]
    Equals,
    NotEquals,
    Present,
}

/// `{field, operator, value}` evaluated against a slot state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    #[serde(default)]
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn equals(field: impl Into<String>, value: Value) -> Self {
        Self { field: field.into(), operator: ConditionOperator::Equals, value }
    }

    pub fn matches(&self, state: &SlotState) -> bool {
        let current = lookup_path(state, &self.field);
        match self.operator {
            ConditionOperator::Equals => {
                current.map(|value| values_equivalent(value, &self.value)).unwrap_or(false)
            }
            ConditionOperator::NotEquals => {
                !current.map(|value| values_equivalent(value, &self.value)).unwrap_or(false)
            }
            ConditionOperator::Present => is_filled(state, &self.field),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionalRequirement {
    pub when: Condition,
    pub require: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionRules {
    pub minimum_required: Vec<String>,
    pub conditional_required: Vec<ConditionalRequirement>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuestionTemplate {
    pub ask: String,
    pub fix: Option<String>,
    pub suggestions: Vec<String>,
    pub format_hint: Option<String>,
}

/// Which slot names play the temporal and labelling roles used by mixed-slot
/// repair, cross-field validation and canonical flattening.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldRoles {
    pub date: String,
    pub time: String,
    pub label: String,
    pub person: String,
    pub repeat: String,
    pub duration: String,
}

impl Default for FieldRoles {
    fn default() -> Self {
        Self {
            date: "date".to_string(),
            time: "time".to_string(),
            label: "label".to_string(),
            person: "person".to_string(),
            repeat: "repeat".to_string(),
            duration: "duration".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementKind {
    Required,
    Conditional,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlotTemplate {
    pub template_id: String,
    pub intent: String,
    #[serde(default)]
    pub description: Option<String>,
    pub slots: BTreeMap<String, SlotDefinition>,
    #[serde(default)]
    pub completion_rules: CompletionRules,
    #[serde(default)]
    pub question_templates: BTreeMap<String, QuestionTemplate>,
    /// Expected order of collection for this intent.
    #[serde(default)]
    pub field_order: Vec<String>,
    #[serde(default)]
    pub fields: FieldRoles,
    #[serde(default = "default_duration_minutes")]
    pub default_duration_minutes: u32,
}

fn default_duration_minutes() -> u32 {
    60
}

impl SlotTemplate {
    pub fn slot(&self, name: &str) -> Option<&SlotDefinition> {
        self.slots.get(name)
    }

    pub fn display_label<'a>(&'a self, name: &'a str) -> &'a str {
        self.slots.get(name).and_then(|slot| slot.label.as_deref()).unwrap_or(name)
    }

    /// Position in the intent's expected field order; unknown slots sort last.
    pub fn field_position(&self, name: &str) -> usize {
        self.field_order.iter().position(|field| field == name).unwrap_or(self.field_order.len())
    }

    pub fn priority_rank(&self, name: &str) -> u8 {
        self.slots.get(name).map(|slot| slot.priority.rank()).unwrap_or(SlotPriority::Normal.rank())
    }

    /// Unconditionally required slots: the minimum-required list plus every slot
    /// flagged `required`, without duplicates, in declaration order.
    pub fn required_slots(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut required = Vec::new();
        for name in &self.completion_rules.minimum_required {
            if seen.insert(name.clone()) {
                required.push(name.clone());
            }
        }
        for (name, slot) in &self.slots {
            if slot.required && seen.insert(name.clone()) {
                required.push(name.clone());
            }
        }
        required
    }

    /// Slots that count toward the optional half of the completion score.
    pub fn optional_slots(&self) -> Vec<String> {
        let required: BTreeSet<String> = self.required_slots().into_iter().collect();
        self.slots.keys().filter(|name| !required.contains(*name)).cloned().collect()
    }

    /// Conditional requirements whose condition holds against `state`, minus
    /// those already unconditionally required.
    pub fn active_conditional(&self, state: &SlotState) -> Vec<String> {
        let required: BTreeSet<String> = self.required_slots().into_iter().collect();
        let mut seen = BTreeSet::new();
        let mut active = Vec::new();
        for rule in &self.completion_rules.conditional_required {
            if !rule.when.matches(state) {
                continue;
            }
            for name in &rule.require {
                if !required.contains(name) && seen.insert(name.clone()) {
                    active.push(name.clone());
                }
            }
        }
        active
    }

    /// Every requirement currently in force, tagged with why it applies.
    pub fn requirements(&self, state: &SlotState) -> Vec<(String, RequirementKind)> {
        let mut all: Vec<(String, RequirementKind)> = self
            .required_slots()
            .into_iter()
            .map(|name| (name, RequirementKind::Required))
            .collect();
        all.extend(
            self.active_conditional(state)
                .into_iter()
                .map(|name| (name, RequirementKind::Conditional)),
        );
        all
    }

    /// Maps an incoming field name to its slot, resolving aliases.
    pub fn resolve_slot_name<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        if self.slots.contains_key(name) {
            return Some(name);
        }
        self.slots
            .iter()
            .find(|(_, slot)| slot.aliases.iter().any(|alias| alias.eq_ignore_ascii_case(name)))
            .map(|(slot_name, _)| slot_name.as_str())
    }

    /// Slot names referenced by completion rules, by their top-level segment.
    pub fn referenced_slots(&self) -> BTreeSet<String> {
        let mut referenced = BTreeSet::new();
        for name in &self.completion_rules.minimum_required {
            referenced.insert(crate::domain::slot::root_slot(name).to_string());
        }
        for rule in &self.completion_rules.conditional_required {
            referenced.insert(crate::domain::slot::root_slot(&rule.when.field).to_string());
            for name in &rule.require {
                referenced.insert(crate::domain::slot::root_slot(name).to_string());
            }
        }
        referenced
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::{
        CompletionRules, Condition, ConditionOperator, ConditionalRequirement, FieldRoles,
        RequirementKind, SlotDefinition, SlotPriority, SlotTemplate, SlotType, ValidationRules,
    };
    use crate::domain::slot::SlotState;

    fn slot(slot_type: SlotType, required: bool) -> SlotDefinition {
        SlotDefinition {
            slot_type,
            required,
            priority: SlotPriority::Normal,
            label: None,
            validation: ValidationRules::default(),
            aliases: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    fn template() -> SlotTemplate {
        let mut slots = BTreeMap::new();
        slots.insert("label".to_string(), slot(SlotType::String, true));
        slots.insert("date".to_string(), slot(SlotType::Date, false));
        slots.insert("repeat".to_string(), slot(SlotType::Object, false));
        slots.insert("repeat_until".to_string(), slot(SlotType::Date, false));
        let mut course = slot(SlotType::String, false);
        course.aliases = vec!["subject".to_string()];
        slots.insert("course".to_string(), course);

        SlotTemplate {
            template_id: "book_lesson".to_string(),
            intent: "book_lesson".to_string(),
            description: None,
            slots,
            completion_rules: CompletionRules {
                minimum_required: vec!["date".to_string()],
                conditional_required: vec![ConditionalRequirement {
                    when: Condition::equals("repeat.pattern", json!("weekly")),
                    require: vec!["repeat_until".to_string()],
                }],
            },
            question_templates: BTreeMap::new(),
            field_order: vec!["label".to_string(), "date".to_string()],
            fields: FieldRoles::default(),
            default_duration_minutes: 60,
        }
    }

    #[test]
    fn required_slots_union_minimum_and_flagged_slots() {
        let template = template();
        assert_eq!(template.required_slots(), vec!["date".to_string(), "label".to_string()]);
        assert_eq!(
            template.optional_slots(),
            vec!["course".to_string(), "repeat".to_string(), "repeat_until".to_string()]
        );
    }

    #[test]
    fn conditional_requirement_activates_on_equality() {
        let template = template();
        let mut state = SlotState::new();
        assert!(template.active_conditional(&state).is_empty());

        state.insert("repeat".to_string(), json!({ "pattern": "Weekly", "frequency": 1 }));
        let requirements = template.requirements(&state);
        assert!(requirements
            .contains(&("repeat_until".to_string(), RequirementKind::Conditional)));
    }

    #[test]
    fn not_equals_and_present_operators() {
        let mut state = SlotState::new();
        state.insert("mode".to_string(), json!("online"));

        let not_offline = Condition {
            field: "mode".to_string(),
            operator: ConditionOperator::NotEquals,
            value: json!("offline"),
        };
        let has_room =
            Condition { field: "room".to_string(), operator: ConditionOperator::Present, value: json!(null) };

        assert!(not_offline.matches(&state));
        assert!(!has_room.matches(&state));
    }

    #[test]
    fn aliases_resolve_to_slot_names() {
        let template = template();
        assert_eq!(template.resolve_slot_name("Subject"), Some("course"));
        assert_eq!(template.resolve_slot_name("date"), Some("date"));
        assert_eq!(template.resolve_slot_name("venue"), None);
    }
}
