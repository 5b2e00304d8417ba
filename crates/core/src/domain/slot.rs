use std::collections::BTreeMap;

use serde_json::Value;

/// Slot name to extracted value. Ordered so persisted documents and history
/// entries serialize deterministically.
pub type SlotState = BTreeMap<String, Value>;

/// Null, blank strings, empty arrays and empty objects all count as "not filled".
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Resolves a dot path (`repeat.pattern`) against a slot state.
pub fn lookup_path<'a>(state: &'a SlotState, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let head = segments.next()?;
    let mut current = state.get(head)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            _ => return None,
        };
    }
    Some(current)
}

pub fn is_filled(state: &SlotState, path: &str) -> bool {
    lookup_path(state, path).map(|value| !is_empty_value(value)).unwrap_or(false)
}

/// First segment of a dot path, i.e. the top-level slot it belongs to.
pub fn root_slot(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

/// Equality used by merging: strings compare case- and whitespace-insensitively,
/// everything else structurally.
pub fn values_equivalent(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::String(a), Value::String(b)) => normalize_text(a) == normalize_text(b),
        _ => left == right,
    }
}

pub fn normalize_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

pub fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// Human-readable rendering for question text and log fields.
pub fn display_value(value: &Value) -> String {
    value_as_text(value).unwrap_or_else(|| value.to_string())
}
