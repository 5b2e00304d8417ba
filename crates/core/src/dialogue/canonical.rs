//! Flattens a completed slot state into the entity map sent to the action executor.

use chrono::Duration;
use serde_json::{json, Map, Value};

use crate::dialogue::validator::{parse_strict_date, parse_strict_time};
use crate::domain::slot::{is_empty_value, SlotState};
use crate::domain::template::SlotTemplate;

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// Resolves alias keys to slot names, drops empty values, and folds the
/// date and time roles into `interval {start, end, duration_minutes}`.
pub fn canonical_entities(slot_state: &SlotState, template: &SlotTemplate) -> Map<String, Value> {
    let mut entities = Map::new();
    for (key, value) in slot_state {
        if is_empty_value(value) {
            continue;
        }
        let name = template.resolve_slot_name(key).unwrap_or(key.as_str()).to_string();
        // An exact slot name beats an alias that maps onto it.
        if entities.contains_key(&name) && name != *key {
            continue;
        }
        entities.insert(name, value.clone());
    }

    let roles = &template.fields;
    let date = entities.get(&roles.date).and_then(parse_strict_date);
    let time = entities.get(&roles.time).and_then(parse_strict_time);
    if let (Some(date), Some(time)) = (date, time) {
        let minutes = entities
            .get(&roles.duration)
            .and_then(duration_minutes)
            .unwrap_or(i64::from(template.default_duration_minutes));
        let start = date.and_time(time);
        let end = start + Duration::minutes(minutes);

        entities.remove(&roles.date);
        entities.remove(&roles.time);
        entities.insert(
            "interval".to_string(),
            json!({
                "start": start.format(DATETIME_FORMAT).to_string(),
                "end": end.format(DATETIME_FORMAT).to_string(),
                "duration_minutes": minutes,
            }),
        );
    }
    entities
}

fn duration_minutes(value: &Value) -> Option<i64> {
    let minutes = match value {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => text.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (minutes.is_finite() && minutes > 0.0).then(|| minutes.round() as i64)
}
