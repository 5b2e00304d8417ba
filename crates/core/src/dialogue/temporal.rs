//! Token-level handling of dates and times inside free-text slot values.

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M";

/// Configurable word lists. Phrases are lower-case and may span several words.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalVocabulary {
    pub relative_dates: Vec<String>,
    pub dayparts: Vec<String>,
    pub placeholder_dates: Vec<String>,
}

impl Default for TemporalVocabulary {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|word| word.to_string()).collect();
        Self {
            relative_dates: words(&[
                "day after tomorrow",
                "the day after tomorrow",
                "today",
                "tomorrow",
                "this weekend",
                "next week",
                "next monday",
                "next tuesday",
                "next wednesday",
                "next thursday",
                "next friday",
                "next saturday",
                "next sunday",
                "monday",
                "tuesday",
                "wednesday",
                "thursday",
                "friday",
                "saturday",
                "sunday",
            ]),
            dayparts: words(&["morning", "afternoon", "evening", "night", "noon", "tonight"]),
            placeholder_dates: words(&[
                "date", "day", "someday", "sometime", "some day", "tbd", "tba", "later", "soon",
                "unknown", "whenever", "n/a",
            ]),
        }
    }
}

impl TemporalVocabulary {
    pub fn is_daypart(&self, token: &str) -> bool {
        let token = token.to_lowercase();
        self.dayparts.iter().any(|daypart| *daypart == token)
    }

    pub fn is_placeholder_date(&self, value: &str) -> bool {
        let value = crate::domain::slot::normalize_text(value);
        self.placeholder_dates.iter().any(|placeholder| *placeholder == value)
    }

    /// A daypart with no clock time after it, e.g. `afternoon` but not `afternoon 3`.
    pub fn is_vague_time(&self, value: &str) -> bool {
        let tokens: Vec<&str> = value.split_whitespace().collect();
        match tokens.split_first() {
            Some((first, rest)) => {
                self.is_daypart(first)
                    && !rest.iter().any(|token| token.chars().any(|ch| ch.is_ascii_digit()))
            }
            None => false,
        }
    }

    /// Longest relative-date phrase at the start of `tokens`; returns the
    /// number of tokens it spans.
    pub fn leading_relative_date(&self, tokens: &[&str]) -> Option<usize> {
        self.relative_dates
            .iter()
            .filter_map(|phrase| {
                let words: Vec<&str> = phrase.split_whitespace().collect();
                let matches = words.len() <= tokens.len()
                    && words.iter().zip(tokens).all(|(word, token)| token.to_lowercase() == *word);
                matches.then_some(words.len())
            })
            .max()
    }

    /// Leading time expression. Returns `(tokens consumed, kept text)`, where a
    /// daypart adjacent to a clock time wins: `afternoon 8 o'clock` keeps `afternoon`.
    pub fn leading_time(&self, tokens: &[&str]) -> Option<(usize, String)> {
        let first = tokens.first()?;
        if self.is_daypart(first) {
            let consumed = match leading_clock_time(&tokens[1..]) {
                Some(clock) => 1 + clock,
                None => 1,
            };
            return Some((consumed, first.to_string()));
        }

        let clock = leading_clock_time(tokens)?;
        if let Some(next) = tokens.get(clock) {
            if self.is_daypart(next) {
                return Some((clock + 1, next.to_string()));
            }
        }
        Some((clock, tokens[..clock].join(" ")))
    }
}

/// Number of tokens forming a clock time at the start of `tokens`:
/// `3pm`, `3:30pm`, `15:00`, `3 pm`, `8 o'clock`.
pub fn leading_clock_time(tokens: &[&str]) -> Option<usize> {
    let first = tokens.first()?.to_lowercase();
    if parse_clock_token(&first).is_some() {
        return Some(1);
    }
    if is_hour_number(&first) {
        let suffix = tokens.get(1).map(|token| token.to_lowercase());
        if matches!(suffix.as_deref(), Some("am" | "pm" | "a.m." | "p.m." | "o'clock" | "oclock")) {
            return Some(2);
        }
    }
    None
}

fn is_hour_number(token: &str) -> bool {
    token.parse::<u32>().map(|hour| hour <= 24).unwrap_or(false) && token.len() <= 2
}

/// Single-token clock times: `3pm`, `3:30pm`, `15:00`.
fn parse_clock_token(token: &str) -> Option<NaiveTime> {
    let token = token.trim().to_lowercase().replace('.', "");
    let (body, meridiem) = if let Some(body) = token.strip_suffix("am") {
        (body.to_string(), Some(false))
    } else if let Some(body) = token.strip_suffix("pm") {
        (body.to_string(), Some(true))
    } else {
        (token.clone(), None)
    };

    let (hour, minute) = match body.split_once(':') {
        Some((hour, minute)) if minute.len() == 2 => {
            (hour.parse::<u32>().ok()?, minute.parse::<u32>().ok()?)
        }
        Some(_) => return None,
        None if meridiem.is_some() && !body.is_empty() && body.len() <= 2 => {
            (body.parse::<u32>().ok()?, 0)
        }
        None => return None,
    };

    let hour = match meridiem {
        Some(_) if hour == 0 || hour > 12 => return None,
        Some(true) if hour < 12 => hour + 12,
        Some(false) if hour == 12 => 0,
        _ => hour,
    };
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Best-effort conversion of an informal clock time to `NaiveTime`.
/// Dayparts attached to a bare hour shift it: `afternoon 3` is 15:00.
pub fn parse_clock_time(value: &str, vocabulary: &TemporalVocabulary) -> Option<NaiveTime> {
    let tokens: Vec<&str> = value.split_whitespace().collect();
    if tokens.is_empty() {
        return None;
    }
    if let Ok(time) = NaiveTime::parse_from_str(value.trim(), TIME_FORMAT) {
        return Some(time);
    }

    let (daypart, clock_tokens) = if vocabulary.is_daypart(tokens[0]) {
        (Some(tokens[0].to_lowercase()), &tokens[1..])
    } else {
        (None, &tokens[..])
    };
    if clock_tokens.is_empty() {
        return None;
    }

    if let Some(time) = parse_clock_token(&clock_tokens.concat()) {
        return Some(time);
    }

    let first = clock_tokens[0].to_lowercase();
    if !is_hour_number(&first) {
        return None;
    }
    let hour = first.parse::<u32>().ok()?;
    let suffix = clock_tokens.get(1).map(|token| token.to_lowercase());
    let hour = match (suffix.as_deref(), daypart.as_deref()) {
        (Some("pm" | "p.m." | "am" | "a.m."), _) if hour == 0 || hour > 12 => return None,
        (Some("pm" | "p.m."), _) if hour < 12 => hour + 12,
        (Some("am" | "a.m."), _) if hour == 12 => 0,
        (_, Some("afternoon" | "evening" | "night" | "tonight")) if hour < 12 => hour + 12,
        _ => hour,
    };
    NaiveTime::from_hms_opt(hour, 0, 0)
}

/// Resolves a relative-date phrase against `today`. Weekday names mean the
/// next such day strictly after today; "next week" is the same weekday a
/// week out.
pub fn resolve_relative_date(value: &str, today: NaiveDate) -> Option<NaiveDate> {
    let normalized = crate::domain::slot::normalize_text(value);
    let phrase = normalized.strip_prefix("the ").unwrap_or(&normalized);
    match phrase {
        "today" | "tonight" => Some(today),
        "tomorrow" => today.succ_opt(),
        "day after tomorrow" => today.checked_add_signed(Duration::days(2)),
        "next week" => today.checked_add_signed(Duration::weeks(1)),
        "this weekend" => Some(next_weekday(today, Weekday::Sat)),
        other => {
            let name = other.strip_prefix("next ").unwrap_or(other);
            parse_weekday(name).map(|weekday| next_weekday(today, weekday))
        }
    }
}

fn next_weekday(today: NaiveDate, weekday: Weekday) -> NaiveDate {
    let current = today.weekday().num_days_from_monday() as i64;
    let target = weekday.num_days_from_monday() as i64;
    let mut ahead = (target - current).rem_euclid(7);
    if ahead == 0 {
        ahead = 7;
    }
    today + Duration::days(ahead)
}

fn parse_weekday(name: &str) -> Option<Weekday> {
    match name {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Clock suggestions for a daypart, used when asking to pin down a vague time.
pub fn daypart_suggestions(daypart: &str) -> Vec<String> {
    let slots: &[&str] = match daypart.to_lowercase().as_str() {
        "morning" => &["09:00", "10:00", "11:00"],
        "noon" => &["12:00", "12:30", "13:00"],
        "afternoon" => &["14:00", "15:00", "16:00"],
        "evening" | "tonight" => &["18:00", "19:00", "20:00"],
        "night" => &["20:00", "21:00", "22:00"],
        _ => &[],
    };
    slots.iter().map(|slot| slot.to_string()).collect()
}
