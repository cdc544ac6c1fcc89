use std::fmt;

use chrono::Weekday;
use serde::{Deserialize, Deserializer, Serializer};

const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Canonical lowercase full name ("monday").
pub fn canonical_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Display name ("Monday") used in serialized calendar plans.
pub fn display_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Parse one weekday token: full names and 3-letter abbreviations in any case,
/// plus the common "Tues"/"Weds"/"Thur"/"Thurs" spellings.
pub fn parse_weekday(token: &str) -> Option<Weekday> {
    let token = token
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '.')
        .to_lowercase();
    if token.is_empty() {
        return None;
    }
    match token.as_str() {
        "tues" => Some(Weekday::Tue),
        "weds" => Some(Weekday::Wed),
        "thur" | "thurs" => Some(Weekday::Thu),
        other => other.parse::<Weekday>().ok(),
    }
}

/// A client's preferred training weekdays, normalized once at the boundary.
///
/// Accepts a list of tokens, a comma-separated string ("Mon, Wed"), or a
/// brace/bracket-wrapped string ("{Mon,Wed,Fri}", `["Monday","Friday"]`).
/// Unknown tokens are ignored; duplicates collapse.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct WeekdayPreference {
    days: [bool; 7],
}

impl WeekdayPreference {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let inner = trimmed
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .or_else(|| {
                trimmed
                    .strip_prefix('[')
                    .and_then(|rest| rest.strip_suffix(']'))
            })
            .unwrap_or(trimmed);

        Self::from_tokens(
            inner
                .split(|c: char| c == ',' || c == ';' || c == '/' || c == '|' || c.is_whitespace())
                .filter(|token| !token.is_empty()),
        )
    }

    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut preference = Self::default();
        for token in tokens {
            let token = token.as_ref();
            match parse_weekday(token) {
                Some(day) => preference.insert(day),
                None if token.trim().is_empty() => {}
                None => tracing::debug!(token = token, "ignoring unrecognized weekday token"),
            }
        }
        preference
    }

    pub fn insert(&mut self, day: Weekday) {
        self.days[day.num_days_from_monday() as usize] = true;
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.days[day.num_days_from_monday() as usize]
    }

    pub fn len(&self) -> usize {
        self.days.iter().filter(|selected| **selected).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Selected weekdays in Monday-first order.
    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        WEEK.into_iter().filter(|day| self.contains(*day))
    }

    pub fn canonical_names(&self) -> Vec<&'static str> {
        self.iter().map(canonical_name).collect()
    }
}

impl fmt::Debug for WeekdayPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.canonical_names()).finish()
    }
}

impl From<&str> for WeekdayPreference {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<String> for WeekdayPreference {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<&[&str]> for WeekdayPreference {
    fn from(tokens: &[&str]) -> Self {
        Self::from_tokens(tokens)
    }
}

impl From<Vec<String>> for WeekdayPreference {
    fn from(tokens: Vec<String>) -> Self {
        Self::from_tokens(tokens)
    }
}

impl FromIterator<Weekday> for WeekdayPreference {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        let mut preference = Self::default();
        for day in iter {
            preference.insert(day);
        }
        preference
    }
}

/// Serde adapter writing weekdays as display names ("Monday").
pub mod serde_display_name {
    use super::*;

    pub fn serialize<S: Serializer>(day: &Weekday, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(display_name(*day))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Weekday, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_weekday(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown weekday '{raw}'")))
    }
}
