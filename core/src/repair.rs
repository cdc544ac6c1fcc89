//! Recovery of workout plans from malformed model output.
//!
//! `repair` never fails hard: the outcome is a full plan, a partial plan
//! salvaged from fragments, or a diagnostic explaining why nothing was usable.
//! Textual fixes are applied as an ordered ladder of pure `&str -> String`
//! steps, re-parsing after each one.

use std::ops::Range;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::Value;

use crate::plan::{DEFAULT_DAY_FOCUS, WorkoutDayBlock, WorkoutPlan, exercises_from};

pub const NO_JSON_OBJECT: &str = "no JSON object found in response";

static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").expect("valid trailing comma regex"));
static UNIT_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)("?\b(?:reps|duration|duration_minutes|weights|weight|rest|rest_seconds)\b"?\s*:\s*)(\d+(?:\.\d+)?)[_\-\s]?([a-z]+)(\s*(?:[,}\]\r\n]|$))"#,
    )
    .expect("valid unit token regex")
});
static KEY_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([{,]\s*)("?)([A-Za-z_][A-Za-z0-9_]*)("?)(\s*:\s*)"#)
        .expect("valid key prefix regex")
});
static KEY_AHEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*"?[A-Za-z_][A-Za-z0-9_]*"?\s*:"#).expect("valid key lookahead regex")
});
static CLOSE_AHEAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[}\]]|$)").expect("valid close lookahead regex"));
static BARE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)(\s*:)").expect("valid bare key regex")
});
static DAYS_ARRAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""?days"?\s*:\s*\["#).expect("valid days array regex"));
static FOCUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""?focus"?\s*:\s*"([^"]*)""#).expect("valid focus regex"));
static FLAT_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^{}]*\}").expect("valid flat object regex"));

/// One textual fix in the repair ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStep {
    /// `[1, 2,]` -> `[1, 2]`
    TrailingCommas,
    /// `"duration": 30_min` -> `"duration": "30 min"` for numeric-ish fields
    UnitTokens,
    /// `"coach_tip": tempo 3-1-3` -> `"coach_tip": "tempo 3-1-3"`
    UnquotedValues,
    /// `"body_part": Chest, Triceps` -> `"body_part": "Chest, Triceps"`
    CommaJoinedValues,
    /// `{focus: "Push"}` -> `{"focus": "Push"}`
    BareKeys,
}

impl RepairStep {
    /// Ladder order. Cheap and frequent malformations first.
    pub const LADDER: [RepairStep; 5] = [
        RepairStep::TrailingCommas,
        RepairStep::UnitTokens,
        RepairStep::UnquotedValues,
        RepairStep::CommaJoinedValues,
        RepairStep::BareKeys,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RepairStep::TrailingCommas => "trailing_commas",
            RepairStep::UnitTokens => "unit_tokens",
            RepairStep::UnquotedValues => "unquoted_values",
            RepairStep::CommaJoinedValues => "comma_joined_values",
            RepairStep::BareKeys => "bare_keys",
        }
    }

    /// Apply this step. Idempotent: applying twice equals applying once.
    pub fn apply(self, text: &str) -> String {
        match self {
            RepairStep::TrailingCommas => remove_trailing_commas(text),
            RepairStep::UnitTokens => normalize_unit_tokens(text),
            RepairStep::UnquotedValues => quote_unquoted_values(text, false),
            RepairStep::CommaJoinedValues => quote_unquoted_values(text, true),
            RepairStep::BareKeys => quote_bare_keys(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RepairOutcome {
    /// The whole document parsed, possibly after ladder repairs.
    Full {
        plan: WorkoutPlan,
        document: Value,
        repairs: Vec<RepairStep>,
    },
    /// Only fragments could be recovered.
    Partial {
        days: Vec<WorkoutDayBlock>,
        diagnosis: String,
    },
    Failed {
        reason: String,
    },
}

impl RepairOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            RepairOutcome::Full { .. } => "full",
            RepairOutcome::Partial { .. } => "partial",
            RepairOutcome::Failed { .. } => "failed",
        }
    }

    pub fn days(&self) -> &[WorkoutDayBlock] {
        match self {
            RepairOutcome::Full { plan, .. } => &plan.days,
            RepairOutcome::Partial { days, .. } => days,
            RepairOutcome::Failed { .. } => &[],
        }
    }
}

/// Bracket and quote accounting outside string literals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StructureReport {
    pub open_braces: usize,
    pub close_braces: usize,
    pub open_brackets: usize,
    pub close_brackets: usize,
    pub quotes: usize,
}

impl StructureReport {
    pub fn scan(text: &str) -> Self {
        let mut report = Self::default();
        let mut in_string = false;
        let mut escaped = false;
        for c in text.chars() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    in_string = false;
                    report.quotes += 1;
                }
                continue;
            }
            match c {
                '"' => {
                    in_string = true;
                    report.quotes += 1;
                }
                '{' => report.open_braces += 1,
                '}' => report.close_braces += 1,
                '[' => report.open_brackets += 1,
                ']' => report.close_brackets += 1,
                _ => {}
            }
        }
        report
    }

    pub fn is_balanced(&self) -> bool {
        self.open_braces == self.close_braces && self.open_brackets == self.close_brackets
    }

    pub fn diagnosis(&self) -> Option<String> {
        if self.open_braces != self.close_braces {
            Some(format!(
                "unbalanced braces ({} '{{' vs {} '}}'): likely truncated mid-response",
                self.open_braces, self.close_braces
            ))
        } else if self.open_brackets != self.close_brackets {
            Some(format!(
                "unbalanced brackets ({} '[' vs {} ']'): likely truncated mid-response",
                self.open_brackets, self.close_brackets
            ))
        } else if self.quotes % 2 == 1 {
            Some("unterminated string literal: odd number of quotes".to_string())
        } else {
            None
        }
    }
}

/// Recover a workout plan from raw model output.
pub fn repair(raw: &str) -> RepairOutcome {
    let text = strip_code_fences(raw);
    if text.starts_with('[') {
        if let Ok((Value::Array(items), repairs)) = parse_with_ladder(text) {
            return full(wrap_top_level_array(items), repairs);
        }
    }
    let Some(candidate) = extract_json_object(text) else {
        return RepairOutcome::Failed {
            reason: NO_JSON_OBJECT.to_string(),
        };
    };

    let report = StructureReport::scan(candidate);
    if !report.is_balanced() {
        let diagnosis = report
            .diagnosis()
            .unwrap_or_else(|| "unbalanced structure: likely truncated mid-response".to_string());
        tracing::debug!(diagnosis = %diagnosis, "skipping repair ladder for truncated response");
        return salvage(candidate, diagnosis);
    }

    match parse_with_ladder(candidate) {
        Ok((document, repairs)) => full(document, repairs),
        Err(err) => salvage(candidate, format!("JSON could not be repaired: {err}")),
    }
}

fn full(document: Value, repairs: Vec<RepairStep>) -> RepairOutcome {
    if !repairs.is_empty() {
        let steps: Vec<&str> = repairs.iter().map(|step| step.as_str()).collect();
        tracing::debug!(repairs = ?steps, "repaired malformed plan JSON");
    }
    RepairOutcome::Full {
        plan: WorkoutPlan::from_document(&document),
        document,
        repairs,
    }
}

/// A bare array is a list of days when every element carries `exercises`,
/// otherwise a single day's exercise list.
fn wrap_top_level_array(items: Vec<Value>) -> Value {
    let is_days = !items.is_empty()
        && items
            .iter()
            .all(|item| item.get("exercises").is_some_and(Value::is_array));
    let field = if is_days { "days" } else { "exercises" };
    let mut wrapper = serde_json::Map::new();
    wrapper.insert(field.to_string(), Value::Array(items));
    Value::Object(wrapper)
}

/// Drop a leading ```` ```lang ```` line and a trailing ```` ``` ````.
pub fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        text = match rest.find('\n') {
            Some(newline) => &rest[newline + 1..],
            None => rest,
        };
    }
    if let Some(rest) = text.trim_end().strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

/// First `{` through the last `}`, or through the end when the object never closes.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    match text.rfind('}') {
        Some(end) if end > start => Some(&text[start..=end]),
        _ => Some(&text[start..]),
    }
}

fn parse_with_ladder(text: &str) -> Result<(Value, Vec<RepairStep>), serde_json::Error> {
    let mut last_error = match serde_json::from_str(text) {
        Ok(document) => return Ok((document, Vec::new())),
        Err(err) => err,
    };

    let mut current = text.to_string();
    let mut applied = Vec::new();
    for step in RepairStep::LADDER {
        let next = step.apply(&current);
        if next == current {
            continue;
        }
        tracing::debug!(step = step.as_str(), "applied repair step");
        applied.push(step);
        current = next;
        match serde_json::from_str(&current) {
            Ok(document) => return Ok((document, applied)),
            Err(err) => last_error = err,
        }
    }
    Err(last_error)
}

fn salvage(text: &str, diagnosis: String) -> RepairOutcome {
    let mut days = if DAYS_ARRAY.is_match(text) {
        salvage_days(text)
    } else {
        Vec::new()
    };
    if days.is_empty() {
        let exercises = exercises_from(&flat_objects(text));
        if !exercises.is_empty() {
            days.push(WorkoutDayBlock::new(DEFAULT_DAY_FOCUS, exercises));
        }
    }

    if days.is_empty() {
        return RepairOutcome::Failed { reason: diagnosis };
    }
    tracing::warn!(
        days = days.len(),
        diagnosis = %diagnosis,
        "recovered partial workout plan"
    );
    RepairOutcome::Partial { days, diagnosis }
}

fn salvage_days(text: &str) -> Vec<WorkoutDayBlock> {
    let Some(array) = DAYS_ARRAY.find(text) else {
        return Vec::new();
    };

    let mut days = Vec::new();
    for (chunk, complete) in top_level_objects(&text[array.end()..]) {
        let parsed = if complete {
            parse_with_ladder(chunk)
                .ok()
                .and_then(|(value, _)| WorkoutDayBlock::from_value(&value))
                .filter(|day| !day.exercises.is_empty())
        } else {
            None
        };
        if let Some(day) = parsed {
            days.push(day);
            continue;
        }

        let exercises = exercises_from(&flat_objects(chunk));
        if exercises.is_empty() {
            tracing::debug!(complete, "dropping day chunk with no recoverable exercises");
            continue;
        }
        let focus = FOCUS
            .captures(chunk)
            .and_then(|caps| caps.get(1))
            .map(|focus| focus.as_str().trim().to_string())
            .filter(|focus| !focus.is_empty())
            .unwrap_or_else(|| DEFAULT_DAY_FOCUS.to_string());
        days.push(WorkoutDayBlock::new(focus, exercises));
    }
    days
}

/// Split the contents of an array into its top-level objects. The final
/// object may be cut off; it is returned with `complete = false`.
fn top_level_objects(text: &str) -> Vec<(&str, bool)> {
    let mut chunks = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(begin) = start.take() {
                        chunks.push((&text[begin..=idx], true));
                    }
                }
            }
            ']' if depth == 0 => return chunks,
            _ => {}
        }
    }
    if let Some(begin) = start {
        chunks.push((&text[begin..], false));
    }
    chunks
}

/// Brace-free `{...}` objects that parse (after per-fragment repair) and
/// look like exercises rather than day wrappers.
fn flat_objects(text: &str) -> Vec<Value> {
    FLAT_OBJECT
        .find_iter(text)
        .filter_map(|fragment| parse_with_ladder(fragment.as_str()).ok())
        .map(|(value, _)| value)
        .filter(|value| value.get("exercises").is_none())
        .collect()
}

fn literal_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = None;
    let mut escaped = false;
    for (idx, c) in text.char_indices() {
        match start {
            Some(open) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    spans.push(open..idx + 1);
                    start = None;
                }
            }
            None if c == '"' => start = Some(idx),
            None => {}
        }
    }
    if let Some(open) = start {
        spans.push(open..text.len());
    }
    spans
}

fn inside_literal(spans: &[Range<usize>], pos: usize) -> bool {
    spans.iter().any(|span| span.contains(&pos))
}

/// Rewrite every match of `re` whose `anchor` group starts outside a string
/// literal.
fn rewrite_outside_literals<F>(text: &str, re: &Regex, anchor: usize, mut replace: F) -> String
where
    F: FnMut(&Captures<'_>) -> Option<String>,
{
    let spans = literal_spans(text);
    let mut out = String::with_capacity(text.len() + 16);
    let mut cursor = 0;
    for caps in re.captures_iter(text) {
        let (Some(whole), Some(anchored)) = (caps.get(0), caps.get(anchor)) else {
            continue;
        };
        if inside_literal(&spans, anchored.start()) {
            continue;
        }
        let Some(replacement) = replace(&caps) else {
            continue;
        };
        out.push_str(&text[cursor..whole.start()]);
        out.push_str(&replacement);
        cursor = whole.end();
    }
    out.push_str(&text[cursor..]);
    out
}

fn group<'t>(caps: &Captures<'t>, index: usize) -> &'t str {
    caps.get(index).map_or("", |m| m.as_str())
}

fn remove_trailing_commas(text: &str) -> String {
    rewrite_outside_literals(text, &TRAILING_COMMA, 0, |caps| Some(group(caps, 1).to_string()))
}

fn normalize_unit_tokens(text: &str) -> String {
    rewrite_outside_literals(text, &UNIT_TOKEN, 2, |caps| {
        Some(format!(
            "{}\"{} {}\"{}",
            group(caps, 1),
            group(caps, 2),
            group(caps, 3),
            group(caps, 4)
        ))
    })
}

fn quote_bare_keys(text: &str) -> String {
    rewrite_outside_literals(text, &BARE_KEY, 2, |caps| {
        Some(format!(
            "{}\"{}\"{}",
            group(caps, 1),
            group(caps, 2),
            group(caps, 3)
        ))
    })
}

/// Quote unquoted values that follow a key. With `comma_joined` unset only
/// values without embedded commas are touched; with it set only those with.
fn quote_unquoted_values(text: &str, comma_joined: bool) -> String {
    let spans = literal_spans(text);
    let mut out = String::with_capacity(text.len() + 16);
    let mut cursor = 0;

    for whole in KEY_PREFIX.find_iter(text) {
        if whole.start() < cursor || inside_literal(&spans, whole.start()) {
            continue;
        }
        let value_start = whole.end();
        let Some(value_end) = scan_unquoted_value(text, value_start) else {
            continue;
        };
        let value = text[value_start..value_end].trim_end();
        if value.is_empty() || is_json_scalar(value) || value.contains(',') != comma_joined {
            continue;
        }

        let normalized = if comma_joined {
            value
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(", ")
        } else {
            value.to_string()
        };
        out.push_str(&text[cursor..value_start]);
        out.push_str(&Value::String(normalized).to_string());
        cursor = value_start + value.len();
    }
    out.push_str(&text[cursor..]);
    out
}

/// End offset of a bare value starting at `start`, or `None` when the value
/// is quoted or structured.
fn scan_unquoted_value(text: &str, start: usize) -> Option<usize> {
    let rest = &text[start..];
    let first = rest.chars().next()?;
    if matches!(first, '"' | '{' | '[') {
        return None;
    }
    for (offset, c) in rest.char_indices() {
        match c {
            '\n' | '\r' | '}' | ']' | '"' => return Some(start + offset),
            ',' => {
                let after = &rest[offset + 1..];
                if KEY_AHEAD.is_match(after) || CLOSE_AHEAD.is_match(after) {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    Some(text.len())
}

fn is_json_scalar(value: &str) -> bool {
    matches!(value, "true" | "false" | "null")
        || serde_json::from_str::<serde_json::Number>(value).is_ok()
}
