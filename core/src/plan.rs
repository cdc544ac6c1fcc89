use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate, Weekday};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::weekdays;

/// Focus label for a day synthesized from a flat list of exercises.
pub const DEFAULT_DAY_FOCUS: &str = "Workout";

static QUANTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+(?:\.\d+)?)\s*[_-]?\s*([A-Za-z]*)").expect("valid quantity regex")
});
static WHOLE_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+$").expect("valid whole number regex"));

/// Repetitions: either a plain count or free text ("8-10", "AMRAP", "30 sec").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reps {
    Count(u32),
    Text(String),
}

impl Default for Reps {
    fn default() -> Self {
        Reps::Count(0)
    }
}

/// One prescribed exercise. Every field is a scalar; the model's mixed tokens
/// are coerced on the way in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseSpec {
    pub exercise_name: String,
    pub category: String,
    pub body_part: String,
    /// Always at least 1
    pub sets: u32,
    pub reps: Reps,
    pub duration_minutes: u32,
    pub weights: String,
    pub equipment: String,
    pub coach_tip: String,
    pub rest_seconds: u32,
}

impl ExerciseSpec {
    /// Build from a parsed JSON object. Returns `None` when the value is not an
    /// object or carries no exercise name.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let exercise_name = text_field(obj, &["exercise_name", "name", "exercise"])
            .filter(|name| !name.is_empty())?;

        let sets = field(obj, &["sets"])
            .and_then(count_from)
            .unwrap_or(1)
            .max(1);
        let reps = field(obj, &["reps", "repetitions"])
            .and_then(reps_from)
            .unwrap_or_default();
        let duration_minutes = field(obj, &["duration_minutes", "duration", "duration_min"])
            .and_then(minutes_from)
            .unwrap_or(0);
        let rest_seconds = field(obj, &["rest_seconds", "rest", "rest_time"])
            .and_then(seconds_from)
            .unwrap_or(0);

        Some(Self {
            exercise_name,
            category: text_field(obj, &["category", "type"]).unwrap_or_default(),
            body_part: text_field(obj, &["body_part", "muscle_group", "muscles"])
                .unwrap_or_default(),
            sets,
            reps,
            duration_minutes,
            weights: text_field(obj, &["weights", "weight", "load"]).unwrap_or_default(),
            equipment: text_field(obj, &["equipment"]).unwrap_or_default(),
            coach_tip: text_field(obj, &["coach_tip", "tip", "notes"]).unwrap_or_default(),
            rest_seconds,
        })
    }
}

/// One abstract training day, not yet bound to a calendar date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutDayBlock {
    pub focus: String,
    pub exercises: Vec<ExerciseSpec>,
}

impl WorkoutDayBlock {
    pub fn new(focus: impl Into<String>, exercises: Vec<ExerciseSpec>) -> Self {
        Self {
            focus: focus.into(),
            exercises,
        }
    }

    /// Build from a parsed day object. Exercises without a name are skipped.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let focus = text_field(obj, &["focus", "title", "name"])
            .filter(|focus| !focus.is_empty())
            .unwrap_or_else(|| DEFAULT_DAY_FOCUS.to_string());
        let exercises = obj
            .get("exercises")
            .and_then(Value::as_array)
            .map(|items| exercises_from(items))
            .unwrap_or_default();
        Some(Self::new(focus, exercises))
    }
}

/// A complete plan as emitted by the model: ordered abstract days.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkoutPlan {
    pub days: Vec<WorkoutDayBlock>,
}

impl WorkoutPlan {
    /// Interpret a parsed response document.
    ///
    /// Accepts `{"days": [...]}`, the same wrapped in `workout_plan`/`plan`,
    /// or a bare `{"exercises": [...]}` which becomes a single day.
    pub fn from_document(document: &Value) -> Self {
        let Some(obj) = document.as_object() else {
            return Self::default();
        };

        if let Some(days) = obj.get("days").and_then(Value::as_array) {
            return Self {
                days: days.iter().filter_map(WorkoutDayBlock::from_value).collect(),
            };
        }

        for wrapper in ["workout_plan", "plan"] {
            if let Some(inner) = obj.get(wrapper).filter(|inner| inner.is_object()) {
                return Self::from_document(inner);
            }
        }

        if obj.get("exercises").is_some_and(Value::is_array) {
            return Self {
                days: WorkoutDayBlock::from_value(document).into_iter().collect(),
            };
        }

        Self::default()
    }
}

/// One date in the planning window, holding a workout or nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarDayPlan {
    pub date: NaiveDate,
    #[serde(with = "weekdays::serde_display_name")]
    pub day_name: Weekday,
    /// Always equal to `workout.is_some()`
    pub is_workout_day: bool,
    pub workout: Option<WorkoutDayBlock>,
}

impl CalendarDayPlan {
    pub fn new(date: NaiveDate, workout: Option<WorkoutDayBlock>) -> Self {
        Self {
            date,
            day_name: date.weekday(),
            is_workout_day: workout.is_some(),
            workout,
        }
    }

    pub fn rest(date: NaiveDate) -> Self {
        Self::new(date, None)
    }
}

/// One row per exercise, the shape the persistence layer inserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedExerciseRow {
    #[serde(flatten)]
    pub exercise: ExerciseSpec,
    /// Index of the calendar day in the 7-day window (0-6)
    pub day_index: usize,
    pub for_date: NaiveDate,
}

pub(crate) fn exercises_from(items: &[Value]) -> Vec<ExerciseSpec> {
    items
        .iter()
        .filter_map(|item| {
            let exercise = ExerciseSpec::from_value(item);
            if exercise.is_none() {
                tracing::debug!("skipping exercise entry without a name");
            }
            exercise
        })
        .collect()
}

fn field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| obj.get(*key))
        .find(|value| !value.is_null())
}

fn text_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    field(obj, keys).and_then(text_from)
}

fn text_from(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(text_from)
                .filter(|part| !part.is_empty())
                .collect();
            Some(parts.join(", "))
        }
        Value::Null | Value::Object(_) => None,
    }
}

/// Leading number plus optional unit: "30 min" -> (30.0, "min"), "50kg" -> (50.0, "kg").
fn parse_quantity(raw: &str) -> Option<(f64, String)> {
    let caps = QUANTITY_RE.captures(raw)?;
    let amount = caps.get(1)?.as_str().parse::<f64>().ok()?;
    let unit = caps
        .get(2)
        .map(|unit| unit.as_str().to_lowercase())
        .unwrap_or_default();
    Some((amount, unit))
}

fn number_from(value: &Value) -> Option<(f64, String)> {
    match value {
        Value::Number(number) => number.as_f64().map(|amount| (amount, String::new())),
        Value::String(text) => parse_quantity(text),
        _ => None,
    }
}

fn to_u32(amount: f64) -> Option<u32> {
    if !amount.is_finite() || amount < 0.0 {
        return None;
    }
    Some(amount.min(u32::MAX as f64) as u32)
}

fn count_from(value: &Value) -> Option<u32> {
    number_from(value).and_then(|(amount, _)| to_u32(amount.floor()))
}

fn reps_from(value: &Value) -> Option<Reps> {
    match value {
        Value::Number(number) => number
            .as_f64()
            .and_then(|amount| to_u32(amount.round()))
            .map(Reps::Count),
        Value::String(text) => {
            let text = text.trim();
            if WHOLE_NUMBER_RE.is_match(text) {
                text.parse().ok().map(Reps::Count)
            } else if text.is_empty() {
                None
            } else {
                Some(Reps::Text(text.to_string()))
            }
        }
        _ => None,
    }
}

fn minutes_from(value: &Value) -> Option<u32> {
    let (amount, unit) = number_from(value)?;
    let minutes = match unit.as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => amount / 60.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => amount * 60.0,
        _ => amount,
    };
    to_u32(minutes.ceil())
}

fn seconds_from(value: &Value) -> Option<u32> {
    let (amount, unit) = number_from(value)?;
    let seconds = match unit.as_str() {
        "m" | "min" | "mins" | "minute" | "minutes" => amount * 60.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => amount * 3600.0,
        _ => amount,
    };
    to_u32(seconds.round())
}
