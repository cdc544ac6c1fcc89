use chrono::NaiveDate;
use serde::Serialize;

use crate::error::RecoveryError;
use crate::plan::{CalendarDayPlan, PlannedExerciseRow};
use crate::repair::{RepairOutcome, RepairStep, repair};
use crate::schedule::assign;
use crate::weekdays::WeekdayPreference;

/// Whether the whole response was usable or only fragments of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlanCompleteness {
    Full,
    Partial { diagnosis: String },
}

impl PlanCompleteness {
    pub fn is_full(&self) -> bool {
        matches!(self, PlanCompleteness::Full)
    }
}

/// A model response mapped onto the calendar, ready to persist.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveredPlan {
    pub completeness: PlanCompleteness,
    pub days: Vec<CalendarDayPlan>,
    /// One row per exercise, tagged with its calendar day
    pub exercises: Vec<PlannedExerciseRow>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub repairs: Vec<RepairStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

pub fn recover(
    raw: &str,
    preference: &WeekdayPreference,
    start: NaiveDate,
) -> Result<RecoveredPlan, RecoveryError> {
    recover_model_response(raw, None, preference, start)
}

/// Repair `raw`, schedule its days from `start` and flatten exercises into rows.
/// `model` is only echoed for logging and error reporting.
pub fn recover_model_response(
    raw: &str,
    model: Option<&str>,
    preference: &WeekdayPreference,
    start: NaiveDate,
) -> Result<RecoveredPlan, RecoveryError> {
    let (blocks, completeness, repairs) = match repair(raw) {
        RepairOutcome::Full { plan, repairs, .. } => (plan.days, PlanCompleteness::Full, repairs),
        RepairOutcome::Partial { days, diagnosis } => {
            tracing::warn!(
                model = model.unwrap_or("unknown"),
                days = days.len(),
                diagnosis = %diagnosis,
                "workout plan only partially recovered"
            );
            (days, PlanCompleteness::Partial { diagnosis }, Vec::new())
        }
        RepairOutcome::Failed { reason } => {
            tracing::warn!(
                model = model.unwrap_or("unknown"),
                reason = %reason,
                "workout plan response unrecoverable"
            );
            return Err(RecoveryError::Unrecoverable {
                reason,
                model: model.map(str::to_string),
            });
        }
    };

    let days = assign(&blocks, preference, start);
    let exercises = flatten(&days);
    tracing::debug!(
        blocks = blocks.len(),
        workout_days = days.iter().filter(|day| day.is_workout_day).count(),
        exercises = exercises.len(),
        "recovered workout plan"
    );

    Ok(RecoveredPlan {
        completeness,
        days,
        exercises,
        repairs,
        model: model.map(str::to_string),
    })
}

/// Persistence rows for every scheduled exercise, in calendar order.
pub fn flatten(days: &[CalendarDayPlan]) -> Vec<PlannedExerciseRow> {
    days.iter()
        .enumerate()
        .filter_map(|(day_index, day)| day.workout.as_ref().map(|w| (day_index, day.date, w)))
        .flat_map(|(day_index, for_date, workout)| {
            workout.exercises.iter().map(move |exercise| PlannedExerciseRow {
                exercise: exercise.clone(),
                day_index,
                for_date,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Weekday;

    use super::*;

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    #[test]
    fn fenced_response_with_unquoted_tip_recovers_one_day() {
        let raw = "Here is your plan:\n```json\n{\"days\":[{\"focus\":\"Push\",\"exercises\":[{\"exercise_name\":\"Bench Press\",\"sets\":4,\"reps\":8,\"duration\":15,\"weights\":\"barbell\",\"body_part\":\"Chest, Shoulders\",\"coach_tip\":tempo 3-1-3}]}]}\n```";
        let preference = WeekdayPreference::from(&["Monday"][..]);

        let plan = recover(raw, &preference, monday()).expect("plan should recover");

        assert!(plan.completeness.is_full());
        assert_eq!(plan.repairs, vec![RepairStep::UnquotedValues]);
        assert_eq!(plan.days.len(), 7);
        let workout_days: Vec<_> = plan.days.iter().filter(|d| d.is_workout_day).collect();
        assert_eq!(workout_days.len(), 1);
        assert_eq!(workout_days[0].date, monday());
        assert_eq!(workout_days[0].day_name, Weekday::Mon);

        let exercises = &workout_days[0].workout.as_ref().unwrap().exercises;
        assert_eq!(exercises.len(), 1);
        assert_eq!(exercises[0].exercise_name, "Bench Press");
        assert_eq!(exercises[0].coach_tip, "tempo 3-1-3");
        assert_eq!(exercises[0].body_part, "Chest, Shoulders");
        assert_eq!(exercises[0].duration_minutes, 15);

        assert_eq!(plan.exercises.len(), 1);
        assert_eq!(plan.exercises[0].day_index, 0);
        assert_eq!(plan.exercises[0].for_date, monday());
    }

    #[test]
    fn partial_recovery_is_visible() {
        let raw = r#"{"days":[{"focus":"Push","exercises":[{"exercise_name":"Bench Press"}]},{"focus":"Pull","exercises":[{"exercise_na"#;
        let preference = WeekdayPreference::parse("Mon,Wed");
        let plan = recover(raw, &preference, monday()).expect("partial plan is not an error");

        let PlanCompleteness::Partial { diagnosis } = &plan.completeness else {
            panic!("expected partial completeness");
        };
        assert!(diagnosis.contains("truncated"));
        assert_eq!(plan.exercises.len(), 1);
        assert_eq!(plan.exercises[0].exercise.exercise_name, "Bench Press");
    }

    #[test]
    fn rows_carry_their_calendar_day() {
        let raw = r#"{"days":[
            {"focus":"Upper","exercises":[{"exercise_name":"Press"},{"exercise_name":"Row"}]},
            {"focus":"Lower","exercises":[{"exercise_name":"Squat"}]}
        ]}"#;
        let preference = WeekdayPreference::parse("Tue, Sat");
        let plan = recover(raw, &preference, monday()).unwrap();

        let rows: Vec<(usize, &str)> = plan
            .exercises
            .iter()
            .map(|row| (row.day_index, row.exercise.exercise_name.as_str()))
            .collect();
        assert_eq!(rows, vec![(1, "Press"), (1, "Row"), (5, "Squat")]);
        assert_eq!(
            plan.exercises[2].for_date,
            NaiveDate::from_ymd_opt(2024, 1, 6).unwrap()
        );
    }

    #[test]
    fn unrecoverable_response_is_an_error_with_model() {
        let err = recover_model_response(
            "Sorry, I can't do that.",
            Some("coach-large"),
            &WeekdayPreference::parse("Mon"),
            monday(),
        )
        .unwrap_err();

        assert_eq!(
            err,
            RecoveryError::Unrecoverable {
                reason: crate::repair::NO_JSON_OBJECT.to_string(),
                model: Some("coach-large".to_string()),
            }
        );
    }

    #[test]
    fn serialized_row_is_flat() {
        let raw = r#"{"exercises":[{"exercise_name":"Plank","duration":"90 sec"}]}"#;
        let plan = recover(raw, &WeekdayPreference::parse("Mon"), monday()).unwrap();
        let row = serde_json::to_value(&plan.exercises[0]).unwrap();
        assert_eq!(row["exercise_name"], "Plank");
        assert_eq!(row["duration_minutes"], 2);
        assert_eq!(row["day_index"], 0);
        assert_eq!(row["for_date"], "2024-01-01");

        let body = serde_json::to_value(&plan).unwrap();
        assert_eq!(body["completeness"]["status"], "full");
    }
}
