use chrono::{Datelike, NaiveDate};

use crate::plan::{CalendarDayPlan, WorkoutDayBlock};
use crate::weekdays::WeekdayPreference;

/// Length of one planning window.
pub const PLANNING_WINDOW_DAYS: usize = 7;

/// Place workout blocks onto the client's preferred weekdays.
///
/// Returns exactly seven consecutive days starting at `start`. Blocks are
/// assigned positionally to preferred days in calendar order; surplus blocks
/// are dropped and unfilled preferred days stay rest days.
pub fn assign(
    blocks: &[WorkoutDayBlock],
    preference: &WeekdayPreference,
    start: NaiveDate,
) -> Vec<CalendarDayPlan> {
    let mut remaining = blocks.iter();
    let days: Vec<CalendarDayPlan> = start
        .iter_days()
        .take(PLANNING_WINDOW_DAYS)
        .map(|date| {
            let workout = if preference.contains(date.weekday()) {
                remaining.next().cloned()
            } else {
                None
            };
            CalendarDayPlan::new(date, workout)
        })
        .collect();

    let dropped = remaining.count();
    if dropped > 0 {
        tracing::debug!(
            dropped,
            blocks = blocks.len(),
            preferred_days = preference.len(),
            "workout blocks exceed preferred training days"
        );
    }
    days
}
