//! The weekly working plan as JSON, in the shape the booking front end
//! stores it:
//!
//! ```json
//! {"monday": {"start": "09:00", "end": "17:00",
//!             "breaks": [{"start": "12:00", "end": "13:00"}]},
//!  "sunday": null}
//! ```
//!
//! A day may also hold an array of such objects for split shifts. Missing
//! days are closed.

use chrono::Weekday;
use serde::{Deserialize, Serialize};

use crate::engine::validate::validate_plan;
use crate::engine::EngineError;
use crate::limits::MAX_PLAN_JSON_LEN;
use crate::model::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClockRange {
    start: String,
    end: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Shift {
    start: String,
    end: String,
    #[serde(default)]
    breaks: Vec<ClockRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum DayEntry {
    Split(Vec<Shift>),
    Single(Shift),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanDocument {
    #[serde(default)]
    sunday: Option<DayEntry>,
    #[serde(default)]
    monday: Option<DayEntry>,
    #[serde(default)]
    tuesday: Option<DayEntry>,
    #[serde(default)]
    wednesday: Option<DayEntry>,
    #[serde(default)]
    thursday: Option<DayEntry>,
    #[serde(default)]
    friday: Option<DayEntry>,
    #[serde(default)]
    saturday: Option<DayEntry>,
}

impl PlanDocument {
    fn slots_mut(&mut self) -> [(Weekday, &mut Option<DayEntry>); 7] {
        [
            (Weekday::Sun, &mut self.sunday),
            (Weekday::Mon, &mut self.monday),
            (Weekday::Tue, &mut self.tuesday),
            (Weekday::Wed, &mut self.wednesday),
            (Weekday::Thu, &mut self.thursday),
            (Weekday::Fri, &mut self.friday),
            (Weekday::Sat, &mut self.saturday),
        ]
    }
}

fn clock(s: &str, weekday: Weekday) -> Result<Min, EngineError> {
    parse_clock(s).ok_or_else(|| {
        EngineError::Validation(format!("{weekday}: {s:?} is not a HH:MM time"))
    })
}

fn span(start: &str, end: &str, weekday: Weekday) -> Result<Span, EngineError> {
    // Ordering is checked by validate_plan so the message names the day.
    Ok(Span {
        start: clock(start, weekday)?,
        end: clock(end, weekday)?,
    })
}

/// Parse and validate a plan document.
pub fn from_json(json: &str) -> Result<WorkingPlan, EngineError> {
    if json.len() > MAX_PLAN_JSON_LEN {
        return Err(EngineError::LimitExceeded("working plan document too large"));
    }
    let mut doc: PlanDocument = serde_json::from_str(json)
        .map_err(|e| EngineError::Validation(format!("working plan: {e}")))?;

    let mut plan = WorkingPlan::default();
    for (weekday, entry) in doc.slots_mut() {
        let shifts = match entry.take() {
            None => continue,
            Some(DayEntry::Single(shift)) => vec![shift],
            Some(DayEntry::Split(shifts)) => shifts,
        };
        let mut day = WorkingPlanDay::default();
        for shift in shifts {
            day.work.push(span(&shift.start, &shift.end, weekday)?);
            for b in shift.breaks {
                day.breaks.push(span(&b.start, &b.end, weekday)?);
            }
        }
        day.work.sort_by_key(|s| s.start);
        day.breaks.sort_by_key(|s| s.start);
        plan.set_day(weekday, day);
    }

    validate_plan(&plan)?;
    Ok(plan)
}

/// Render a plan. Each break is attached to the shift that contains it.
pub fn to_json(plan: &WorkingPlan) -> String {
    let mut doc = PlanDocument::default();
    for (weekday, entry) in doc.slots_mut() {
        let day = plan.day(weekday);
        if day.is_closed() {
            continue;
        }
        let mut shifts: Vec<Shift> = day
            .work
            .iter()
            .map(|w| Shift {
                start: format_clock(w.start),
                end: format_clock(w.end),
                breaks: day
                    .breaks
                    .iter()
                    .filter(|b| w.contains_span(b))
                    .map(|b| ClockRange {
                        start: format_clock(b.start),
                        end: format_clock(b.end),
                    })
                    .collect(),
            })
            .collect();
        *entry = Some(if shifts.len() == 1 {
            DayEntry::Single(shifts.remove(0))
        } else {
            DayEntry::Split(shifts)
        });
    }
    // A struct of strings and vectors always serializes.
    serde_json::to_string(&doc).unwrap_or_else(|_| "{}".to_string())
}
