use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Whole minutes, the only time unit inside the engine.
///
/// Clock values are minutes after local midnight; datetimes are converted to
/// minutes relative to midnight of the day being queried.
pub type Min = i64;

pub const MINUTES_PER_DAY: Min = 24 * 60;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Min,
    pub end: Min,
}

impl Span {
    pub fn new(start: Min, end: Min) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` when the range is empty or inverted.
    pub fn checked(start: Min, end: Min) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration(&self) -> Min {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Min) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Widen by `before` on the left and `after` on the right.
    pub fn expand(&self, before: Min, after: Min) -> Span {
        Span::new(self.start - before, self.end + after)
    }
}

// ── Clock and calendar helpers ───────────────────────────────────

/// Parse `HH:MM` (or `HH:MM:00`) into minutes after midnight. `24:00` is
/// accepted as end-of-day.
pub fn parse_clock(s: &str) -> Option<Min> {
    let mut parts = s.trim().split(':');
    let hours: Min = parts.next()?.parse().ok()?;
    let minutes: Min = parts.next()?.parse().ok()?;
    if let Some(seconds) = parts.next()
        && seconds.parse::<u32>().ok()? != 0
    {
        return None;
    }
    if parts.next().is_some() || hours < 0 || !(0..60).contains(&minutes) {
        return None;
    }
    let total = hours * 60 + minutes;
    (total <= MINUTES_PER_DAY).then_some(total)
}

pub fn format_clock(m: Min) -> String {
    format!("{:02}:{:02}", m.div_euclid(60), m.rem_euclid(60))
}

/// Weekday index with Sunday = 0, matching the browser convention the
/// admin pages use.
pub fn weekday_index(weekday: Weekday) -> usize {
    weekday.num_days_from_sunday() as usize
}

pub fn weekday_from_index(index: usize) -> Option<Weekday> {
    const DAYS: [Weekday; 7] = [
        Weekday::Sun,
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
    ];
    DAYS.get(index).copied()
}

pub fn day_start(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

/// Minutes from midnight of `date` to `at`, rounded down.
pub fn minutes_floor(date: NaiveDate, at: NaiveDateTime) -> Min {
    (at - day_start(date)).num_seconds().div_euclid(60)
}

/// Minutes from midnight of `date` to `at`, rounded up.
pub fn minutes_ceil(date: NaiveDate, at: NaiveDateTime) -> Min {
    -(-(at - day_start(date)).num_seconds()).div_euclid(60)
}

pub fn at_minute(date: NaiveDate, m: Min) -> NaiveDateTime {
    day_start(date) + Duration::minutes(m)
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Accepts `YYYY-MM-DD HH:MM`, an optional `T` separator and optional seconds.
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%dT%H:%M:%S",
    ];
    let s = s.trim();
    FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
}

pub fn format_datetime(dt: &NaiveDateTime) -> String {
    dt.format("%Y-%m-%d %H:%M").to_string()
}

// ── Working plan ─────────────────────────────────────────────────

/// One weekday of the recurring plan. No work intervals means closed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingPlanDay {
    pub work: Vec<Span>,
    pub breaks: Vec<Span>,
}

impl WorkingPlanDay {
    pub fn open(start: Min, end: Min) -> Self {
        Self {
            work: vec![Span::new(start, end)],
            breaks: Vec::new(),
        }
    }

    pub fn with_break(mut self, start: Min, end: Min) -> Self {
        self.breaks.push(Span::new(start, end));
        self
    }

    pub fn is_closed(&self) -> bool {
        self.work.is_empty()
    }
}

/// Recurring weekly plan, indexed by [`weekday_index`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingPlan {
    pub days: [WorkingPlanDay; 7],
}

impl WorkingPlan {
    pub fn day(&self, weekday: Weekday) -> &WorkingPlanDay {
        &self.days[weekday_index(weekday)]
    }

    pub fn set_day(&mut self, weekday: Weekday, day: WorkingPlanDay) {
        self.days[weekday_index(weekday)] = day;
    }

    pub fn with_day(mut self, weekday: Weekday, day: WorkingPlanDay) -> Self {
        self.set_day(weekday, day);
        self
    }
}

// ── Overrides, appointments, slots ───────────────────────────────

/// Replaces the weekday plan for one calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateSpecificOverride {
    pub provider_id: Ulid,
    pub date: NaiveDate,
    pub start: Min,
    pub end: Min,
}

impl DateSpecificOverride {
    pub fn span(&self) -> Option<Span> {
        Span::checked(self.start, self.end)
    }
}

/// An existing appointment: `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookedInterval {
    pub appointment_id: Ulid,
    pub provider_id: Ulid,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl BookedInterval {
    /// Minutes relative to midnight of `date`. The start is floored and the
    /// end ceiled so a sub-minute booking never shrinks.
    pub fn span_on(&self, date: NaiveDate) -> Option<Span> {
        Span::checked(minutes_floor(date, self.start), minutes_ceil(date, self.end))
    }

    pub fn overlaps(&self, other: &BookedInterval) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Slot {
    pub fn date(&self) -> NaiveDate {
        self.start.date()
    }
}

/// Slot generation knobs, all in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub granularity: Min,
    pub buffer_before: Min,
    pub buffer_after: Min,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            granularity: 15,
            buffer_before: 0,
            buffer_after: 0,
        }
    }
}

// ── Provider state ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProviderState {
    pub id: Ulid,
    pub name: Option<String>,
    pub working_plan: WorkingPlan,
    /// At most one override per date; the map keeps them date-ordered.
    pub overrides: BTreeMap<NaiveDate, DateSpecificOverride>,
    /// Sorted by `start`.
    pub appointments: Vec<BookedInterval>,
}

impl ProviderState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            working_plan: WorkingPlan::default(),
            overrides: BTreeMap::new(),
            appointments: Vec::new(),
        }
    }

    pub fn override_for(&self, date: NaiveDate) -> Option<&DateSpecificOverride> {
        self.overrides.get(&date)
    }

    /// Insert appointment maintaining sort order by start.
    pub fn insert_appointment(&mut self, appointment: BookedInterval) {
        let pos = self
            .appointments
            .partition_point(|a| a.start <= appointment.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<BookedInterval> {
        let pos = self.appointments.iter().position(|a| a.appointment_id == id)?;
        Some(self.appointments.remove(pos))
    }

    /// Appointments overlapping `[from, to)`. Binary search skips everything
    /// starting at or after `to`.
    pub fn appointments_overlapping(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> impl Iterator<Item = &BookedInterval> {
        let right_bound = self.appointments.partition_point(|a| a.start < to);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.end > from)
    }
}

/// Flat event records. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProviderCreated {
        id: Ulid,
        name: Option<String>,
    },
    ProviderDeleted {
        id: Ulid,
    },
    WorkingPlanSet {
        provider_id: Ulid,
        plan: WorkingPlan,
    },
    OverrideUpserted {
        entry: DateSpecificOverride,
    },
    OverrideRemoved {
        provider_id: Ulid,
        date: NaiveDate,
    },
    /// Drop the override on `from` and store `entry` in one record.
    OverrideMoved {
        from: NaiveDate,
        entry: DateSpecificOverride,
    },
    AppointmentBooked {
        appointment: BookedInterval,
    },
    AppointmentCancelled {
        id: Ulid,
        provider_id: Ulid,
    },
}

impl Event {
    pub fn provider_id(&self) -> Ulid {
        match self {
            Event::ProviderCreated { id, .. } | Event::ProviderDeleted { id } => *id,
            Event::WorkingPlanSet { provider_id, .. }
            | Event::OverrideRemoved { provider_id, .. }
            | Event::AppointmentCancelled { provider_id, .. } => *provider_id,
            Event::OverrideUpserted { entry } | Event::OverrideMoved { entry, .. } => {
                entry.provider_id
            }
            Event::AppointmentBooked { appointment } => appointment.provider_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub override_count: usize,
    pub appointment_count: usize,
}
