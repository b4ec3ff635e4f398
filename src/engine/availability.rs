use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::model::*;

use super::validate::validate_slot_request;
use super::EngineError;

// ── Slot Algorithm ────────────────────────────────────────────────

/// Compute bookable slots for one provider on one date.
///
/// An override for `(provider_id, date)` replaces the weekday plan outright;
/// otherwise the day is open for the weekday's work intervals minus its
/// breaks. Bookings (widened by the buffers) are then subtracted and a
/// `service_duration` window is slid across each free interval in
/// `granularity` steps, starting at the free interval's start.
///
/// Pure: the caller supplies one consistent snapshot of plan, overrides and
/// bookings, already in the provider's timezone.
pub fn compute_slots(
    provider_id: Ulid,
    date: NaiveDate,
    service_duration: Min,
    working_plan: &WorkingPlan,
    overrides: &[DateSpecificOverride],
    booked: &[BookedInterval],
    config: &SlotConfig,
) -> Result<Vec<Slot>, EngineError> {
    validate_slot_request(service_duration, config)?;

    let open = effective_intervals(provider_id, date, working_plan, overrides);
    if open.is_empty() {
        return Ok(Vec::new());
    }

    let blocked = blocked_spans(
        provider_id,
        date,
        booked,
        config.buffer_before,
        config.buffer_after,
    );
    let free = if blocked.is_empty() {
        open
    } else {
        subtract_intervals(&open, &blocked)
    };

    Ok(slot_windows(&free, service_duration, config.granularity)
        .into_iter()
        .map(|w| Slot {
            start: at_minute(date, w.start),
            end: at_minute(date, w.end),
        })
        .collect())
}

/// Hours the provider is open on `date`, before bookings. Later entries in
/// `overrides` supersede earlier ones for the same key.
pub fn effective_intervals(
    provider_id: Ulid,
    date: NaiveDate,
    working_plan: &WorkingPlan,
    overrides: &[DateSpecificOverride],
) -> Vec<Span> {
    if let Some(entry) = overrides
        .iter()
        .rev()
        .find(|o| o.provider_id == provider_id && o.date == date)
    {
        return entry.span().into_iter().collect();
    }
    open_spans(working_plan.day(date.weekday()))
}

/// A weekday's work intervals minus its breaks, sorted and disjoint.
pub fn open_spans(day: &WorkingPlanDay) -> Vec<Span> {
    let mut work = day.work.clone();
    work.sort_by_key(|s| s.start);
    let work = merge_overlapping(&work);

    let mut breaks = day.breaks.clone();
    breaks.sort_by_key(|s| s.start);
    if breaks.is_empty() {
        return work;
    }
    subtract_intervals(&work, &merge_overlapping(&breaks))
}

/// The provider's bookings as minutes relative to `date`, widened by the
/// buffers, sorted and merged.
pub fn blocked_spans(
    provider_id: Ulid,
    date: NaiveDate,
    booked: &[BookedInterval],
    buffer_before: Min,
    buffer_after: Min,
) -> Vec<Span> {
    let mut spans: Vec<Span> = booked
        .iter()
        .filter(|b| b.provider_id == provider_id)
        .filter_map(|b| b.span_on(date))
        .map(|s| s.expand(buffer_before, buffer_after))
        .collect();
    spans.sort_by_key(|s| s.start);
    merge_overlapping(&spans)
}

/// Fixed-step windows of `duration` fully inside each free span.
pub fn slot_windows(free: &[Span], duration: Min, granularity: Min) -> Vec<Span> {
    debug_assert!(duration > 0 && granularity > 0);
    let mut windows = Vec::new();
    for span in free {
        let mut start = span.start;
        while start + duration <= span.end {
            windows.push(Span::new(start, start + duration));
            start += granularity;
        }
    }
    windows
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted by start, `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Span::new(current_start, b.end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDateTime, Weekday};

    use super::*;

    const H: Min = 60;

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn dt(s: &str) -> NaiveDateTime {
        parse_datetime(s).unwrap()
    }

    fn booking(provider_id: Ulid, start: &str, end: &str) -> BookedInterval {
        BookedInterval {
            appointment_id: Ulid::new(),
            provider_id,
            start: dt(start),
            end: dt(end),
        }
    }

    fn hourly() -> SlotConfig {
        SlotConfig {
            granularity: 60,
            ..SlotConfig::default()
        }
    }

    fn monday_nine_to_five() -> WorkingPlan {
        WorkingPlan::default().with_day(Weekday::Mon, WorkingPlanDay::open(9 * H, 17 * H))
    }

    fn starts(slots: &[Slot]) -> Vec<String> {
        slots.iter().map(|s| s.start.format("%H:%M").to_string()).collect()
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let result = subtract_intervals(&base, &[Span::new(200, 300)]);
        assert_eq!(result, base);
    }

    #[test]
    fn subtract_full_overlap() {
        let result = subtract_intervals(&[Span::new(100, 200)], &[Span::new(50, 250)]);
        assert!(result.is_empty());
    }

    #[test]
    fn subtract_partial_edges() {
        assert_eq!(
            subtract_intervals(&[Span::new(100, 200)], &[Span::new(50, 150)]),
            vec![Span::new(150, 200)]
        );
        assert_eq!(
            subtract_intervals(&[Span::new(100, 200)], &[Span::new(150, 250)]),
            vec![Span::new(100, 150)]
        );
    }

    #[test]
    fn subtract_multiple_punches() {
        let remove = vec![Span::new(100, 200), Span::new(400, 500), Span::new(800, 900)];
        assert_eq!(
            subtract_intervals(&[Span::new(0, 1000)], &remove),
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    #[test]
    fn subtract_one_removal_spanning_two_bases() {
        let base = vec![Span::new(0, 100), Span::new(200, 300)];
        assert_eq!(
            subtract_intervals(&base, &[Span::new(50, 250)]),
            vec![Span::new(0, 50), Span::new(250, 300)]
        );
    }

    #[test]
    fn merge_overlapping_and_adjacent() {
        let spans = vec![
            Span::new(100, 300),
            Span::new(200, 400),
            Span::new(400, 450),
            Span::new(500, 600),
        ];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(100, 450), Span::new(500, 600)]
        );
    }

    // ── effective hours ───────────────────────────────────

    #[test]
    fn breaks_split_work_hours() {
        let day = WorkingPlanDay::open(9 * H, 17 * H)
            .with_break(12 * H, 13 * H)
            .with_break(15 * H, 15 * H + 15);
        assert_eq!(
            open_spans(&day),
            vec![
                Span::new(9 * H, 12 * H),
                Span::new(13 * H, 15 * H),
                Span::new(15 * H + 15, 17 * H),
            ]
        );
    }

    #[test]
    fn split_shift_without_breaks() {
        let day = WorkingPlanDay {
            work: vec![Span::new(14 * H, 18 * H), Span::new(8 * H, 12 * H)],
            breaks: vec![],
        };
        assert_eq!(
            open_spans(&day),
            vec![Span::new(8 * H, 12 * H), Span::new(14 * H, 18 * H)]
        );
    }

    #[test]
    fn override_replaces_weekday_plan() {
        let pid = Ulid::new();
        let monday = date("2024-03-04");
        let plan = WorkingPlan::default().with_day(
            Weekday::Mon,
            WorkingPlanDay::open(9 * H, 17 * H).with_break(10 * H, 11 * H),
        );
        let overrides = vec![DateSpecificOverride {
            provider_id: pid,
            date: monday,
            start: 10 * H,
            end: 12 * H,
        }];
        // The plan's 10-11 break has no influence on the override day.
        assert_eq!(
            effective_intervals(pid, monday, &plan, &overrides),
            vec![Span::new(10 * H, 12 * H)]
        );
    }

    #[test]
    fn override_for_other_provider_or_date_is_ignored() {
        let pid = Ulid::new();
        let monday = date("2024-03-04");
        let overrides = vec![
            DateSpecificOverride { provider_id: Ulid::new(), date: monday, start: 0, end: 60 },
            DateSpecificOverride { provider_id: pid, date: date("2024-03-11"), start: 0, end: 60 },
        ];
        assert_eq!(
            effective_intervals(pid, monday, &monday_nine_to_five(), &overrides),
            vec![Span::new(9 * H, 17 * H)]
        );
    }

    #[test]
    fn later_override_wins() {
        let pid = Ulid::new();
        let monday = date("2024-03-04");
        let overrides = vec![
            DateSpecificOverride { provider_id: pid, date: monday, start: 8 * H, end: 9 * H },
            DateSpecificOverride { provider_id: pid, date: monday, start: 13 * H, end: 14 * H },
        ];
        assert_eq!(
            effective_intervals(pid, monday, &WorkingPlan::default(), &overrides),
            vec![Span::new(13 * H, 14 * H)]
        );
    }

    #[test]
    fn zero_length_override_closes_the_day() {
        let pid = Ulid::new();
        let monday = date("2024-03-04");
        let overrides = vec![DateSpecificOverride {
            provider_id: pid,
            date: monday,
            start: 10 * H,
            end: 10 * H,
        }];
        assert!(effective_intervals(pid, monday, &monday_nine_to_five(), &overrides).is_empty());
    }

    #[test]
    fn buffers_widen_and_merge_bookings() {
        let pid = Ulid::new();
        let d = date("2024-03-04");
        let booked = vec![
            booking(pid, "2024-03-04 10:00", "2024-03-04 11:00"),
            booking(pid, "2024-03-04 11:20", "2024-03-04 12:00"),
            booking(Ulid::new(), "2024-03-04 15:00", "2024-03-04 16:00"),
        ];
        assert_eq!(
            blocked_spans(pid, d, &booked, 5, 10),
            vec![Span::new(10 * H - 5, 12 * H + 10)]
        );
    }

    // ── slot windows ──────────────────────────────────────

    #[test]
    fn slot_count_matches_formula() {
        for len in [30, 45, 60, 95, 480] {
            for duration in [15, 30, 45, 60] {
                for granularity in [5, 15, 30, 60] {
                    if duration > len {
                        continue;
                    }
                    let windows = slot_windows(&[Span::new(600, 600 + len)], duration, granularity);
                    let expected = (len - duration) / granularity + 1;
                    assert_eq!(
                        windows.len() as Min,
                        expected,
                        "len={len} duration={duration} granularity={granularity}"
                    );
                }
            }
        }
    }

    #[test]
    fn duration_longer_than_free_span_yields_nothing() {
        assert!(slot_windows(&[Span::new(0, 30)], 45, 15).is_empty());
    }

    #[test]
    fn windows_do_not_overlap_when_duration_at_least_granularity() {
        let windows = slot_windows(&[Span::new(0, 300), Span::new(400, 700)], 45, 30);
        for pair in windows.windows(2) {
            assert!(pair[0].start < pair[1].start);
        }
        let windows = slot_windows(&[Span::new(0, 300)], 30, 30);
        for pair in windows.windows(2) {
            assert!(!pair[0].overlaps(&pair[1]));
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    // ── compute_slots scenarios ───────────────────────────

    #[test]
    fn monday_with_lunch_booking() {
        let pid = Ulid::new();
        let booked = vec![booking(pid, "2024-03-04 12:00", "2024-03-04 13:00")];
        let slots = compute_slots(
            pid,
            date("2024-03-04"),
            60,
            &monday_nine_to_five(),
            &[],
            &booked,
            &hourly(),
        )
        .unwrap();
        assert_eq!(
            starts(&slots),
            vec!["09:00", "10:00", "11:00", "13:00", "14:00", "15:00", "16:00"]
        );
        assert!(slots.iter().all(|s| (s.end - s.start).num_minutes() == 60));
    }

    #[test]
    fn override_with_out_of_range_booking() {
        let pid = Ulid::new();
        let monday = date("2024-03-04");
        let overrides = vec![DateSpecificOverride {
            provider_id: pid,
            date: monday,
            start: 10 * H,
            end: 12 * H,
        }];
        let booked = vec![booking(pid, "2024-03-04 12:00", "2024-03-04 13:00")];
        let slots = compute_slots(
            pid,
            monday,
            60,
            &monday_nine_to_five(),
            &overrides,
            &booked,
            &hourly(),
        )
        .unwrap();
        assert_eq!(starts(&slots), vec!["10:00", "11:00"]);
    }

    #[test]
    fn zero_duration_is_invalid_argument() {
        let plan = monday_nine_to_five();
        let result = compute_slots(Ulid::new(), date("2024-03-04"), 0, &plan, &[], &[], &hourly());
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn negative_buffer_is_invalid_argument() {
        let config = SlotConfig { buffer_after: -5, ..SlotConfig::default() };
        let plan = monday_nine_to_five();
        let result = compute_slots(Ulid::new(), date("2024-03-04"), 30, &plan, &[], &[], &config);
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn granularity_beyond_one_day_is_invalid_argument() {
        let plan = monday_nine_to_five();
        let monday = date("2024-03-04");
        for granularity in [MINUTES_PER_DAY + 1, Min::MAX] {
            let config = SlotConfig { granularity, ..SlotConfig::default() };
            let result = compute_slots(Ulid::new(), monday, 60, &plan, &[], &[], &config);
            assert!(matches!(result, Err(EngineError::InvalidArgument(_))), "{granularity}");
        }
    }

    #[test]
    fn one_day_granularity_gives_one_slot_per_free_span() {
        let config = SlotConfig { granularity: MINUTES_PER_DAY, ..SlotConfig::default() };
        let plan = monday_nine_to_five();
        let slots = compute_slots(Ulid::new(), date("2024-03-04"), 60, &plan, &[], &[], &config)
            .unwrap();
        assert_eq!(starts(&slots), vec!["09:00"]);
    }

    #[test]
    fn huge_buffer_is_invalid_argument() {
        let config = SlotConfig { buffer_before: Min::MAX, ..SlotConfig::default() };
        let plan = monday_nine_to_five();
        let result = compute_slots(Ulid::new(), date("2024-03-04"), 30, &plan, &[], &[], &config);
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn closed_day_is_empty_not_error() {
        // 2024-03-05 is a Tuesday.
        let plan = monday_nine_to_five();
        let tuesday = date("2024-03-05");
        let slots = compute_slots(Ulid::new(), tuesday, 30, &plan, &[], &[], &hourly()).unwrap();
        assert!(slots.is_empty());
    }

    #[test]
    fn fully_booked_day_is_empty() {
        let pid = Ulid::new();
        let booked = vec![booking(pid, "2024-03-04 08:00", "2024-03-04 18:00")];
        let plan = monday_nine_to_five();
        let slots = compute_slots(pid, date("2024-03-04"), 30, &plan, &[], &booked, &hourly())
            .unwrap();
        assert!(slots.is_empty());
    }

    #[test]
    fn buffers_push_slots_away_from_bookings() {
        let pid = Ulid::new();
        let booked = vec![booking(pid, "2024-03-04 12:00", "2024-03-04 13:00")];
        let config = SlotConfig { granularity: 30, buffer_before: 15, buffer_after: 15 };
        let plan = monday_nine_to_five();
        let slots = compute_slots(pid, date("2024-03-04"), 60, &plan, &[], &booked, &config)
            .unwrap();
        let s = starts(&slots);
        // Last morning slot must end by 11:45; first afternoon slot starts at 13:15.
        assert_eq!(s.first().map(String::as_str), Some("09:00"));
        assert!(s.contains(&"10:30".to_string()));
        assert!(!s.contains(&"11:00".to_string()));
        assert_eq!(
            s.iter().find(|t| t.as_str() > "12:00").map(String::as_str),
            Some("13:15")
        );
    }

    #[test]
    fn overnight_booking_from_previous_day_blocks_morning() {
        let pid = Ulid::new();
        let plan = WorkingPlan::default().with_day(Weekday::Mon, WorkingPlanDay::open(0, 4 * H));
        let booked = vec![booking(pid, "2024-03-03 22:00", "2024-03-04 02:00")];
        let slots = compute_slots(pid, date("2024-03-04"), 60, &plan, &[], &booked, &hourly())
            .unwrap();
        assert_eq!(starts(&slots), vec!["02:00", "03:00"]);
    }

    #[test]
    fn slots_stay_inside_hours_and_outside_bookings() {
        let pid = Ulid::new();
        let d = date("2024-03-04");
        let plan = WorkingPlan::default().with_day(
            Weekday::Mon,
            WorkingPlanDay::open(8 * H, 18 * H).with_break(12 * H, 12 * H + 45),
        );
        let booked = vec![
            booking(pid, "2024-03-04 09:10", "2024-03-04 09:50"),
            booking(pid, "2024-03-04 15:00", "2024-03-04 16:30"),
        ];
        let config = SlotConfig { granularity: 15, buffer_before: 10, buffer_after: 5 };
        let slots = compute_slots(pid, d, 45, &plan, &[], &booked, &config).unwrap();
        assert!(!slots.is_empty());

        let open = open_spans(plan.day(Weekday::Mon));
        let blocked = blocked_spans(pid, d, &booked, 10, 5);
        for slot in &slots {
            let span = Span::new(minutes_floor(d, slot.start), minutes_floor(d, slot.end));
            assert!(open.iter().any(|o| o.contains_span(&span)), "{span:?} outside hours");
            assert!(blocked.iter().all(|b| !b.overlaps(&span)), "{span:?} hits a booking");
        }
        for pair in slots.windows(2) {
            assert!(pair[0].start < pair[1].start);
        }
    }

    #[test]
    fn identical_inputs_give_identical_output() {
        let pid = Ulid::new();
        let d = date("2024-03-04");
        let plan = monday_nine_to_five();
        let booked = vec![booking(pid, "2024-03-04 12:00", "2024-03-04 13:00")];
        let config = SlotConfig::default();
        let a = compute_slots(pid, d, 30, &plan, &[], &booked, &config).unwrap();
        let b = compute_slots(pid, d, 30, &plan, &[], &booked, &config).unwrap();
        assert_eq!(a, b);
    }
}
