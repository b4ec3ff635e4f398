use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// A clock range must be non-empty and lie within one day.
pub(crate) fn validate_clock_range(start: Min, end: Min, what: &str) -> Result<(), EngineError> {
    if start >= end {
        return Err(EngineError::Validation(format!(
            "{what}: start {} must be before end {}",
            format_clock(start),
            format_clock(end)
        )));
    }
    if start < 0 || end > MINUTES_PER_DAY {
        return Err(EngineError::Validation(format!(
            "{what}: {}-{} is outside 00:00-24:00",
            format_clock(start),
            format_clock(end)
        )));
    }
    Ok(())
}

pub(crate) fn validate_override(entry: &DateSpecificOverride) -> Result<(), EngineError> {
    validate_clock_range(entry.start, entry.end, &format!("override for {}", entry.date))
}

/// Every interval valid, work intervals disjoint, breaks disjoint and each
/// break inside one work interval.
pub(crate) fn validate_plan(plan: &WorkingPlan) -> Result<(), EngineError> {
    for (index, day) in plan.days.iter().enumerate() {
        let weekday =
            weekday_from_index(index).map_or_else(|| index.to_string(), |w| w.to_string());
        if day.work.len() > MAX_INTERVALS_PER_DAY || day.breaks.len() > MAX_INTERVALS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many intervals in one day"));
        }
        for span in &day.work {
            validate_clock_range(span.start, span.end, &format!("{weekday} work hours"))?;
        }
        for span in &day.breaks {
            validate_clock_range(span.start, span.end, &format!("{weekday} break"))?;
        }
        if has_overlap(&day.work) {
            return Err(EngineError::Validation(format!(
                "{weekday}: work intervals overlap"
            )));
        }
        if has_overlap(&day.breaks) {
            return Err(EngineError::Validation(format!("{weekday}: breaks overlap")));
        }
        if let Some(stray) = day
            .breaks
            .iter()
            .find(|b| !day.work.iter().any(|w| w.contains_span(b)))
        {
            return Err(EngineError::Validation(format!(
                "{weekday}: break {}-{} is outside working hours",
                format_clock(stray.start),
                format_clock(stray.end)
            )));
        }
    }
    Ok(())
}

fn has_overlap(spans: &[Span]) -> bool {
    let mut sorted = spans.to_vec();
    sorted.sort_by_key(|s| s.start);
    sorted.windows(2).any(|w| w[0].end > w[1].start)
}

pub(crate) fn validate_appointment(appointment: &BookedInterval) -> Result<(), EngineError> {
    if appointment.start >= appointment.end {
        return Err(EngineError::Validation(format!(
            "appointment {}: start {} must be before end {}",
            appointment.appointment_id,
            format_datetime(&appointment.start),
            format_datetime(&appointment.end)
        )));
    }
    if (appointment.end - appointment.start).num_minutes() > MAX_APPOINTMENT_MINUTES {
        return Err(EngineError::LimitExceeded("appointment too long"));
    }
    Ok(())
}

pub(crate) fn validate_slot_request(
    service_duration: Min,
    config: &SlotConfig,
) -> Result<(), EngineError> {
    if service_duration <= 0 {
        return Err(EngineError::InvalidArgument(format!(
            "service duration must be positive, got {service_duration}"
        )));
    }
    if service_duration > MINUTES_PER_DAY {
        return Err(EngineError::InvalidArgument(format!(
            "service duration {service_duration} exceeds one day"
        )));
    }
    validate_slot_config(config)
}

pub(crate) fn validate_slot_config(config: &SlotConfig) -> Result<(), EngineError> {
    if config.granularity <= 0 {
        return Err(EngineError::InvalidArgument(format!(
            "slot granularity must be positive, got {}",
            config.granularity
        )));
    }
    if config.granularity > MINUTES_PER_DAY {
        return Err(EngineError::InvalidArgument(format!(
            "slot granularity {} exceeds one day",
            config.granularity
        )));
    }
    for (name, value) in [
        ("buffer_before", config.buffer_before),
        ("buffer_after", config.buffer_after),
    ] {
        if value < 0 {
            return Err(EngineError::InvalidArgument(format!(
                "{name} must not be negative, got {value}"
            )));
        }
        if value > MAX_BUFFER_MINUTES {
            return Err(EngineError::InvalidArgument(format!(
                "{name} {value} exceeds one day"
            )));
        }
    }
    Ok(())
}

/// A provider sees one appointment at a time; any overlap is a conflict.
pub(crate) fn check_no_conflict(
    ps: &ProviderState,
    appointment: &BookedInterval,
) -> Result<(), EngineError> {
    match ps
        .appointments_overlapping(appointment.start, appointment.end)
        .next()
    {
        Some(existing) => Err(EngineError::Conflict(existing.appointment_id)),
        None => Ok(()),
    }
}

