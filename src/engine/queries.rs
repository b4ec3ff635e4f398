use chrono::{Duration, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::compute_slots;
use super::validate::validate_slot_request;
use super::{Engine, EngineError};

/// Appointments that can touch `date` once widened by the buffers.
fn booked_near(ps: &ProviderState, date: NaiveDate, config: &SlotConfig) -> Vec<BookedInterval> {
    let from = day_start(date) - Duration::minutes(config.buffer_after);
    let to = day_start(date) + Duration::minutes(MINUTES_PER_DAY + config.buffer_before);
    ps.appointments_overlapping(from, to).cloned().collect()
}

fn slots_for(
    ps: &ProviderState,
    date: NaiveDate,
    duration: Min,
    config: &SlotConfig,
) -> Result<Vec<Slot>, EngineError> {
    let overrides: Vec<DateSpecificOverride> = ps.override_for(date).cloned().into_iter().collect();
    compute_slots(
        ps.id,
        date,
        duration,
        &ps.working_plan,
        &overrides,
        &booked_near(ps, date, config),
        config,
    )
}

impl Engine {
    pub async fn list_providers(&self) -> Vec<ProviderInfo> {
        let providers: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(providers.len());
        for ps in providers {
            let guard = ps.read().await;
            infos.push(ProviderInfo {
                id: guard.id,
                name: guard.name.clone(),
                override_count: guard.overrides.len(),
                appointment_count: guard.appointments.len(),
            });
        }
        infos.sort_by_key(|p| p.id);
        infos
    }

    pub async fn get_working_plan(&self, provider_id: Ulid) -> Result<WorkingPlan, EngineError> {
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let guard = ps.read().await;
        Ok(guard.working_plan.clone())
    }

    /// Overrides for a provider, date ascending. Empty for an unknown provider.
    pub async fn list_overrides(&self, provider_id: Ulid) -> Vec<DateSpecificOverride> {
        let Some(ps) = self.get_provider(&provider_id) else {
            return Vec::new();
        };
        let guard = ps.read().await;
        guard.overrides.values().cloned().collect()
    }

    pub async fn get_override(
        &self,
        provider_id: Ulid,
        date: NaiveDate,
    ) -> Option<DateSpecificOverride> {
        let ps = self.get_provider(&provider_id)?;
        let guard = ps.read().await;
        guard.override_for(date).cloned()
    }

    /// Appointments for a provider ordered by start. Empty for an unknown provider.
    pub async fn list_appointments(&self, provider_id: Ulid) -> Vec<BookedInterval> {
        let Some(ps) = self.get_provider(&provider_id) else {
            return Vec::new();
        };
        let guard = ps.read().await;
        guard.appointments.clone()
    }

    /// Bookable slots for one provider and date, computed from a single
    /// consistent snapshot of the provider. `config` falls back to the
    /// tenant default. Unknown providers have no slots.
    pub async fn compute_slots(
        &self,
        provider_id: Ulid,
        date: NaiveDate,
        service_duration: Min,
        config: Option<SlotConfig>,
    ) -> Result<Vec<Slot>, EngineError> {
        let config = config.unwrap_or(self.slot_config());
        validate_slot_request(service_duration, &config)?;

        let Some(ps) = self.get_provider(&provider_id) else {
            return Ok(Vec::new());
        };
        let guard = ps.read().await;
        let slots = slots_for(&guard, date, service_duration, &config)?;
        drop(guard);

        metrics::histogram!(observability::SLOTS_RETURNED).record(slots.len() as f64);
        Ok(slots)
    }

    /// Dates in `[from, to]` with at least one slot, under one read lock.
    pub async fn available_dates(
        &self,
        provider_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        service_duration: Min,
    ) -> Result<Vec<NaiveDate>, EngineError> {
        if to < from {
            return Err(EngineError::InvalidArgument(format!(
                "date range ends ({to}) before it starts ({from})"
            )));
        }
        if (to - from).num_days() >= MAX_QUERY_DAYS {
            return Err(EngineError::LimitExceeded("date range too wide"));
        }
        let config = self.slot_config();
        validate_slot_request(service_duration, &config)?;

        let Some(ps) = self.get_provider(&provider_id) else {
            return Ok(Vec::new());
        };
        let guard = ps.read().await;
        let mut dates = Vec::new();
        for date in from.iter_days().take_while(|d| *d <= to) {
            if !slots_for(&guard, date, service_duration, &config)?.is_empty() {
                dates.push(date);
            }
        }
        Ok(dates)
    }
}
