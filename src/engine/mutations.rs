use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::working_plan;

use super::validate::{check_no_conflict, validate_appointment, validate_override, validate_plan};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_provider(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("provider name too long"));
        }
        let _lifecycle = self.lifecycle.lock().await;
        if self.state.len() >= MAX_PROVIDERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many providers"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ProviderCreated { id, name: name.clone() };
        self.wal_append(&event).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(ProviderState::new(id, name))));
        self.notify.send(id, &event);
        info!(provider = %id, "provider created");
        Ok(())
    }

    /// Remove a provider together with its plan, overrides and appointments.
    pub async fn delete_provider(&self, id: Ulid) -> Result<(), EngineError> {
        let _lifecycle = self.lifecycle.lock().await;
        let guard = self.provider_write(id).await?;

        let event = Event::ProviderDeleted { id };
        self.wal_append(&event).await?;
        for a in &guard.appointments {
            self.appointment_to_provider.remove(&a.appointment_id);
        }
        self.state.remove(&id);
        drop(guard);

        self.notify.send(id, &event);
        self.notify.remove(&id);
        info!(provider = %id, "provider deleted");
        Ok(())
    }

    pub async fn set_working_plan(
        &self,
        provider_id: Ulid,
        plan: WorkingPlan,
    ) -> Result<(), EngineError> {
        validate_plan(&plan)?;
        let mut guard = self.provider_write(provider_id).await?;
        let event = Event::WorkingPlanSet { provider_id, plan };
        self.persist_and_apply(provider_id, &mut guard, &event).await
    }

    /// Replace the plan from its JSON document form.
    pub async fn set_working_plan_json(
        &self,
        provider_id: Ulid,
        json: &str,
    ) -> Result<(), EngineError> {
        let plan = working_plan::from_json(json)?;
        self.set_working_plan(provider_id, plan).await
    }

    /// Insert or replace the override for `(provider_id, date)`.
    pub async fn upsert_override(&self, entry: DateSpecificOverride) -> Result<(), EngineError> {
        validate_override(&entry)?;
        let provider_id = entry.provider_id;
        let mut guard = self.provider_write(provider_id).await?;
        if !guard.overrides.contains_key(&entry.date)
            && guard.overrides.len() >= MAX_OVERRIDES_PER_PROVIDER
        {
            return Err(EngineError::LimitExceeded("too many overrides on provider"));
        }
        debug!(provider = %provider_id, date = %entry.date, "override upserted");
        let event = Event::OverrideUpserted { entry };
        self.persist_and_apply(provider_id, &mut guard, &event).await
    }

    /// Store `entry` and drop the override on `from` as one durable change.
    /// Either both happen or neither does.
    pub async fn move_override(
        &self,
        from: NaiveDate,
        entry: DateSpecificOverride,
    ) -> Result<(), EngineError> {
        if from == entry.date {
            return self.upsert_override(entry).await;
        }
        validate_override(&entry)?;
        let provider_id = entry.provider_id;
        let mut guard = self.provider_write(provider_id).await?;
        let grows = !guard.overrides.contains_key(&entry.date)
            && !guard.overrides.contains_key(&from);
        if grows && guard.overrides.len() >= MAX_OVERRIDES_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many overrides on provider"));
        }
        debug!(provider = %provider_id, from = %from, date = %entry.date, "override moved");
        let event = Event::OverrideMoved { from, entry };
        self.persist_and_apply(provider_id, &mut guard, &event).await
    }

    /// Insert or replace several overrides atomically. Every entry must be
    /// valid and name an existing provider; otherwise nothing is written.
    /// A later entry for the same `(provider_id, date)` replaces an earlier one.
    pub async fn upsert_overrides(
        &self,
        entries: Vec<DateSpecificOverride>,
    ) -> Result<(), EngineError> {
        if entries.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        for entry in &entries {
            validate_override(entry)?;
        }

        let mut provider_ids: Vec<Ulid> = entries.iter().map(|e| e.provider_id).collect();
        provider_ids.sort();
        provider_ids.dedup();
        let mut guards = Vec::with_capacity(provider_ids.len());
        for pid in &provider_ids {
            guards.push((*pid, self.provider_write(*pid).await?));
        }

        for (pid, guard) in &guards {
            let mut new_dates: Vec<NaiveDate> = entries
                .iter()
                .filter(|e| e.provider_id == *pid && !guard.overrides.contains_key(&e.date))
                .map(|e| e.date)
                .collect();
            new_dates.sort();
            new_dates.dedup();
            if guard.overrides.len() + new_dates.len() > MAX_OVERRIDES_PER_PROVIDER {
                return Err(EngineError::LimitExceeded("too many overrides on provider"));
            }
        }

        for entry in entries {
            let provider_id = entry.provider_id;
            debug!(provider = %provider_id, date = %entry.date, "override upserted");
            let event = Event::OverrideUpserted { entry };
            if let Some((_, guard)) = guards.iter_mut().find(|(pid, _)| *pid == provider_id) {
                self.persist_and_apply(provider_id, guard, &event).await?;
            }
        }
        Ok(())
    }

    /// Returns whether an override was removed. Removing an absent override
    /// succeeds without touching the WAL.
    pub async fn remove_override(
        &self,
        provider_id: Ulid,
        date: NaiveDate,
    ) -> Result<bool, EngineError> {
        let mut guard = self.provider_write(provider_id).await?;
        if !guard.overrides.contains_key(&date) {
            return Ok(false);
        }
        let event = Event::OverrideRemoved { provider_id, date };
        self.persist_and_apply(provider_id, &mut guard, &event).await?;
        Ok(true)
    }

    /// Record an existing booking. Rejected if it overlaps another
    /// appointment of the same provider.
    pub async fn record_appointment(&self, appointment: BookedInterval) -> Result<(), EngineError> {
        validate_appointment(&appointment)?;
        let provider_id = appointment.provider_id;
        let mut guard = self.provider_write(provider_id).await?;
        if self
            .appointment_to_provider
            .contains_key(&appointment.appointment_id)
        {
            return Err(EngineError::AlreadyExists(appointment.appointment_id));
        }
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many appointments on provider"));
        }
        check_no_conflict(&guard, &appointment)?;

        let event = Event::AppointmentBooked { appointment };
        self.persist_and_apply(provider_id, &mut guard, &event).await
    }

    /// Record several bookings atomically. Each booking's provider must
    /// exist and nothing may overlap, within the batch or with stored
    /// appointments; otherwise nothing is written.
    pub async fn record_appointments(
        &self,
        appointments: Vec<BookedInterval>,
    ) -> Result<(), EngineError> {
        if appointments.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        for a in &appointments {
            validate_appointment(a)?;
        }
        for (i, a) in appointments.iter().enumerate() {
            if let Some(clash) = appointments[..i].iter().find(|b| {
                b.appointment_id == a.appointment_id
                    || (b.provider_id == a.provider_id && b.overlaps(a))
            }) {
                return Err(if clash.appointment_id == a.appointment_id {
                    EngineError::AlreadyExists(a.appointment_id)
                } else {
                    EngineError::Conflict(clash.appointment_id)
                });
            }
        }

        // Lock providers in id order so concurrent batches cannot deadlock.
        let mut provider_ids: Vec<Ulid> = appointments.iter().map(|a| a.provider_id).collect();
        provider_ids.sort();
        provider_ids.dedup();
        let mut guards = Vec::with_capacity(provider_ids.len());
        for pid in &provider_ids {
            guards.push((*pid, self.provider_write(*pid).await?));
        }

        for a in &appointments {
            if self.appointment_to_provider.contains_key(&a.appointment_id) {
                return Err(EngineError::AlreadyExists(a.appointment_id));
            }
            let (_, guard) = guards
                .iter()
                .find(|(pid, _)| *pid == a.provider_id)
                .ok_or(EngineError::NotFound(a.provider_id))?;
            let pending = appointments.iter().filter(|b| b.provider_id == a.provider_id).count();
            if guard.appointments.len() + pending > MAX_APPOINTMENTS_PER_PROVIDER {
                return Err(EngineError::LimitExceeded("too many appointments on provider"));
            }
            check_no_conflict(guard, a)?;
        }

        for a in appointments {
            let provider_id = a.provider_id;
            let event = Event::AppointmentBooked { appointment: a };
            if let Some((_, guard)) = guards.iter_mut().find(|(pid, _)| *pid == provider_id) {
                self.persist_and_apply(provider_id, guard, &event).await?;
            }
        }
        Ok(())
    }

    /// Returns the provider the appointment belonged to.
    pub async fn cancel_appointment(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (provider_id, mut guard) = self.resolve_appointment_write(&id).await?;
        if !guard.appointments.iter().any(|a| a.appointment_id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::AppointmentCancelled { id, provider_id };
        self.persist_and_apply(provider_id, &mut guard, &event).await?;
        Ok(provider_id)
    }

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _lifecycle = self.lifecycle.lock().await;

        // Same id order as batch writers take their locks.
        let mut providers: Vec<_> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        providers.sort_by_key(|(id, _)| *id);
        let mut guards = Vec::with_capacity(providers.len());
        for (_, ps) in providers {
            guards.push(ps.read_owned().await);
        }

        let mut events = Vec::new();
        for ps in &guards {
            events.push(Event::ProviderCreated {
                id: ps.id,
                name: ps.name.clone(),
            });
            if ps.working_plan != WorkingPlan::default() {
                events.push(Event::WorkingPlanSet {
                    provider_id: ps.id,
                    plan: ps.working_plan.clone(),
                });
            }
            events.extend(
                ps.overrides
                    .values()
                    .map(|entry| Event::OverrideUpserted { entry: entry.clone() }),
            );
            events.extend(
                ps.appointments
                    .iter()
                    .map(|a| Event::AppointmentBooked { appointment: a.clone() }),
            );
        }
        let count = events.len();

        // Read guards stay held until the swap so no append can slip in
        // between the snapshot and the rewrite.
        let (tx, rx) = oneshot::channel();
        self.wal_request(WalCommand::Compact { events, response: tx }, rx)
            .await?
            .map_err(|e| EngineError::Dependency(e.to_string()))?;
        drop(guards);

        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_request(WalCommand::AppendsSinceCompact { response: tx }, rx)
            .await
    }
}
