mod availability;
mod error;
mod mutations;
mod queries;
pub(crate) mod validate;

pub use availability::{
    compute_slots, effective_intervals, merge_overlapping, open_spans, subtract_intervals,
};
pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedProviderState = Arc<RwLock<ProviderState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written as one batch behind a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Compaction must observe every append queued before it.
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    debug!(path = %wal.path().display(), "WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let result = write_batch(wal, &batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn write_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    // A failed batch must not leave bytes that later batches append behind.
    if result.is_err()
        && let Err(e) = wal.discard_unsynced()
    {
        error!(path = %wal.path().display(), error = %e, "could not discard failed WAL batch");
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

// ── Engine ───────────────────────────────────────────────

/// One tenant's providers, their plans, overrides and appointments.
pub struct Engine {
    pub state: DashMap<Ulid, SharedProviderState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: appointment id → provider id.
    pub(super) appointment_to_provider: DashMap<Ulid, Ulid>,
    /// Serialises provider creation/deletion against compaction so the
    /// compacted snapshot never misses a provider.
    pub(super) lifecycle: Mutex<()>,
    slot_config: SlotConfig,
}

/// Apply an event to a provider (caller holds the write lock).
/// Creation and deletion are handled at the map level.
fn apply_to_provider(ps: &mut ProviderState, event: &Event, appointments: &DashMap<Ulid, Ulid>) {
    match event {
        Event::WorkingPlanSet { plan, .. } => {
            ps.working_plan = plan.clone();
        }
        Event::OverrideUpserted { entry } => {
            ps.overrides.insert(entry.date, entry.clone());
        }
        Event::OverrideRemoved { date, .. } => {
            ps.overrides.remove(date);
        }
        Event::OverrideMoved { from, entry } => {
            ps.overrides.remove(from);
            ps.overrides.insert(entry.date, entry.clone());
        }
        Event::AppointmentBooked { appointment } => {
            appointments.insert(appointment.appointment_id, appointment.provider_id);
            ps.insert_appointment(appointment.clone());
        }
        Event::AppointmentCancelled { id, .. } => {
            ps.remove_appointment(*id);
            appointments.remove(id);
        }
        Event::ProviderCreated { .. } | Event::ProviderDeleted { .. } => {}
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must be called
    /// inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        slot_config: SlotConfig,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;

        // Rebuild with plain ownership, then wrap in locks once at the end.
        let mut providers: HashMap<Ulid, ProviderState> = HashMap::new();
        let appointment_to_provider = DashMap::new();
        for event in &events {
            match event {
                Event::ProviderCreated { id, name } => {
                    providers.insert(*id, ProviderState::new(*id, name.clone()));
                }
                Event::ProviderDeleted { id } => {
                    if let Some(ps) = providers.remove(id) {
                        for a in &ps.appointments {
                            appointment_to_provider.remove(&a.appointment_id);
                        }
                    }
                }
                other => {
                    if let Some(ps) = providers.get_mut(&other.provider_id()) {
                        apply_to_provider(ps, other, &appointment_to_provider);
                    }
                }
            }
        }
        info!(
            path = %wal_path.display(),
            events = events.len(),
            providers = providers.len(),
            "WAL replayed"
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let state = providers
            .into_iter()
            .map(|(id, ps)| (id, Arc::new(RwLock::new(ps))))
            .collect();

        Ok(Self {
            state,
            wal_tx,
            notify,
            appointment_to_provider,
            lifecycle: Mutex::new(()),
            slot_config,
        })
    }

    async fn wal_request<T>(
        &self,
        cmd: WalCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, EngineError> {
        self.wal_tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::Dependency("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Dependency("WAL writer dropped response".into()))
    }

    /// Durably append one event through the group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        let cmd = WalCommand::Append {
            event: event.clone(),
            response: tx,
        };
        self.wal_request(cmd, rx)
            .await?
            .map_err(|e| EngineError::Dependency(e.to_string()))
    }

    pub fn get_provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn provider_for_appointment(&self, appointment_id: &Ulid) -> Option<Ulid> {
        self.appointment_to_provider
            .get(appointment_id)
            .map(|e| *e.value())
    }

    /// The tenant-wide defaults used when a query does not supply its own.
    pub fn slot_config(&self) -> SlotConfig {
        self.slot_config
    }

    /// WAL append, apply, notify.
    pub(super) async fn persist_and_apply(
        &self,
        provider_id: Ulid,
        ps: &mut ProviderState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_provider(ps, event, &self.appointment_to_provider);
        self.notify.send(provider_id, event);
        Ok(())
    }

    pub(super) async fn provider_write(
        &self,
        provider_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ProviderState>, EngineError> {
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        Ok(ps.write_owned().await)
    }

    /// Look up an appointment's provider and take that provider's write lock.
    pub(super) async fn resolve_appointment_write(
        &self,
        appointment_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<ProviderState>), EngineError> {
        let provider_id = self
            .provider_for_appointment(appointment_id)
            .ok_or(EngineError::NotFound(*appointment_id))?;
        let guard = self.provider_write(provider_id).await?;
        Ok((provider_id, guard))
    }
}
