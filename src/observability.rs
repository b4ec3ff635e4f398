use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── Requests ────────────────────────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "easyslot_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "easyslot_query_duration_seconds";

/// Histogram: slots returned per slot query.
pub const SLOTS_RETURNED: &str = "easyslot_slots_returned";

// ── Resources ───────────────────────────────────────────────────

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "easyslot_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "easyslot_connections_total";

/// Counter: connections turned away at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "easyslot_connections_rejected_total";

/// Gauge: loaded tenants.
pub const TENANTS_ACTIVE: &str = "easyslot_tenants_active";

/// Histogram: group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "easyslot_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "easyslot_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "easyslot_wal_compactions_total";

/// Serve `/metrics` on `port`. No-op without a port.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metric label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertProvider { .. } => "insert_provider",
        Command::DeleteProvider { .. } => "delete_provider",
        Command::SetWorkingPlan { .. } => "set_working_plan",
        Command::UpsertOverrides { .. } => "upsert_overrides",
        Command::DeleteOverride { .. } => "delete_override",
        Command::InsertAppointments { .. } => "insert_appointments",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::SelectProviders => "select_providers",
        Command::SelectWorkingPlan { .. } => "select_working_plan",
        Command::SelectOverrides { .. } => "select_overrides",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectAvailableDates { .. } => "select_available_dates",
    }
}
