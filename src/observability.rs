use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: booking attempts. Labels: outcome (booked, conflict, not_found, error).
pub const BOOKINGS_TOTAL: &str = "slotbook_bookings_total";

/// Counter: lost booking attempts. Labels: cause.
pub const CONFLICTS_TOTAL: &str = "slotbook_conflicts_total";

/// Counter: successful cancellations.
pub const CANCELLATIONS_TOTAL: &str = "slotbook_cancellations_total";

/// Counter: units of work dropped or rejected without applying. Labels: unit.
pub const UNITS_ABORTED_TOTAL: &str = "slotbook_units_aborted_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertDoctor { .. } => "insert_doctor",
        Command::SelectDoctors { .. } => "select_doctors",
        Command::SelectDoctor { .. } => "select_doctor",
        Command::InsertAppointment { .. } => "book",
        Command::DeleteAppointment { .. } => "cancel",
        Command::SelectAppointment { .. } => "select_appointment",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
