use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "seatd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "seatd_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "seatd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "seatd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "seatd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "seatd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "seatd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "seatd_wal_flush_batch_size";

// ── Hold lifecycle ──────────────────────────────────────────────

/// Counter: holds placed.
pub const HOLDS_ACQUIRED_TOTAL: &str = "seatd_holds_acquired_total";

/// Counter: acquires or extends refused for lack of seats.
pub const ACQUIRE_REJECTED_TOTAL: &str = "seatd_acquire_rejected_total";

/// Counter: successful extends.
pub const HOLDS_EXTENDED_TOTAL: &str = "seatd_holds_extended_total";

/// Counter: holds released by their holder.
pub const HOLDS_RELEASED_TOTAL: &str = "seatd_holds_released_total";

/// Counter: holds expired. Labels: source (sweeper, lazy).
pub const HOLDS_EXPIRED_TOTAL: &str = "seatd_holds_expired_total";

/// Counter: holds turned into bookings.
pub const BOOKINGS_FINALIZED_TOTAL: &str = "seatd_bookings_finalized_total";

/// Counter: finalize retries answered with the existing booking.
pub const FINALIZE_REPLAYS_TOTAL: &str = "seatd_finalize_replays_total";

/// Counter: operations that gave up waiting for a trip lock.
pub const LOCK_CONFLICTS_TOTAL: &str = "seatd_lock_conflicts_total";

/// Histogram: duration of one sweeper pass in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "seatd_sweep_duration_seconds";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus metrics exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertTrip { .. } => "insert_trip",
        Command::DeleteTrip { .. } => "delete_trip",
        Command::SelectTrips { .. } => "select_trips",
        Command::InsertHold { .. } => "insert_hold",
        Command::UpdateHold { .. } => "update_hold",
        Command::DeleteHold { .. } => "delete_hold",
        Command::SelectHold { .. } => "select_hold",
        Command::SelectHolds { .. } => "select_holds",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::DeleteBooking { .. } => "delete_booking",
    }
}
