use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roomgrid_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roomgrid_query_duration_seconds";

/// Counter: reservation state changes. Labels: transition.
pub const RESERVATION_TRANSITIONS_TOTAL: &str = "roomgrid_reservation_transitions_total";

/// Counter: refused reservation attempts. Labels: reason.
pub const RESERVATION_REJECTIONS_TOTAL: &str = "roomgrid_reservation_rejections_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomgrid_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomgrid_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomgrid_connections_rejected_total";

/// Gauge: organizations with a loaded engine.
pub const ORGS_ACTIVE: &str = "roomgrid_orgs_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomgrid_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomgrid_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
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
        Command::InsertLocation { .. } => "insert_location",
        Command::RenameLocation { .. } => "rename_location",
        Command::DeleteLocation { .. } => "delete_location",
        Command::InsertRoom { .. } => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::InsertUser { .. } => "insert_user",
        Command::ReviewUser { .. } => "review_user",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::SetReservationStatus { .. } => "set_reservation_status",
        Command::RescheduleReservation { .. } => "reschedule_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectSlots => "select_slots",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectRooms => "select_rooms",
        Command::SelectLocations => "select_locations",
        Command::SelectUsers { .. } => "select_users",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectReservationDetail { .. } => "select_reservation_detail",
        Command::SelectNextReservation { .. } => "select_next_reservation",
        Command::SelectDashboard => "select_dashboard",
    }
}
