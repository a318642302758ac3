use std::io;
use std::net::SocketAddr;

use crate::sql::Command;

// ── Allocation ──────────────────────────────────────────────────

/// Counter: allocation requests. Labels: policy, outcome (ok, full, contention, storage_error).
pub const ALLOCATIONS_TOTAL: &str = "slotline_allocations_total";

/// Counter: uniqueness rejections seen by the allocator (each costs one retry).
pub const ALLOCATION_CONFLICTS_TOTAL: &str = "slotline_allocation_conflicts_total";

/// Histogram: insert attempts used per allocation.
pub const ALLOCATION_ATTEMPTS: &str = "slotline_allocation_attempts";

/// Histogram: end-to-end allocation latency in seconds.
pub const ALLOCATION_DURATION_SECONDS: &str = "slotline_allocation_duration_seconds";

// ── Queries ─────────────────────────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotline_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotline_query_duration_seconds";

// ── Resources ───────────────────────────────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotline_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotline_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotline_connections_rejected_total";

/// Gauge: scopes currently held by the engine.
pub const SCOPES_ACTIVE: &str = "slotline_scopes_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotline_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotline_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotline_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> io::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| io::Error::other(format!("failed to install Prometheus exporter: {e}")))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertScope { .. } => "insert_scope",
        Command::DeleteScope { .. } => "delete_scope",
        Command::InsertBreak { .. } => "insert_break",
        Command::DeleteBreak { .. } => "delete_break",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::UpdatePayment { .. } => "update_payment",
        Command::SelectScopes { .. } => "select_scopes",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectBooking { .. } => "select_booking",
    }
}
