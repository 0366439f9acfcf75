use std::net::SocketAddr;

use crate::request::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests executed. Labels: command, status.
pub const REQUESTS_TOTAL: &str = "advisord_requests_total";

/// Histogram: request latency in seconds. Labels: command.
pub const REQUEST_DURATION_SECONDS: &str = "advisord_request_duration_seconds";

/// Counter: booking outcomes. Labels: outcome (confirmed, waitlisted, full).
pub const BOOKING_OUTCOMES_TOTAL: &str = "advisord_booking_outcomes_total";

/// Counter: waitlist entries converted to bookings.
pub const PROMOTIONS_TOTAL: &str = "advisord_promotions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "advisord_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "advisord_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "advisord_connections_rejected_total";

/// Gauge: head revision of the store.
pub const STORE_REVISION: &str = "advisord_store_revision";

/// Counter: commits whose caller stopped waiting before the writer answered.
pub const COMMIT_TIMEOUTS_TOTAL: &str = "advisord_commit_timeouts_total";

/// Counter: WAL appends or flushes that failed and left the store read-only.
pub const WAL_WRITE_FAILURES_TOTAL: &str = "advisord_wal_write_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "advisord_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "advisord_wal_flush_batch_size";

/// Counter: change records a sink accepted. Labels: sink.
pub const SYNC_DELIVERED_TOTAL: &str = "advisord_sync_delivered_total";

/// Counter: change records a sink refused after all retries. Labels: sink.
pub const SYNC_DEAD_LETTERS_TOTAL: &str = "advisord_sync_dead_letters_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
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
        Command::CheckAvailability { .. } => "check_availability",
        Command::SlotOverview { .. } => "slot_overview",
        Command::AvailableDates { .. } => "available_dates",
        Command::Book(_) => "book",
        Command::Reschedule { .. } => "reschedule",
        Command::Cancel { .. } => "cancel",
        Command::Amend { .. } => "amend",
        Command::Lookup(_) => "lookup",
        Command::LookupCode { .. } => "lookup_code",
        Command::JoinWaitlist { .. } => "join_waitlist",
        Command::Withdraw { .. } => "withdraw",
        Command::WithdrawEntry { .. } => "withdraw_entry",
        Command::Promote { .. } => "promote",
        Command::AdminView => "admin_view",
        Command::OpenSlot { .. } => "open_slot",
        Command::OpenSchedule(_) => "open_schedule",
        Command::SetCapacity { .. } => "set_capacity",
        Command::Listen { .. } => "listen",
    }
}
