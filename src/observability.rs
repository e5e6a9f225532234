//! Metric names and exporter setup.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};

use crate::sql::Command;

// ── Reservation outcomes ────────────────────────────────────────

/// Counter: claims by terminal outcome. Labels: outcome.
pub const CLAIMS_TOTAL: &str = "tutorslot_claims_total";

/// Histogram: end-to-end claim latency in seconds.
pub const CLAIM_DURATION_SECONDS: &str = "tutorslot_claim_duration_seconds";

/// Counter: compensating releases after a failed booking write. Labels: result.
pub const COMPENSATIONS_TOTAL: &str = "tutorslot_compensations_total";

/// Counter: held windows with no booking released by the reconciler.
pub const ORPHANS_RELEASED_TOTAL: &str = "tutorslot_orphans_released_total";

/// Counter: windows published or replaced.
pub const WINDOWS_PUBLISHED_TOTAL: &str = "tutorslot_windows_published_total";

// ── SQL surface ─────────────────────────────────────────────────

/// Counter: statements handled. Labels: command, status.
pub const QUERIES_TOTAL: &str = "tutorslot_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "tutorslot_query_duration_seconds";

// ── Connections and storage ─────────────────────────────────────

/// Gauge: open client sessions.
pub const CONNECTIONS_ACTIVE: &str = "tutorslot_connections_active";

/// Counter: client sessions admitted.
pub const CONNECTIONS_TOTAL: &str = "tutorslot_connections_total";

/// Counter: sockets closed because every connection slot was taken.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tutorslot_connections_rejected_total";

/// Histogram: seconds spent in one log fsync.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tutorslot_wal_flush_duration_seconds";

/// Histogram: appends made durable by one log fsync.
pub const WAL_FLUSH_BATCH_SIZE: &str = "tutorslot_wal_flush_batch_size";

/// Latency buckets for every `*_seconds` histogram, from sub-millisecond
/// fsyncs up to slow claims.
const SECONDS_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Serve `/metrics` on `port`. Without a port metrics are recorded into the
/// no-op recorder.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Suffix("_seconds".into()), SECONDS_BUCKETS)?
        .with_http_listener(addr)
        .install()?;
    tracing::info!(%addr, "prometheus exporter listening");
    Ok(())
}

/// Metric label for a parsed statement.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertWindows { .. } => "insert_windows",
        Command::DeleteWindow { .. } => "delete_window",
        Command::Claim { .. } => "claim",
        Command::SelectWindows { .. } => "select_windows",
        Command::SelectOpenWindows { .. } => "select_open_windows",
        Command::SelectOpenDays { .. } => "select_open_days",
        Command::SelectBookings { .. } => "select_bookings",
    }
}
