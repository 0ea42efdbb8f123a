use std::net::SocketAddr;

use crate::model::AttemptOutcome;

// ── Race metrics ────────────────────────────────────────────────

/// Counter: races finished. Labels: result (won, failed).
pub const RACES_TOTAL: &str = "courtbot_races_total";

/// Counter: booking attempts resolved. Labels: outcome.
pub const ATTEMPTS_TOTAL: &str = "courtbot_attempts_total";

/// Histogram: wall time from the opening instant to the last attempt resolving.
pub const RACE_DURATION_SECONDS: &str = "courtbot_race_duration_seconds";

/// Counter: provider confirmed a second candidate in the same race.
pub const DUPLICATE_SUCCESSES_TOTAL: &str = "courtbot_duplicate_successes_total";

// ── Trigger / dispatch metrics ──────────────────────────────────

/// Histogram: how far past its armed instant the trigger actually fired.
pub const TRIGGER_LATENESS_SECONDS: &str = "courtbot_trigger_lateness_seconds";

/// Counter: accounts whose session could not be established for the day.
pub const SESSION_FAILURES_TOTAL: &str = "courtbot_session_failures_total";

/// Counter: requests dropped because their date passed unbooked.
pub const EXPIRED_REQUESTS_TOTAL: &str = "courtbot_expired_requests_total";

/// Counter: failed reads of the pending-request store.
pub const STORE_FAILURES_TOTAL: &str = "courtbot_store_failures_total";

// ── Store metrics ───────────────────────────────────────────────

/// Gauge: live requests in the store.
pub const PENDING_REQUESTS: &str = "courtbot_pending_requests";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtbot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtbot_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

pub fn record_attempt(outcome: &AttemptOutcome) {
    metrics::counter!(ATTEMPTS_TOTAL, "outcome" => outcome.label()).increment(1);
}
