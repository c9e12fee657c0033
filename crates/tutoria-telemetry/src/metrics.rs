//! Prometheus recorder and metric names shared across crates.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Session sockets accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Session sockets refused during validation (counter, labels: reason).
pub const WS_REJECTIONS_TOTAL: &str = "ws_rejections_total";
/// Session sockets closed (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live session sockets (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Sockets terminated for missing a pong (counter).
pub const WS_PING_TIMEOUTS_TOTAL: &str = "ws_ping_timeouts_total";
/// Outbound messages dropped on a full queue (counter).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
/// Tutor invocations (counter).
pub const TUTOR_INVOCATIONS_TOTAL: &str = "tutor_invocations_total";
/// Failed tutor invocations (counter).
pub const TUTOR_FAILURES_TOTAL: &str = "tutor_failures_total";
/// Tutor latency (histogram).
pub const TUTOR_DURATION_SECONDS: &str = "tutor_duration_seconds";
/// Sandbox workers started (counter).
pub const SANDBOX_STARTS_TOTAL: &str = "sandbox_starts_total";
/// Sandbox starts that failed (counter, labels: reason).
pub const SANDBOX_START_FAILURES_TOTAL: &str = "sandbox_start_failures_total";
/// Sandbox workers stopped (counter).
pub const SANDBOX_STOPS_TOTAL: &str = "sandbox_stops_total";
/// Live sandbox workers (gauge).
pub const SANDBOX_WORKERS_ACTIVE: &str = "sandbox_workers_active";
/// Grouped log entries written (counter).
pub const SANDBOX_LOG_FLUSHES_TOTAL: &str = "sandbox_log_flushes_total";
