//! Metrics collection and exposition.
//!
//! # Metrics
//! - `ws_open_connections` (gauge): open sockets by `authenticated`
//! - `ws_connections_total` (counter): handshake outcomes by `outcome`
//! - `ws_exchanges_total` (counter): completed exchanges by `direction`, `status`
//! - `ws_exchange_duration_seconds` (histogram): exchange latency
//! - `ws_frames_dropped_total` (counter): dropped frames by `reason`
//! - `ws_unmatched_responses_total` (counter): by `kind` (late, unmatched)
//! - `ws_request_log_dropped_total` (counter): records lost to a full buffer
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::observability::request_log::Direction;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn set_open_connections(authenticated: bool, count: u64) {
    let label = if authenticated { "true" } else { "false" };
    metrics::gauge!("ws_open_connections", "authenticated" => label).set(count as f64);
}

pub fn record_connection(outcome: &'static str) {
    metrics::counter!("ws_connections_total", "outcome" => outcome).increment(1);
}

pub fn record_exchange(direction: Direction, status: Option<i32>, duration: Duration) {
    let status = status.map_or_else(|| "none".to_string(), |s| s.to_string());
    metrics::counter!(
        "ws_exchanges_total",
        "direction" => direction.as_str(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!("ws_exchange_duration_seconds", "direction" => direction.as_str())
        .record(duration.as_secs_f64());
}

pub fn record_frame_dropped(reason: &'static str) {
    metrics::counter!("ws_frames_dropped_total", "reason" => reason).increment(1);
}

pub fn record_unmatched_response(kind: &'static str) {
    metrics::counter!("ws_unmatched_responses_total", "kind" => kind).increment(1);
}

pub fn record_request_log_dropped() {
    metrics::counter!("ws_request_log_dropped_total").increment(1);
}
