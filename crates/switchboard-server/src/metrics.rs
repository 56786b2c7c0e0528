//! Metrics collection and export for the exchange.
//!
//! Uses the `metrics` crate for instrumentation and exports to
//! Prometheus format.

use metrics::{counter, gauge};
use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use switchboard_core::ExchangeStats;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "switchboard_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "switchboard_connections_active";
    pub const FRAMES_TOTAL: &str = "switchboard_frames_total";
    pub const REGISTERED_ADDRESSES: &str = "switchboard_registered_addresses";
    pub const CALLS_ACTIVE: &str = "switchboard_calls_active";
    pub const BROADCASTS_ACTIVE: &str = "switchboard_broadcasts_active";
    pub const WAKES_PENDING: &str = "switchboard_wakes_pending";
    pub const WAKE_PROFILES: &str = "switchboard_wake_profiles";
    pub const ERRORS_TOTAL: &str = "switchboard_errors_total";
}

/// Initialize metric descriptions.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_gauge!(
        names::REGISTERED_ADDRESSES,
        "Current number of bound addresses"
    );
    metrics::describe_gauge!(names::CALLS_ACTIVE, "Current number of point-to-point calls");
    metrics::describe_gauge!(
        names::BROADCASTS_ACTIVE,
        "Current number of broadcast sessions"
    );
    metrics::describe_gauge!(names::WAKES_PENDING, "Dials queued behind sleeping agents");
    metrics::describe_gauge!(names::WAKE_PROFILES, "Stored wake profiles");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("metrics server listening on {addr}");
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_frame(direction: &'static str, frame_type: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction, "type" => frame_type).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Publish the exchange's table sizes as gauges.
pub fn publish_stats(stats: &ExchangeStats) {
    gauge!(names::REGISTERED_ADDRESSES).set(stats.registered as f64);
    gauge!(names::CALLS_ACTIVE).set(stats.active_calls as f64);
    gauge!(names::BROADCASTS_ACTIVE).set(stats.broadcast_sessions as f64);
    gauge!(names::WAKES_PENDING).set(stats.pending_wake_calls as f64);
    gauge!(names::WAKE_PROFILES).set(stats.wake_profiles as f64);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // Just test that it doesn't panic without an installed recorder.
        let _guard = ConnectionMetricsGuard::new();
        record_frame("inbound", "DIAL");
    }
}
