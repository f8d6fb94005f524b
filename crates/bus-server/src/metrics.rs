//! Metrics collection and export for Ferrobus.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use ferrobus_core::{RouteOutcome, RouterStats};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "ferrobus_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "ferrobus_connections_active";
    pub const MESSAGES_TOTAL: &str = "ferrobus_messages_total";
    pub const MESSAGES_BYTES: &str = "ferrobus_messages_bytes";
    pub const ROUTED_TOTAL: &str = "ferrobus_routed_total";
    pub const NAMES_REGISTERED: &str = "ferrobus_names_registered";
    pub const PENDING_REPLIES: &str = "ferrobus_pending_replies";
    pub const LATENCY_SECONDS: &str = "ferrobus_route_latency_seconds";
    pub const ERRORS_TOTAL: &str = "ferrobus_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of admitted connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of admitted connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages read or written");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages read or written");
    metrics::describe_counter!(names::ROUTED_TOTAL, "Inbound messages by claiming tier");
    metrics::describe_gauge!(names::NAMES_REGISTERED, "Current number of registered bus names");
    metrics::describe_gauge!(names::PENDING_REPLIES, "Proxied calls awaiting a reply");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Routing latency per inbound message in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record which tier claimed an inbound message.
pub fn record_route(outcome: &RouteOutcome) {
    counter!(names::ROUTED_TOTAL, "tier" => outcome.label()).increment(1);
}

/// Record routing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Update the table-size gauges.
pub fn set_router_stats(stats: &RouterStats) {
    gauge!(names::NAMES_REGISTERED).set(stats.name_count as f64);
    gauge!(names::PENDING_REPLIES).set(stats.pending_replies as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
