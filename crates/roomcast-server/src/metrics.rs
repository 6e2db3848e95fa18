//! Metrics collection and export for Roomcast.
//!
//! The core crates record through the `metrics` facade; this module
//! describes those series, adds the connection-level ones and exports
//! everything in Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use roomcast_core::metrics::names as core_names;
use std::net::SocketAddr;
use tracing::info;

/// Metric names owned by the server.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "roomcast_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "roomcast_connections_active";
    pub const REJECTIONS_TOTAL: &str = "roomcast_rejections_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of upgraded connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::REJECTIONS_TOTAL,
        "Connection attempts refused before upgrade"
    );
    metrics::describe_counter!(
        core_names::MESSAGES_INBOUND,
        "Chat messages decoded from clients"
    );
    metrics::describe_counter!(
        core_names::MESSAGES_DELIVERED,
        "Messages enqueued on session mailboxes"
    );
    metrics::describe_counter!(
        core_names::ROUTE_MISSES,
        "Directed messages whose recipient was not in the room"
    );
    metrics::describe_counter!(
        core_names::EVICTIONS,
        "Sessions dropped for a full or closed mailbox"
    );
    metrics::describe_counter!(
        core_names::REPLACEMENTS,
        "Sessions replaced by a newer login of the same user"
    );
    metrics::describe_counter!(core_names::DECODE_ERRORS, "Undecodable inbound frames");
    metrics::describe_counter!(core_names::WRITES, "Frames written to connections");
    metrics::describe_gauge!(core_names::SESSIONS_ACTIVE, "Registered sessions");
    metrics::describe_gauge!(core_names::ROOMS_ACTIVE, "Rooms with registered sessions");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a connection refused before upgrade.
pub fn record_rejection(reason: &'static str) {
    counter!(names::REJECTIONS_TOTAL, "reason" => reason).increment(1);
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

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
