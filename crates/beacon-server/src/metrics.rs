//! Metrics collection and export for Beacon.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tenvis_beacon_core::Node;
use tracing::{debug, info};

/// Metric names.
pub mod names {
    pub const CHANNELS_ACTIVE: &str = "beacon_channels_active";
    pub const CLIENTS_ACTIVE: &str = "beacon_clients_active";
    pub const NODES_KNOWN: &str = "beacon_nodes_known";
    pub const SAMPLES_TOTAL: &str = "beacon_metrics_samples_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_gauge!(
        names::CHANNELS_ACTIVE,
        "Channels with at least one local subscriber"
    );
    metrics::describe_gauge!(
        names::CLIENTS_ACTIVE,
        "Connections with at least one subscription"
    );
    metrics::describe_gauge!(names::NODES_KNOWN, "Live nodes in the cluster view");
    metrics::describe_counter!(names::SAMPLES_TOTAL, "Completed node statistics samples");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record one sample of node statistics.
pub fn record_node(node: &Node) {
    let info = node.info();
    let nodes = node.nodes().len();

    gauge!(names::CHANNELS_ACTIVE).set(info.num_channels as f64);
    gauge!(names::CLIENTS_ACTIVE).set(info.num_clients as f64);
    gauge!(names::NODES_KNOWN).set(nodes as f64);
    counter!(names::SAMPLES_TOTAL).increment(1);

    debug!(
        channels = info.num_channels,
        clients = info.num_clients,
        nodes,
        "Sampled node metrics"
    );
}

/// Sample node statistics every `NodeMetricsInterval`.
pub fn spawn_sampler(node: Arc<Node>) {
    let period = node.config().node_metrics_interval;
    if period.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            record_node(&node);
        }
    });
}
