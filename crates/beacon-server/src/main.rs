//! # Beacon Server
//!
//! Pub/sub broker node with operational HTTP endpoints.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! beacon
//!
//! # Run with a settings file
//! BEACON_CONFIG=/path/to/beacon.toml beacon
//!
//! # Run with environment variables
//! BEACON_PORT=8000 BEACON_HOST=0.0.0.0 BEACON_BROKER__NAME=node-a beacon
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use std::sync::Arc;
use tenvis_beacon_core::{Hub, HubConfig, MemoryEngine, MemoryStore, Node};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=debug,tenvis_beacon_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = config::Settings::load()?;

    tracing::info!(
        "Starting Beacon node {} on {}:{}",
        settings.broker.name,
        settings.host,
        settings.port
    );

    if settings.metrics.enabled {
        metrics::init_metrics();
        if let Err(e) = metrics::start_metrics_server(settings.metrics.port) {
            tracing::error!("Failed to start metrics server: {:#}", e);
        }
    }

    let broker = settings.broker.clone();
    let hub = Arc::new(Hub::with_config(HubConfig::from(&broker)));
    let store = Arc::new(MemoryStore::new(broker.presence_expire_interval));
    let engine = Arc::new(MemoryEngine::new(Arc::clone(&hub), store));
    let node = Arc::new(Node::new(broker, engine, hub)?);

    node.run().await?;
    if settings.metrics.enabled {
        metrics::spawn_sampler(Arc::clone(&node));
    }

    handlers::run_server(&settings, node).await
}
