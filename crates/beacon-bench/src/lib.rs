//! Shared fixtures for the Beacon benchmarks.

use beacon_protocol::Message;
use std::sync::Arc;
use std::time::Duration;
use tenvis_beacon_core::{ChannelOptions, Config, Hub, MemoryEngine, MemoryStore, Namespace};

/// A JSON message with a body of roughly `size` bytes.
#[must_use]
pub fn message(channel: &str, size: usize) -> Message {
    let body = format!("{{\"text\":\"{}\"}}", "x".repeat(size));
    Message::new(channel, body.as_bytes())
}

/// Config with a `history` namespace retaining `size` messages for a minute.
#[must_use]
pub fn history_config(size: usize) -> Config {
    Config {
        namespaces: vec![Namespace::new(
            "history",
            ChannelOptions {
                history_size: size,
                history_lifetime: 60,
                ..ChannelOptions::default()
            },
        )],
        ..Config::default()
    }
}

/// A hub and a memory engine delivering into it.
#[must_use]
pub fn memory_engine() -> (Arc<Hub>, MemoryEngine) {
    let hub = Arc::new(Hub::new());
    let store = Arc::new(MemoryStore::new(Duration::from_secs(60)));
    let engine = MemoryEngine::new(Arc::clone(&hub), store);
    (hub, engine)
}
