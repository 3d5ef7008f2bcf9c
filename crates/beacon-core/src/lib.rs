//! # beacon-core
//!
//! Channel configuration, engine contract and node core for the Beacon
//! pub/sub broker.
//!
//! - **Config** - broker settings, namespaces and channel option resolution
//! - **Channel** - channel naming rules and engine routing keys
//! - **Hub** - local subscriber registry and fan-out
//! - **Engine** - publish, presence and history backends
//! - **Node** - channel semantics on top of an engine
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │    Node     │────▶│   Engine    │────▶│    Store    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                   │
//!        ▼                   ▼
//! ┌─────────────┐     ┌─────────────┐
//! │   Config    │     │     Hub     │
//! └─────────────┘     └─────────────┘
//! ```

pub mod channel;
pub mod config;
pub mod engine;
pub mod hub;
pub mod node;

pub use channel::ChannelId;
pub use config::{ChannelOptions, Config, ConfigError, Namespace, NamespaceKey, Secret};
pub use engine::{
    Bus, BusEngine, Engine, EngineError, EngineResult, HistoryOptions, MemoryEngine, MemoryStore,
    PublishResult,
};
pub use hub::{Delivery, Hub, HubConfig, HubError, HubStats, Subscription, Unsubscribed};
pub use node::{Node, NodeError, Recovery};
