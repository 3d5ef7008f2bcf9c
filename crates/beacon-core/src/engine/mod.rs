//! Engine abstraction.
//!
//! An [`Engine`] separates channel and message semantics from storage and
//! inter-node transport. Callers depend only on the trait:
//!
//! - [`MemoryEngine`] - single node, everything in process memory
//! - [`BusEngine`] - one engine per node, connected through a shared [`Bus`]
//!   and a shared [`MemoryStore`] for presence and history
//!
//! Publishing is asynchronous: every publish method returns a
//! [`PublishResult`] future immediately. Awaiting it yields the outcome;
//! dropping it is always safe.

pub mod bus;
pub mod memory;
pub mod store;

pub use bus::{Bus, BusEngine};
pub use memory::MemoryEngine;
pub use store::MemoryStore;

use crate::channel::ChannelId;
use crate::config::ChannelOptions;
use async_trait::async_trait;
use beacon_protocol::{
    AdminMessage, ClientInfo, ConnId, ControlMessage, JoinLeaveMessage, Message, ProtocolError,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// `run` was called more than once.
    #[error("Engine is already running")]
    AlreadyRunning,

    /// The engine went away before completing the operation.
    #[error("Engine closed before completing the operation")]
    Closed,

    /// Encoding or decoding failed.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Backend failure.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl EngineError {
    /// Description safe to relay to clients.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        "internal server error"
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Options for history reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryOptions {
    /// Maximum number of messages to return, 0 for all.
    pub limit: usize,
}

/// Completion of an asynchronous publish.
///
/// Resolves to [`EngineError::Closed`] if the engine dropped the operation.
#[derive(Debug)]
#[must_use = "a publish result does nothing unless awaited or explicitly dropped"]
pub struct PublishResult {
    rx: oneshot::Receiver<EngineResult<()>>,
}

impl PublishResult {
    /// A result that is already known.
    pub fn ready(result: EngineResult<()>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// A pending result and the sender that completes it.
    pub fn pending() -> (oneshot::Sender<EngineResult<()>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl Future for PublishResult {
    type Output = EngineResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(EngineError::Closed)))
    }
}

/// Backend for publish, subscribe, presence and history.
///
/// Every method may be called concurrently from many tasks.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Name of the implementation.
    fn name(&self) -> &'static str;

    /// One-time startup, called before anything else.
    async fn run(&self) -> EngineResult<()>;

    /// Deliver a message to channel subscribers on every node and maintain
    /// history according to `options`.
    fn publish_message(
        &self,
        channel: &ChannelId,
        message: Message,
        options: &ChannelOptions,
    ) -> PublishResult;

    /// Deliver a join notification. Never touches history.
    fn publish_join(&self, channel: &ChannelId, message: JoinLeaveMessage) -> PublishResult;

    /// Deliver a leave notification. Never touches history.
    fn publish_leave(&self, channel: &ChannelId, message: JoinLeaveMessage) -> PublishResult;

    /// Deliver to all administrative observers.
    fn publish_admin(&self, message: AdminMessage) -> PublishResult;

    /// Deliver to all nodes of the cluster.
    fn publish_control(&self, message: ControlMessage) -> PublishResult;

    /// Register this node's interest in a channel. Idempotent.
    async fn subscribe(&self, channel: &ChannelId) -> EngineResult<()>;

    /// Drop this node's interest in a channel. Idempotent.
    async fn unsubscribe(&self, channel: &ChannelId) -> EngineResult<()>;

    /// Channels with at least one subscriber known to the engine.
    async fn channels(&self) -> EngineResult<Vec<ChannelId>>;

    /// Set or refresh presence of a connection.
    async fn add_presence(
        &self,
        channel: &ChannelId,
        connection_id: &str,
        info: ClientInfo,
    ) -> EngineResult<()>;

    /// Remove presence of a connection.
    async fn remove_presence(&self, channel: &ChannelId, connection_id: &str) -> EngineResult<()>;

    /// Unexpired presence of a channel.
    async fn presence(&self, channel: &ChannelId) -> EngineResult<HashMap<ConnId, ClientInfo>>;

    /// Retained messages of a channel, oldest first.
    async fn history(&self, channel: &ChannelId, options: HistoryOptions)
        -> EngineResult<Vec<Message>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_result() {
        assert!(PublishResult::ready(Ok(())).await.is_ok());
        assert!(matches!(
            PublishResult::ready(Err(EngineError::Backend("down".into()))).await,
            Err(EngineError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_sender_is_closed() {
        let (tx, result) = PublishResult::pending();
        drop(tx);
        assert!(matches!(result.await, Err(EngineError::Closed)));
    }

    #[test]
    fn test_public_message_hides_detail() {
        let err = EngineError::Backend("redis at 10.0.0.3:6379 refused".into());
        assert_eq!(err.public_message(), "internal server error");
    }
}
