//! Single-node engine.

use super::{Engine, EngineError, EngineResult, HistoryOptions, MemoryStore, PublishResult};
use crate::channel::ChannelId;
use crate::config::ChannelOptions;
use crate::hub::{Delivery, Hub};
use async_trait::async_trait;
use beacon_protocol::{
    AdminMessage, ClientInfo, ConnId, ControlMessage, JoinLeaveMessage, Message,
};
use dashmap::DashSet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Default period of the expiry sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Engine keeping everything in process memory.
///
/// Delivery goes straight into the local [`Hub`]; presence and history live
/// in a [`MemoryStore`].
pub struct MemoryEngine {
    hub: Arc<Hub>,
    store: Arc<MemoryStore>,
    subscribed: DashSet<ChannelId>,
    sweep_interval: Duration,
    running: AtomicBool,
    shutdown: watch::Sender<()>,
}

impl MemoryEngine {
    /// Create an engine delivering into `hub`.
    #[must_use]
    pub fn new(hub: Arc<Hub>, store: Arc<MemoryStore>) -> Self {
        let (shutdown, _) = watch::channel(());
        Self {
            hub,
            store,
            subscribed: DashSet::new(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            running: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Set the period of the expiry sweep.
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Run [`MemoryStore::sweep_expired`] until `shutdown` closes.
pub(crate) fn spawn_sweeper(
    store: Arc<MemoryStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<()>,
) {
    if interval.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    store.sweep_expired();
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Expiry sweep stopped");
    });
}

#[async_trait]
impl Engine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn run(&self) -> EngineResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }
        spawn_sweeper(
            Arc::clone(&self.store),
            self.sweep_interval,
            self.shutdown.subscribe(),
        );
        info!(engine = self.name(), "Engine running");
        Ok(())
    }

    fn publish_message(
        &self,
        channel: &ChannelId,
        message: Message,
        options: &ChannelOptions,
    ) -> PublishResult {
        let inactive = self.hub.subscriber_count(&message.channel) == 0;
        self.store.add_history(channel, &message, options, inactive);
        let name = message.channel.clone();
        self.hub.deliver(&name, Delivery::Message(message));
        PublishResult::ready(Ok(()))
    }

    fn publish_join(&self, _channel: &ChannelId, message: JoinLeaveMessage) -> PublishResult {
        let name = message.channel.clone();
        self.hub.deliver(&name, Delivery::Join(message));
        PublishResult::ready(Ok(()))
    }

    fn publish_leave(&self, _channel: &ChannelId, message: JoinLeaveMessage) -> PublishResult {
        let name = message.channel.clone();
        self.hub.deliver(&name, Delivery::Leave(message));
        PublishResult::ready(Ok(()))
    }

    fn publish_admin(&self, message: AdminMessage) -> PublishResult {
        self.hub.deliver_admin(message);
        PublishResult::ready(Ok(()))
    }

    fn publish_control(&self, message: ControlMessage) -> PublishResult {
        self.hub.deliver_control(message);
        PublishResult::ready(Ok(()))
    }

    async fn subscribe(&self, channel: &ChannelId) -> EngineResult<()> {
        self.subscribed.insert(channel.clone());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &ChannelId) -> EngineResult<()> {
        self.subscribed.remove(channel);
        Ok(())
    }

    async fn channels(&self) -> EngineResult<Vec<ChannelId>> {
        Ok(self.subscribed.iter().map(|c| c.clone()).collect())
    }

    async fn add_presence(
        &self,
        channel: &ChannelId,
        connection_id: &str,
        info: ClientInfo,
    ) -> EngineResult<()> {
        self.store.add_presence(channel, connection_id, info);
        Ok(())
    }

    async fn remove_presence(&self, channel: &ChannelId, connection_id: &str) -> EngineResult<()> {
        self.store.remove_presence(channel, connection_id);
        Ok(())
    }

    async fn presence(&self, channel: &ChannelId) -> EngineResult<HashMap<ConnId, ClientInfo>> {
        Ok(self.store.presence(channel))
    }

    async fn history(
        &self,
        channel: &ChannelId,
        options: HistoryOptions,
    ) -> EngineResult<Vec<Message>> {
        Ok(self.store.history(channel, options.limit))
    }
}
