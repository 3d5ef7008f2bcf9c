//! Broker node.
//!
//! A [`Node`] ties configuration, the local [`Hub`] and an [`Engine`]
//! together and implements channel semantics on top of them: permission
//! checks, namespace options, presence, join/leave notifications, history
//! and recovery. It also keeps the cluster view fresh by pinging peers over
//! the control channel.

use crate::config::{ChannelOptions, Config, ConfigError};
use crate::engine::{Engine, EngineError, HistoryOptions};
use crate::hub::{Hub, HubError, Subscription};
use beacon_protocol::{
    unix_seconds, AdminMessage, ClientInfo, ConnId, ControlCommand, ControlMessage,
    JoinLeaveMessage, Message, MessageId, NodeInfo,
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Node errors.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration problem, including unknown namespaces.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Engine failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Local subscription failure.
    #[error(transparent)]
    Hub(#[from] HubError),

    /// Channel name rejected.
    #[error("Invalid channel: {0}")]
    InvalidChannel(&'static str),

    /// Operation not allowed for this client or channel.
    #[error("Permission denied")]
    PermissionDenied,

    /// Feature disabled for the channel's namespace.
    #[error("Not available")]
    NotAvailable,
}

impl NodeError {
    /// Description safe to relay to clients.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Config(e) => e.public_message(),
            Self::Engine(e) => e.public_message(),
            Self::Hub(e) => e.public_message(),
            Self::InvalidChannel(_) => "bad request",
            Self::PermissionDenied => "permission denied",
            Self::NotAvailable => "not available",
        }
    }
}

/// Result of a recovery attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    /// Messages to replay, oldest first.
    pub messages: Vec<Message>,
    /// Whether every missed message could be recovered.
    pub recovered: bool,
}

#[derive(Debug, Clone)]
struct Peer {
    info: NodeInfo,
    seen: Instant,
}

/// A broker node.
pub struct Node {
    uid: String,
    config: Arc<Config>,
    engine: Arc<dyn Engine>,
    hub: Arc<Hub>,
    started_at: i64,
    peers: Arc<DashMap<String, Peer>>,
    interest_locks: DashMap<String, Arc<Mutex<()>>>,
    shutdown: watch::Sender<()>,
}

impl Node {
    /// Create a node.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: Config, engine: Arc<dyn Engine>, hub: Arc<Hub>) -> Result<Self, NodeError> {
        config.validate()?;
        let (shutdown, _) = watch::channel(());
        Ok(Self {
            uid: beacon_protocol::generate_message_id(),
            config: Arc::new(config),
            engine,
            hub,
            started_at: unix_seconds(),
            peers: Arc::new(DashMap::new()),
            interest_locks: DashMap::new(),
            shutdown,
        })
    }

    /// Unique id of this node.
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Configuration the node runs with.
    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Local subscriber hub.
    #[must_use]
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// The engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Start the engine and the background loops.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails to start.
    pub async fn run(&self) -> Result<(), NodeError> {
        self.engine.run().await?;

        self.spawn_control_listener();
        self.spawn_ping_loop();
        self.spawn_peer_cleanup();
        self.spawn_admin_stats();

        info!(
            uid = %self.uid,
            name = %self.config.name,
            engine = self.engine.name(),
            "Node running"
        );
        Ok(())
    }

    /// Stop the background loops.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        debug!(uid = %self.uid, "Node shutting down");
    }

    /// Snapshot of this node.
    #[must_use]
    pub fn info(&self) -> NodeInfo {
        node_info(&self.uid, &self.config, &self.hub, self.started_at)
    }

    /// This node followed by every live peer.
    #[must_use]
    pub fn nodes(&self) -> Vec<NodeInfo> {
        let mut nodes = vec![self.info()];
        nodes.extend(self.peers.iter().map(|p| p.info.clone()));
        nodes
    }

    /// Publish a message on behalf of the application.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is invalid, its namespace is unknown
    /// or the engine fails.
    pub async fn publish(
        &self,
        channel: &str,
        data: &[u8],
        client: &str,
        info: Option<ClientInfo>,
    ) -> Result<MessageId, NodeError> {
        let options = self.channel_options(channel)?;
        self.publish_with(channel, data, client, info, &options).await
    }

    /// Publish a message sent by a client.
    ///
    /// Requires the `publish` option of the channel's namespace unless the
    /// node is insecure.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::PermissionDenied`] if clients may not publish.
    pub async fn publish_client(
        &self,
        channel: &str,
        data: &[u8],
        client: &str,
        info: Option<ClientInfo>,
    ) -> Result<MessageId, NodeError> {
        let options = self.channel_options(channel)?;
        if !options.publish && !self.config.insecure {
            return Err(NodeError::PermissionDenied);
        }
        self.publish_with(channel, data, client, info, &options).await
    }

    async fn publish_with(
        &self,
        channel: &str,
        data: &[u8],
        client: &str,
        info: Option<ClientInfo>,
        options: &ChannelOptions,
    ) -> Result<MessageId, NodeError> {
        let message = Message::new(channel, data)
            .with_client(client)
            .with_info(info);
        let uid = message.uid.clone();
        let id = self.config.channel_id(channel);

        if options.watch {
            let admin = self.engine.publish_admin(AdminMessage::Message(message.clone()));
            self.engine.publish_message(&id, message, options).await?;
            admin.await?;
        } else {
            self.engine.publish_message(&id, message, options).await?;
        }
        Ok(uid)
    }

    /// Subscribe a connection to a channel.
    ///
    /// `info` identifies the connection; it is also what presence and
    /// join/leave notifications carry.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is invalid, the client may not
    /// subscribe or the engine fails.
    pub async fn subscribe(
        &self,
        info: &ClientInfo,
        channel: &str,
    ) -> Result<Subscription, NodeError> {
        let options = self.channel_options(channel)?;

        if info.is_anonymous() && !options.anonymous && !self.config.insecure {
            debug!(channel = %channel, client = %info.client, "Anonymous subscribe denied");
            return Err(NodeError::PermissionDenied);
        }
        if !self.config.user_allowed(channel, &info.user)
            || !self.config.client_allowed(channel, &info.client)
        {
            debug!(channel = %channel, client = %info.client, "Subscribe denied");
            return Err(NodeError::PermissionDenied);
        }

        let subscription = self.hub.subscribe(&info.client, channel)?;
        if let Err(e) = self.join(info, channel, subscription.first, &options).await {
            self.undo_subscribe(info, channel, &options).await;
            return Err(e);
        }
        Ok(subscription)
    }

    async fn join(
        &self,
        info: &ClientInfo,
        channel: &str,
        first: bool,
        options: &ChannelOptions,
    ) -> Result<(), NodeError> {
        let id = self.config.channel_id(channel);
        if first {
            self.sync_interest(channel).await?;
        }
        if options.presence {
            self.engine.add_presence(&id, &info.client, info.clone()).await?;
        }
        if options.join_leave {
            self.engine
                .publish_join(&id, JoinLeaveMessage::new(channel, info.clone()))
                .await?;
        }
        Ok(())
    }

    /// Best-effort removal of everything a failed subscribe left behind.
    async fn undo_subscribe(&self, info: &ClientInfo, channel: &str, options: &ChannelOptions) {
        if options.presence {
            let id = self.config.channel_id(channel);
            if let Err(e) = self.engine.remove_presence(&id, &info.client).await {
                warn!(channel = %channel, client = %info.client, error = %e, "Presence rollback failed");
            }
        }
        match self.hub.unsubscribe(&info.client, channel) {
            Ok(true) => {
                if let Err(e) = self.sync_interest(channel).await {
                    warn!(channel = %channel, error = %e, "Engine rollback failed");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(channel = %channel, client = %info.client, error = %e, "Hub rollback failed"),
        }
        debug!(channel = %channel, client = %info.client, "Rolled back failed subscribe");
    }

    /// Bring the engine's interest in a channel in line with the hub.
    ///
    /// Calls for one channel run one at a time and each acts on the hub
    /// state it finds, so the last call always leaves the engine subscribed
    /// exactly when local subscribers exist.
    async fn sync_interest(&self, channel: &str) -> Result<(), EngineError> {
        let lock = Arc::clone(&self.interest_locks.entry(channel.to_string()).or_default());
        let result = {
            let _guard = lock.lock().await;
            let id = self.config.channel_id(channel);
            if self.hub.subscriber_count(channel) > 0 {
                self.engine.subscribe(&id).await
            } else {
                self.engine.unsubscribe(&id).await
            }
        };
        drop(lock);
        self.interest_locks
            .remove_if(channel, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Unsubscribe a connection from a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not subscribed or the engine
    /// fails.
    pub async fn unsubscribe(&self, info: &ClientInfo, channel: &str) -> Result<(), NodeError> {
        let options = self.channel_options(channel)?;
        let last = self.hub.unsubscribe(&info.client, channel)?;
        self.leave(info, channel, last, &options).await
    }

    /// Remove a connection from every channel.
    ///
    /// Failures are logged and do not stop the cleanup of other channels.
    pub async fn disconnect(&self, info: &ClientInfo) {
        for removed in self.hub.remove_connection(&info.client) {
            let result = match self.config.resolve_options(&removed.channel) {
                Ok(options) => self.leave(info, &removed.channel, removed.last, &options).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                warn!(channel = %removed.channel, client = %info.client, error = %e, "Disconnect cleanup failed");
            }
        }
        debug!(client = %info.client, "Disconnected");
    }

    async fn leave(
        &self,
        info: &ClientInfo,
        channel: &str,
        last: bool,
        options: &ChannelOptions,
    ) -> Result<(), NodeError> {
        let id = self.config.channel_id(channel);
        if last {
            self.sync_interest(channel).await?;
        }
        if options.presence {
            self.engine.remove_presence(&id, &info.client).await?;
        }
        if options.join_leave {
            self.engine
                .publish_leave(&id, JoinLeaveMessage::new(channel, info.clone()))
                .await?;
        }
        Ok(())
    }

    /// Keep a connection's presence alive.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not subscribed or the engine
    /// fails.
    pub async fn refresh_presence(&self, info: &ClientInfo, channel: &str) -> Result<(), NodeError> {
        let options = self.channel_options(channel)?;
        if !self.hub.is_subscribed(&info.client, channel) {
            return Err(HubError::NotSubscribed(channel.to_string()).into());
        }
        if options.presence {
            let id = self.config.channel_id(channel);
            self.engine.add_presence(&id, &info.client, info.clone()).await?;
        }
        Ok(())
    }

    /// Connections present in a channel.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NotAvailable`] if presence is disabled.
    pub async fn presence(&self, channel: &str) -> Result<HashMap<ConnId, ClientInfo>, NodeError> {
        let options = self.channel_options(channel)?;
        if !options.presence {
            return Err(NodeError::NotAvailable);
        }
        Ok(self.engine.presence(&self.config.channel_id(channel)).await?)
    }

    /// Retained messages of a channel, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NotAvailable`] if history is disabled.
    pub async fn history(&self, channel: &str, limit: usize) -> Result<Vec<Message>, NodeError> {
        let options = self.channel_options(channel)?;
        if !options.history_enabled() {
            return Err(NodeError::NotAvailable);
        }
        let id = self.config.channel_id(channel);
        Ok(self.engine.history(&id, HistoryOptions { limit }).await?)
    }

    /// Messages a client missed since `last_uid`.
    ///
    /// If `last_uid` is still in history, everything published after it is
    /// returned and `recovered` is set. Otherwise the whole retained history
    /// is returned and the client has to assume a gap.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NotAvailable`] if recovery is disabled.
    pub async fn recover(&self, channel: &str, last_uid: &str) -> Result<Recovery, NodeError> {
        let options = self.channel_options(channel)?;
        if !options.recover {
            return Err(NodeError::NotAvailable);
        }
        if !options.recover_enabled() {
            return Ok(Recovery::default());
        }

        let id = self.config.channel_id(channel);
        let history = self.engine.history(&id, HistoryOptions::default()).await?;
        let recovery = match history.iter().position(|m| m.uid == last_uid) {
            Some(pos) => Recovery {
                messages: history[pos + 1..].to_vec(),
                recovered: true,
            },
            None => Recovery {
                messages: history,
                recovered: false,
            },
        };
        debug!(
            channel = %channel,
            messages = recovery.messages.len(),
            recovered = recovery.recovered,
            "Recovery"
        );
        Ok(recovery)
    }

    fn channel_options(&self, channel: &str) -> Result<ChannelOptions, NodeError> {
        self.config
            .validate_channel(channel)
            .map_err(NodeError::InvalidChannel)?;
        Ok(self.config.resolve_options(channel)?)
    }

    fn spawn_control_listener(&self) {
        let mut control = self.hub.control_receiver();
        let mut shutdown = self.shutdown.subscribe();
        let peers = Arc::clone(&self.peers);
        let uid = self.uid.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    message = control.recv() => match message {
                        Ok(message) => {
                            if message.uid == uid {
                                continue;
                            }
                            match &message.command {
                                ControlCommand::Ping(info) => {
                                    let known = peers
                                        .insert(message.uid.clone(), Peer { info: info.clone(), seen: Instant::now() })
                                        .is_some();
                                    if !known {
                                        info!(peer = %message.uid, name = %info.name, "Node joined");
                                    }
                                }
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Control listener lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn spawn_ping_loop(&self) {
        let period = self.config.node_ping_interval;
        if period.is_zero() {
            return;
        }
        let mut shutdown = self.shutdown.subscribe();
        let engine = Arc::clone(&self.engine);
        let config = Arc::clone(&self.config);
        let hub = Arc::clone(&self.hub);
        let uid = self.uid.clone();
        let started_at = self.started_at;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let info = node_info(&uid, &config, &hub, started_at);
                        let ping = ControlMessage::new(uid.clone(), ControlCommand::Ping(info));
                        if let Err(e) = engine.publish_control(ping).await {
                            warn!(error = %e, "Node ping failed");
                        }
                    }
                }
            }
        });
    }

    fn spawn_peer_cleanup(&self) {
        let period = self.config.node_info_clean_interval;
        if period.is_zero() {
            return;
        }
        let max_delay = self.config.node_info_max_delay;
        let mut shutdown = self.shutdown.subscribe();
        let peers = Arc::clone(&self.peers);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => prune_peers(&peers, max_delay),
                }
            }
        });
    }

    fn spawn_admin_stats(&self) {
        let period = self.config.node_metrics_interval;
        if period.is_zero() || !self.config.admin {
            return;
        }
        let mut shutdown = self.shutdown.subscribe();
        let engine = Arc::clone(&self.engine);
        let config = Arc::clone(&self.config);
        let hub = Arc::clone(&self.hub);
        let uid = self.uid.clone();
        let started_at = self.started_at;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let info = node_info(&uid, &config, &hub, started_at);
                        if let Err(e) = engine.publish_admin(AdminMessage::Node(info)).await {
                            warn!(error = %e, "Publishing node stats failed");
                        }
                    }
                }
            }
        });
    }
}

fn node_info(uid: &str, config: &Config, hub: &Hub, started_at: i64) -> NodeInfo {
    let stats = hub.stats();
    NodeInfo {
        uid: uid.to_string(),
        name: config.name.clone(),
        version: config.version.clone(),
        num_clients: stats.connection_count,
        num_channels: stats.channel_count,
        started_at,
    }
}

fn prune_peers(peers: &DashMap<String, Peer>, max_delay: Duration) {
    let now = Instant::now();
    peers.retain(|uid, peer| {
        let alive = now.duration_since(peer.seen) <= max_delay;
        if !alive {
            info!(peer = %uid, "Node timed out");
        }
        alive
    });
}
