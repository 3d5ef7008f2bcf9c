//! Local subscriber hub.
//!
//! The hub tracks which connections on this node are subscribed to which
//! channels and fans deliveries out to them. Engines deliver into the hub;
//! transports read from the receivers it hands out.

use crate::config::Config;
use beacon_protocol::{AdminMessage, ConnId, ControlMessage, JoinLeaveMessage, Message};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// Not subscribed to channel.
    #[error("Not subscribed to channel: {0}")]
    NotSubscribed(String),

    /// Already subscribed to channel.
    #[error("Already subscribed to channel: {0}")]
    AlreadySubscribed(String),

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,
}

impl HubError {
    /// Description safe to relay to clients.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::NotSubscribed(_) => "not subscribed",
            Self::AlreadySubscribed(_) => "already subscribed",
            Self::MaxSubscriptionsReached => "limit exceeded",
        }
    }
}

/// Something delivered to channel subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A published message.
    Message(Message),
    /// A client joined.
    Join(JoinLeaveMessage),
    /// A client left.
    Leave(JoinLeaveMessage),
}

impl Delivery {
    /// Channel the delivery belongs to.
    #[must_use]
    pub fn channel(&self) -> &str {
        match self {
            Self::Message(m) => &m.channel,
            Self::Join(jl) | Self::Leave(jl) => &jl.channel,
        }
    }
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum subscriptions per connection.
    pub client_channel_limit: usize,
    /// Broadcast capacity per channel.
    pub channel_capacity: usize,
    /// Broadcast capacity for admin and control fan-out.
    pub system_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_channel_limit: 100,
            channel_capacity: 1024,
            system_capacity: 256,
        }
    }
}

impl From<&Config> for HubConfig {
    fn from(config: &Config) -> Self {
        Self {
            client_channel_limit: config.client_channel_limit,
            ..Self::default()
        }
    }
}

/// Result of a successful subscribe.
#[derive(Debug)]
pub struct Subscription {
    /// Deliveries for the channel.
    pub receiver: broadcast::Receiver<Arc<Delivery>>,
    /// Whether this is the first local subscriber of the channel.
    pub first: bool,
}

/// A channel a connection was removed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribed {
    /// Channel name.
    pub channel: String,
    /// Whether the channel has no local subscribers left.
    pub last: bool,
}

struct ChannelEntry {
    sender: broadcast::Sender<Arc<Delivery>>,
    subscribers: HashSet<ConnId>,
}

impl ChannelEntry {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: HashSet::new(),
        }
    }
}

/// Per-node registry of local subscriptions.
pub struct Hub {
    /// Channels with at least one local subscriber.
    channels: DashMap<String, ChannelEntry>,
    /// Connection subscriptions (connection_id -> set of channel names).
    subscriptions: DashMap<ConnId, DashSet<String>>,
    admin: broadcast::Sender<Arc<AdminMessage>>,
    control: broadcast::Sender<Arc<ControlMessage>>,
    config: HubConfig,
}

impl Hub {
    /// Create a new hub with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a new hub with custom configuration.
    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        let (admin, _) = broadcast::channel(config.system_capacity);
        let (control, _) = broadcast::channel(config.system_capacity);
        Self {
            channels: DashMap::new(),
            subscriptions: DashMap::new(),
            admin,
            control,
            config,
        }
    }

    /// Subscribe a connection to a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if already subscribed or the per-connection limit is
    /// reached.
    pub fn subscribe(&self, connection_id: &str, channel: &str) -> Result<Subscription, HubError> {
        let conn_subs = self
            .subscriptions
            .entry(connection_id.to_string())
            .or_default();

        if conn_subs.contains(channel) {
            return Err(HubError::AlreadySubscribed(channel.to_string()));
        }
        if conn_subs.len() >= self.config.client_channel_limit {
            return Err(HubError::MaxSubscriptionsReached);
        }

        let mut entry = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| ChannelEntry::new(self.config.channel_capacity));

        let first = entry.subscribers.is_empty();
        entry.subscribers.insert(connection_id.to_string());
        let receiver = entry.sender.subscribe();
        conn_subs.insert(channel.to_string());

        debug!(
            channel = %channel,
            connection = %connection_id,
            subscribers = entry.subscribers.len(),
            "Subscribed"
        );

        Ok(Subscription { receiver, first })
    }

    /// Unsubscribe a connection from a channel.
    ///
    /// Returns `true` if the channel has no local subscribers left.
    ///
    /// # Errors
    ///
    /// Returns an error if not subscribed.
    pub fn unsubscribe(&self, connection_id: &str, channel: &str) -> Result<bool, HubError> {
        let removed = self
            .subscriptions
            .get(connection_id)
            .and_then(|subs| subs.remove(channel))
            .is_some();
        if !removed {
            return Err(HubError::NotSubscribed(channel.to_string()));
        }
        self.subscriptions
            .remove_if(connection_id, |_, subs| subs.is_empty());

        Ok(self.detach(connection_id, channel))
    }

    /// Remove a connection from every channel it is subscribed to.
    pub fn remove_connection(&self, connection_id: &str) -> Vec<Unsubscribed> {
        let Some((_, channels)) = self.subscriptions.remove(connection_id) else {
            return Vec::new();
        };

        let removed: Vec<Unsubscribed> = channels
            .into_iter()
            .map(|channel| {
                let last = self.detach(connection_id, &channel);
                Unsubscribed { channel, last }
            })
            .collect();

        debug!(connection = %connection_id, channels = removed.len(), "Removed connection");
        removed
    }

    /// Remove a subscriber under the channel's entry lock, dropping the
    /// channel when it empties. Returns `true` if no local subscriber is left.
    fn detach(&self, connection_id: &str, channel: &str) -> bool {
        let Entry::Occupied(mut entry) = self.channels.entry(channel.to_string()) else {
            return true;
        };
        entry.get_mut().subscribers.remove(connection_id);
        let remaining = entry.get().subscribers.len();
        debug!(
            channel = %channel,
            connection = %connection_id,
            subscribers = remaining,
            "Unsubscribed"
        );
        if remaining > 0 {
            return false;
        }
        entry.remove();
        debug!(channel = %channel, "Removed empty channel");
        true
    }

    /// Deliver to local subscribers of a channel.
    ///
    /// Returns the number of receivers reached.
    pub fn deliver(&self, channel: &str, delivery: Delivery) -> usize {
        let Some(entry) = self.channels.get(channel) else {
            trace!(channel = %channel, "No local subscribers");
            return 0;
        };
        let count = entry.sender.send(Arc::new(delivery)).unwrap_or_default();
        trace!(channel = %channel, recipients = count, "Delivered");
        count
    }

    /// Receiver for admin messages.
    #[must_use]
    pub fn admin_receiver(&self) -> broadcast::Receiver<Arc<AdminMessage>> {
        self.admin.subscribe()
    }

    /// Deliver to admin observers.
    pub fn deliver_admin(&self, message: AdminMessage) -> usize {
        self.admin.send(Arc::new(message)).unwrap_or_default()
    }

    /// Receiver for control messages.
    #[must_use]
    pub fn control_receiver(&self) -> broadcast::Receiver<Arc<ControlMessage>> {
        self.control.subscribe()
    }

    /// Deliver a control message to local listeners.
    pub fn deliver_control(&self, message: ControlMessage) -> usize {
        self.control.send(Arc::new(message)).unwrap_or_default()
    }

    /// Get the local subscriber count for a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }

    /// Check if a connection is subscribed to a channel.
    #[must_use]
    pub fn is_subscribed(&self, connection_id: &str, channel: &str) -> bool {
        self.subscriptions
            .get(connection_id)
            .is_some_and(|subs| subs.contains(channel))
    }

    /// Names of channels with local subscribers.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            channel_count: self.channels.len(),
            connection_count: self.subscriptions.len(),
            total_subscriptions: self.subscriptions.iter().map(|s| s.len()).sum(),
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// Hub statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubStats {
    /// Number of channels with local subscribers.
    pub channel_count: usize,
    /// Number of subscribed connections.
    pub connection_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_subscribe_unsubscribe() {
        let hub = Hub::new();

        let sub = hub.subscribe("conn-1", "news").unwrap();
        assert!(sub.first);
        assert_eq!(hub.subscriber_count("news"), 1);

        let sub2 = hub.subscribe("conn-2", "news").unwrap();
        assert!(!sub2.first);

        assert!(!hub.unsubscribe("conn-1", "news").unwrap());
        assert!(hub.unsubscribe("conn-2", "news").unwrap());
        assert_eq!(hub.subscriber_count("news"), 0);
        assert!(hub.channels().is_empty());
        assert_eq!(hub.stats().connection_count, 0);
    }

    #[test]
    fn test_hub_deliver() {
        let hub = Hub::new();

        let mut rx1 = hub.subscribe("conn-1", "test").unwrap().receiver;
        let mut rx2 = hub.subscribe("conn-2", "test").unwrap().receiver;

        let count = hub.deliver("test", Delivery::Message(Message::new("test", b"1")));
        assert_eq!(count, 2);

        assert_eq!(rx1.try_recv().unwrap().channel(), "test");
        assert!(rx2.try_recv().is_ok());
        assert_eq!(hub.deliver("other", Delivery::Message(Message::new("other", b"1"))), 0);
    }

    #[test]
    fn test_hub_already_subscribed() {
        let hub = Hub::new();

        let _sub = hub.subscribe("conn-1", "test").unwrap();
        assert!(matches!(
            hub.subscribe("conn-1", "test"),
            Err(HubError::AlreadySubscribed(_))
        ));
        assert!(matches!(
            hub.unsubscribe("conn-1", "missing"),
            Err(HubError::NotSubscribed(_))
        ));
    }

    #[test]
    fn test_hub_channel_limit() {
        let hub = Hub::with_config(HubConfig {
            client_channel_limit: 2,
            ..HubConfig::default()
        });

        let _a = hub.subscribe("conn-1", "a").unwrap();
        let _b = hub.subscribe("conn-1", "b").unwrap();
        assert!(matches!(
            hub.subscribe("conn-1", "c"),
            Err(HubError::MaxSubscriptionsReached)
        ));
        assert!(hub.subscribe("conn-2", "c").is_ok());
    }

    #[test]
    fn test_hub_remove_connection() {
        let hub = Hub::new();

        let _rx1 = hub.subscribe("conn-1", "channel-1").unwrap();
        let _rx2 = hub.subscribe("conn-1", "channel-2").unwrap();
        let _rx3 = hub.subscribe("conn-2", "channel-2").unwrap();

        let mut removed = hub.remove_connection("conn-1");
        removed.sort_by(|a, b| a.channel.cmp(&b.channel));
        assert_eq!(
            removed,
            vec![
                Unsubscribed { channel: "channel-1".into(), last: true },
                Unsubscribed { channel: "channel-2".into(), last: false },
            ]
        );
        assert_eq!(hub.channels(), vec!["channel-2".to_string()]);
        assert!(hub.remove_connection("conn-1").is_empty());
    }

    #[test]
    fn test_hub_stats() {
        let hub = Hub::new();

        let _rx1 = hub.subscribe("conn-1", "channel-1").unwrap();
        let _rx2 = hub.subscribe("conn-1", "channel-2").unwrap();
        let _rx3 = hub.subscribe("conn-2", "channel-1").unwrap();

        let stats = hub.stats();
        assert_eq!(stats.channel_count, 2);
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.total_subscriptions, 3);
        assert!(hub.is_subscribed("conn-2", "channel-1"));
        assert!(!hub.is_subscribed("conn-2", "channel-2"));
    }

    #[test]
    fn test_hub_admin_and_control_fanout() {
        let hub = Hub::new();
        let mut admin = hub.admin_receiver();
        let mut control = hub.control_receiver();

        hub.deliver_admin(AdminMessage::Message(Message::new("c", b"1")));
        hub.deliver_control(ControlMessage::new(
            "node-1",
            beacon_protocol::ControlCommand::Ping(Default::default()),
        ));

        assert!(matches!(*admin.try_recv().unwrap(), AdminMessage::Message(_)));
        assert_eq!(control.try_recv().unwrap().uid, "node-1");
    }

    #[test]
    fn test_hub_first_and_last_balance_under_churn() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hub = Hub::new();
        let firsts = AtomicUsize::new(0);
        let lasts = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for t in 0..8 {
                let (hub, firsts, lasts) = (&hub, &firsts, &lasts);
                scope.spawn(move || {
                    let conn = format!("conn-{t}");
                    for _ in 0..500 {
                        if hub.subscribe(&conn, "busy").unwrap().first {
                            firsts.fetch_add(1, Ordering::SeqCst);
                        }
                        if hub.unsubscribe(&conn, "busy").unwrap() {
                            lasts.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        // Every emptying of the channel is reported once, and each one is
        // matched by exactly one first subscriber.
        assert_eq!(
            firsts.load(Ordering::SeqCst),
            lasts.load(Ordering::SeqCst)
        );
        assert_eq!(hub.subscriber_count("busy"), 0);
        assert!(hub.channels().is_empty());
    }

    #[test]
    fn test_hub_last_means_channel_removed() {
        let hub = Hub::new();
        let _a = hub.subscribe("conn-1", "c").unwrap();
        let _b = hub.subscribe("conn-2", "c").unwrap();

        assert!(!hub.unsubscribe("conn-1", "c").unwrap());
        assert_eq!(hub.channels(), vec!["c".to_string()]);
        assert!(hub.unsubscribe("conn-2", "c").unwrap());
        assert!(hub.channels().is_empty());
        assert!(hub.subscribe("conn-1", "c").unwrap().first);
    }
}
