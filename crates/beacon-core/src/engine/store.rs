//! In-memory presence and history storage.
//!
//! Shared by every engine variant. Entries carry a deadline; reads filter
//! expired entries lazily and [`MemoryStore::sweep_expired`] evicts them.
//! Deadlines are `tokio::time::Instant`s, so a paused test clock drives expiry.

use crate::channel::ChannelId;
use crate::config::ChannelOptions;
use beacon_protocol::{ClientInfo, ConnId, Message};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct HistoryEntry {
    message: Message,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    info: ClientInfo,
    expires_at: Instant,
}

/// Presence and history for all channels.
#[derive(Debug)]
pub struct MemoryStore {
    history: DashMap<ChannelId, VecDeque<HistoryEntry>>,
    presence: DashMap<ChannelId, HashMap<ConnId, PresenceEntry>>,
    presence_expire: Duration,
}

impl MemoryStore {
    /// Create a store whose presence entries live for `presence_expire`
    /// unless refreshed.
    #[must_use]
    pub fn new(presence_expire: Duration) -> Self {
        Self {
            history: DashMap::new(),
            presence: DashMap::new(),
            presence_expire,
        }
    }

    /// Append a message to channel history.
    ///
    /// `inactive` tells whether the publishing node had no local subscriber
    /// for the channel. Returns `true` if the message was stored.
    pub fn add_history(
        &self,
        channel: &ChannelId,
        message: &Message,
        options: &ChannelOptions,
        inactive: bool,
    ) -> bool {
        if !options.history_enabled() {
            return false;
        }
        if options.history_drop_inactive && inactive {
            trace!(channel = %channel, "Skipping history for inactive channel");
            return false;
        }

        let now = Instant::now();
        let mut entries = self.history.entry(channel.clone()).or_default();
        entries.retain(|e| e.expires_at > now);
        entries.push_back(HistoryEntry {
            message: message.clone(),
            expires_at: now + options.history_ttl(),
        });
        while entries.len() > options.history_size {
            entries.pop_front();
        }
        true
    }

    /// Unexpired history, oldest first.
    ///
    /// With `limit > 0` only the newest `limit` messages are returned.
    #[must_use]
    pub fn history(&self, channel: &ChannelId, limit: usize) -> Vec<Message> {
        let Some(entries) = self.history.get(channel) else {
            return Vec::new();
        };
        let now = Instant::now();
        let live: Vec<&HistoryEntry> = entries.iter().filter(|e| e.expires_at > now).collect();
        let skip = if limit > 0 {
            live.len().saturating_sub(limit)
        } else {
            0
        };
        live.into_iter()
            .skip(skip)
            .map(|e| e.message.clone())
            .collect()
    }

    /// Set or refresh presence of a connection.
    pub fn add_presence(&self, channel: &ChannelId, connection_id: &str, info: ClientInfo) {
        let expires_at = Instant::now() + self.presence_expire;
        let is_new = self
            .presence
            .entry(channel.clone())
            .or_default()
            .insert(connection_id.to_string(), PresenceEntry { info, expires_at })
            .is_none();
        if is_new {
            debug!(channel = %channel, connection = %connection_id, "Presence: member joined");
        }
    }

    /// Remove presence of a connection.
    pub fn remove_presence(&self, channel: &ChannelId, connection_id: &str) {
        let removed = self
            .presence
            .get_mut(channel)
            .and_then(|mut members| members.remove(connection_id))
            .is_some();
        if removed {
            debug!(channel = %channel, connection = %connection_id, "Presence: member left");
        }
        self.presence.remove_if(channel, |_, members| members.is_empty());
    }

    /// Unexpired presence of a channel.
    #[must_use]
    pub fn presence(&self, channel: &ChannelId) -> HashMap<ConnId, ClientInfo> {
        let now = Instant::now();
        self.presence
            .get(channel)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, e)| e.expires_at > now)
                    .map(|(id, e)| (id.clone(), e.info.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Evict expired history and presence.
    ///
    /// Returns the number of evicted history entries and presence entries.
    pub fn sweep_expired(&self) -> (usize, usize) {
        let now = Instant::now();
        let mut history_removed = 0;
        let mut presence_removed = 0;

        self.history.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| e.expires_at > now);
            history_removed += before - entries.len();
            !entries.is_empty()
        });
        self.presence.retain(|channel, members| {
            let before = members.len();
            members.retain(|id, e| {
                let alive = e.expires_at > now;
                if !alive {
                    debug!(channel = %channel, connection = %id, "Presence: pruned stale member");
                }
                alive
            });
            presence_removed += before - members.len();
            !members.is_empty()
        });

        if history_removed + presence_removed > 0 {
            trace!(history = history_removed, presence = presence_removed, "Swept expired entries");
        }
        (history_removed, presence_removed)
    }

    /// Number of channels holding history.
    #[must_use]
    pub fn history_channel_count(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(size: usize, lifetime: u64) -> ChannelOptions {
        ChannelOptions {
            history_size: size,
            history_lifetime: lifetime,
            ..ChannelOptions::default()
        }
    }

    fn uids(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.uid.clone()).collect()
    }

    #[tokio::test]
    async fn test_history_bound() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let channel = ChannelId::from("c");
        let published: Vec<Message> = (0..5)
            .map(|i| Message::new("c", i.to_string().as_bytes()))
            .collect();

        for msg in &published {
            assert!(store.add_history(&channel, msg, &options(3, 60), false));
        }

        let history = store.history(&channel, 0);
        assert_eq!(uids(&history), uids(&published[2..]));
        assert_eq!(uids(&store.history(&channel, 2)), uids(&published[3..]));
        assert_eq!(store.history(&channel, 10).len(), 3);
    }

    #[tokio::test]
    async fn test_history_disabled() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let channel = ChannelId::from("c");
        let msg = Message::new("c", b"1");

        assert!(!store.add_history(&channel, &msg, &options(0, 60), false));
        assert!(!store.add_history(&channel, &msg, &options(10, 0), false));
        assert!(store.history(&channel, 0).is_empty());
    }

    #[tokio::test]
    async fn test_history_drop_inactive() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let channel = ChannelId::from("c");
        let msg = Message::new("c", b"1");
        let drop_inactive = ChannelOptions {
            history_drop_inactive: true,
            ..options(10, 60)
        };

        assert!(!store.add_history(&channel, &msg, &drop_inactive, true));
        assert!(store.add_history(&channel, &msg, &drop_inactive, false));
        assert!(store.add_history(&channel, &msg, &options(10, 60), true));
        assert_eq!(store.history(&channel, 0).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_expiry() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let channel = ChannelId::from("c");

        store.add_history(&channel, &Message::new("c", b"1"), &options(10, 5), false);
        tokio::time::advance(Duration::from_secs(3)).await;
        store.add_history(&channel, &Message::new("c", b"2"), &options(10, 5), false);
        assert_eq!(store.history(&channel, 0).len(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        let history = store.history(&channel, 0);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].data.as_bytes(), b"2");

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.history(&channel, 0).is_empty());
        assert_eq!(store.sweep_expired(), (2, 0));
        assert_eq!(store.history_channel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_expiry_and_refresh() {
        let store = MemoryStore::new(Duration::from_secs(10));
        let channel = ChannelId::from("c");
        let info = ClientInfo::new(
            "42",
            "conn-1",
            Some(beacon_protocol::RawPayload::from_json(&json!({"name": "Alice"}))),
            None,
        );

        store.add_presence(&channel, "conn-1", info.clone());
        store.add_presence(&channel, "conn-2", ClientInfo::new("7", "conn-2", None, None));
        assert_eq!(store.presence(&channel).len(), 2);

        tokio::time::advance(Duration::from_secs(6)).await;
        store.add_presence(&channel, "conn-1", info.clone());

        tokio::time::advance(Duration::from_secs(6)).await;
        let present = store.presence(&channel);
        assert_eq!(present.len(), 1);
        assert_eq!(present.get("conn-1"), Some(&info));

        assert_eq!(store.sweep_expired(), (0, 1));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(store.presence(&channel).is_empty());
    }

    #[tokio::test]
    async fn test_presence_remove() {
        let store = MemoryStore::new(Duration::from_secs(10));
        let channel = ChannelId::from("c");

        assert!(store.presence(&channel).is_empty());
        store.add_presence(&channel, "conn-1", ClientInfo::default());
        store.remove_presence(&channel, "conn-1");
        store.remove_presence(&channel, "conn-1");
        assert!(store.presence(&channel).is_empty());
    }
}
