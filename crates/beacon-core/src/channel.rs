//! Channel naming.
//!
//! Channel names are structured strings. With the default separators:
//!
//! - `news:tech` - channel `tech` in namespace `news`
//! - `$secret` - private channel
//! - `dialog#42,57` - channel limited to users `42` and `57`
//! - `inbox&conn-1` - channel limited to connection `conn-1`
//!
//! All separators come from [`Config`], never from these defaults.

use crate::config::Config;
use std::fmt;

/// Routing key of a channel inside the engine.
///
/// Built from a channel name with [`Config::channel_id`] so that several
/// brokers with different prefixes can share one backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(String);

impl ChannelId {
    /// Create a channel ID from a raw routing key.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

const MESSAGE_SUFFIX: &str = ".message.";

impl Config {
    /// Validate a channel name.
    ///
    /// # Errors
    ///
    /// Returns an error message if the channel name is invalid.
    pub fn validate_channel(&self, name: &str) -> Result<(), &'static str> {
        if name.is_empty() {
            return Err("Channel name cannot be empty");
        }
        if name.len() > self.max_channel_length {
            return Err("Channel name too long");
        }
        Ok(())
    }

    /// Namespace key of a channel, empty when the channel has none.
    ///
    /// A private channel prefix is ignored when looking for the namespace.
    #[must_use]
    pub fn namespace_key<'a>(&self, channel: &'a str) -> &'a str {
        let name = channel
            .strip_prefix(self.private_channel_prefix.as_str())
            .unwrap_or(channel);
        if self.namespace_channel_boundary.is_empty() {
            return "";
        }
        name.split_once(self.namespace_channel_boundary.as_str())
            .map_or("", |(key, _)| key)
    }

    /// Check if the channel is private.
    #[must_use]
    pub fn is_private(&self, channel: &str) -> bool {
        !self.private_channel_prefix.is_empty() && channel.starts_with(&self.private_channel_prefix)
    }

    /// Check if a user may subscribe to the channel.
    ///
    /// Channels without a user boundary allow everybody.
    #[must_use]
    pub fn user_allowed(&self, channel: &str, user: &str) -> bool {
        if self.user_channel_boundary.is_empty() {
            return true;
        }
        let Some((_, users)) = channel.rsplit_once(self.user_channel_boundary.as_str()) else {
            return true;
        };
        if self.user_channel_separator.is_empty() {
            return users == user;
        }
        users
            .split(self.user_channel_separator.as_str())
            .any(|allowed| allowed == user)
    }

    /// Check if a connection may subscribe to the channel.
    ///
    /// Channels without a client boundary allow every connection.
    #[must_use]
    pub fn client_allowed(&self, channel: &str, client: &str) -> bool {
        if self.client_channel_boundary.is_empty() {
            return true;
        }
        channel
            .rsplit_once(self.client_channel_boundary.as_str())
            .map_or(true, |(_, owner)| owner == client)
    }

    /// Engine routing key for a channel.
    #[must_use]
    pub fn channel_id(&self, channel: &str) -> ChannelId {
        ChannelId(format!("{}{}{}", self.channel_prefix, MESSAGE_SUFFIX, channel))
    }

    /// Channel name behind a routing key built by [`Config::channel_id`].
    #[must_use]
    pub fn channel_from_id<'a>(&self, id: &'a ChannelId) -> Option<&'a str> {
        id.as_str()
            .strip_prefix(self.channel_prefix.as_str())?
            .strip_prefix(MESSAGE_SUFFIX)
    }

    /// Routing key for admin traffic.
    #[must_use]
    pub fn admin_channel_id(&self) -> ChannelId {
        ChannelId(format!("{}.admin", self.channel_prefix))
    }

    /// Routing key for control traffic.
    #[must_use]
    pub fn control_channel_id(&self) -> ChannelId {
        ChannelId(format!("{}.control", self.channel_prefix))
    }
}
