//! Broker configuration and namespace resolution.
//!
//! A [`Config`] is built once at process start (defaults overlaid with user
//! values), validated with [`Config::validate`] and then shared read-only.
//! Channel policy comes from [`Config::resolve_options`], which maps a channel
//! name to the options of its namespace.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Pattern every namespace name must match.
pub const NAMESPACE_PATTERN: &str = "^[-a-zA-Z0-9_]{2,}$";

/// Name of a namespace, unique within a config.
pub type NamespaceKey = String;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Namespace name does not match [`NAMESPACE_PATTERN`].
    #[error("config error: wrong namespace name: {0}")]
    InvalidNamespaceName(String),

    /// Two namespaces share a name.
    #[error("config error: namespace name must be unique: {0}")]
    DuplicateNamespace(String),

    /// Channel refers to a namespace that is not configured.
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    /// Namespace pattern failed to compile.
    #[error("config error: {0}")]
    Pattern(#[from] regex::Error),
}

impl ConfigError {
    /// Description safe to relay to clients.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::NamespaceNotFound(_) => "namespace not found",
            _ => "internal server error",
        }
    }
}

/// Channel policy for a namespace (or the whole broker).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    /// Mirror published messages to admin observers.
    pub watch: bool,
    /// Allow clients to publish directly.
    pub publish: bool,
    /// Allow subscribers with an empty user ID.
    pub anonymous: bool,
    /// Maintain the set of present connections.
    pub presence: bool,
    /// Emit join/leave notifications.
    pub join_leave: bool,
    /// Maximum retained messages, 0 disables history.
    pub history_size: usize,
    /// Seconds a history entry lives.
    pub history_lifetime: u64,
    /// Allow missed-message recovery from history.
    pub recover: bool,
    /// Skip history for publishes with no local subscriber.
    pub history_drop_inactive: bool,
}

impl ChannelOptions {
    /// Check if history is retained at all.
    ///
    /// A zero lifetime expires entries on arrival, so it counts as disabled.
    #[must_use]
    pub fn history_enabled(&self) -> bool {
        self.history_size > 0 && self.history_lifetime > 0
    }

    /// History entry lifetime.
    #[must_use]
    pub fn history_ttl(&self) -> Duration {
        Duration::from_secs(self.history_lifetime)
    }

    /// Check if recovery can do anything. `recover` without history is a no-op.
    #[must_use]
    pub fn recover_enabled(&self) -> bool {
        self.recover && self.history_enabled()
    }
}

/// A named group of channels sharing [`ChannelOptions`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    /// Unique namespace name.
    pub name: NamespaceKey,
    /// Options for channels in this namespace.
    #[serde(flatten)]
    pub options: ChannelOptions,
}

impl Namespace {
    /// Create a namespace.
    #[must_use]
    pub fn new(name: impl Into<NamespaceKey>, options: ChannelOptions) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }
}

/// A credential that never shows up in logs or serialized config.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Create a secret.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The secret value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check if no secret is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Broker configuration.
///
/// Intervals are expressed in whole seconds in serialized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node version string.
    pub version: String,
    /// Node name, human readable and unique within a cluster.
    pub name: String,
    /// Debug mode.
    pub debug: bool,

    /// Enable admin endpoints.
    pub admin: bool,
    /// Admin password.
    #[serde(skip_serializing)]
    pub admin_password: Secret,
    /// Secret for admin tokens.
    #[serde(skip_serializing)]
    pub admin_secret: Secret,
    /// Enable the admin web interface.
    pub web: bool,

    /// Prefix of every routing key this broker uses.
    pub channel_prefix: String,
    /// Maximum channel name length in bytes.
    pub max_channel_length: usize,

    /// How often clients are pinged.
    #[serde(with = "secs")]
    pub ping_interval: Duration,
    /// How often this node announces itself to peers.
    #[serde(with = "secs")]
    pub node_ping_interval: Duration,
    /// How often stale peer info is dropped.
    #[serde(with = "secs")]
    pub node_info_clean_interval: Duration,
    /// How long peer info is considered current.
    #[serde(with = "secs")]
    pub node_info_max_delay: Duration,
    /// How often node statistics are reported to admins.
    #[serde(with = "secs")]
    pub node_metrics_interval: Duration,

    /// How often clients refresh presence.
    #[serde(with = "secs")]
    pub presence_ping_interval: Duration,
    /// How long a presence entry lives without refresh.
    #[serde(with = "secs")]
    pub presence_expire_interval: Duration,

    /// Grace period for refreshing an expiring connection.
    #[serde(with = "secs")]
    pub expired_connection_close_delay: Duration,
    /// Delay before closing connections that never authenticated.
    #[serde(with = "secs")]
    pub stale_connection_close_delay: Duration,
    /// Send deadline per client message, zero for none.
    #[serde(with = "secs")]
    pub message_send_timeout: Duration,

    /// Maximum client request size in bytes.
    pub client_request_max_size: usize,
    /// Maximum client queue size in bytes.
    pub client_queue_max_size: usize,
    /// Initial client queue slots.
    pub client_queue_initial_capacity: usize,
    /// Maximum channels per connection.
    pub client_channel_limit: usize,

    /// Prefix marking a channel as private.
    pub private_channel_prefix: String,
    /// Separator after the namespace part of a channel name.
    pub namespace_channel_boundary: String,
    /// Separator before the allowed-users part of a channel name.
    pub user_channel_boundary: String,
    /// Separator between allowed users.
    pub user_channel_separator: String,
    /// Separator before the owning connection ID.
    pub client_channel_boundary: String,

    /// No authentication, anonymous access and publishing everywhere.
    pub insecure: bool,
    /// No signature checks on API calls.
    pub insecure_api: bool,
    /// No authentication on admin endpoints.
    pub insecure_admin: bool,

    /// Secret for API signatures and connection tokens.
    #[serde(skip_serializing)]
    pub secret: Secret,

    /// Connection lifetime in seconds, 0 for unlimited.
    pub connection_lifetime: u64,

    /// Options for channels outside any namespace.
    pub channel_options: ChannelOptions,
    /// Namespaces with their own options.
    pub namespaces: Vec<Namespace>,
}

const DEFAULT_NODE_PING_SECS: u64 = 5;

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "-".to_string(),
            name: "beacon".to_string(),
            debug: false,
            admin: false,
            admin_password: Secret::default(),
            admin_secret: Secret::default(),
            web: false,
            channel_prefix: "beacon".to_string(),
            max_channel_length: 255,
            ping_interval: Duration::from_secs(25),
            node_ping_interval: Duration::from_secs(DEFAULT_NODE_PING_SECS),
            node_info_clean_interval: Duration::from_secs(DEFAULT_NODE_PING_SECS * 3),
            node_info_max_delay: Duration::from_secs(DEFAULT_NODE_PING_SECS * 2 + 1),
            node_metrics_interval: Duration::from_secs(60),
            presence_ping_interval: Duration::from_secs(25),
            presence_expire_interval: Duration::from_secs(60),
            expired_connection_close_delay: Duration::from_secs(25),
            stale_connection_close_delay: Duration::from_secs(25),
            message_send_timeout: Duration::ZERO,
            client_request_max_size: 64 * 1024,
            client_queue_max_size: 10 * 1024 * 1024,
            client_queue_initial_capacity: 2,
            client_channel_limit: 100,
            private_channel_prefix: "$".to_string(),
            namespace_channel_boundary: ":".to_string(),
            user_channel_boundary: "#".to_string(),
            user_channel_separator: ",".to_string(),
            client_channel_boundary: "&".to_string(),
            insecure: false,
            insecure_api: false,
            insecure_admin: false,
            secret: Secret::default(),
            connection_lifetime: 0,
            channel_options: ChannelOptions::default(),
            namespaces: Vec::new(),
        }
    }
}

impl Config {
    /// Validate the configuration.
    ///
    /// Every namespace name must match [`NAMESPACE_PATTERN`] and be unique.
    /// The first violation aborts validation.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pattern = Regex::new(NAMESPACE_PATTERN)?;
        let mut seen = HashSet::with_capacity(self.namespaces.len());

        for namespace in &self.namespaces {
            if !pattern.is_match(&namespace.name) {
                return Err(ConfigError::InvalidNamespaceName(namespace.name.clone()));
            }
            if !seen.insert(namespace.name.as_str()) {
                return Err(ConfigError::DuplicateNamespace(namespace.name.clone()));
            }
        }

        Ok(())
    }

    /// Options for a namespace key; the empty key selects the global options.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NamespaceNotFound`] for an unknown key.
    pub fn namespace_options(&self, key: &str) -> Result<ChannelOptions, ConfigError> {
        if key.is_empty() {
            return Ok(self.channel_options);
        }
        self.namespaces
            .iter()
            .find(|n| n.name == key)
            .map(|n| n.options)
            .ok_or_else(|| ConfigError::NamespaceNotFound(key.to_string()))
    }

    /// Options governing a channel.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NamespaceNotFound`] if the channel names a
    /// namespace that is not configured.
    pub fn resolve_options(&self, channel: &str) -> Result<ChannelOptions, ConfigError> {
        self.namespace_options(self.namespace_key(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn news_options() -> ChannelOptions {
        ChannelOptions {
            history_size: 2,
            history_lifetime: 3600,
            ..ChannelOptions::default()
        }
    }

    fn config_with(names: &[&str]) -> Config {
        Config {
            namespaces: names
                .iter()
                .map(|n| Namespace::new(*n, ChannelOptions::default()))
                .collect(),
            ..Config::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.namespace_channel_boundary, ":");
        assert_eq!(config.node_info_max_delay, Duration::from_secs(11));
    }

    #[test]
    fn test_validate_namespace_names() {
        assert!(config_with(&["news", "chat_1", "a-b", "42"]).validate().is_ok());

        for bad in ["a", "", "with space", "dots.not.allowed", "ümlaut"] {
            assert!(
                matches!(
                    config_with(&["ok", bad]).validate(),
                    Err(ConfigError::InvalidNamespaceName(ref n)) if n == bad
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_validate_unique_names() {
        assert!(matches!(
            config_with(&["news", "chat", "news"]).validate(),
            Err(ConfigError::DuplicateNamespace(ref n)) if n == "news"
        ));
        // Case-sensitive.
        assert!(config_with(&["news", "News"]).validate().is_ok());
    }

    #[test]
    fn test_validate_reports_first_violation() {
        let err = config_with(&["x", "news", "news"]).validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNamespaceName(_)));
        assert!(err.to_string().starts_with("config error: "));
    }

    #[test]
    fn test_resolve_options() {
        let config = Config {
            channel_options: ChannelOptions {
                anonymous: true,
                ..ChannelOptions::default()
            },
            namespaces: vec![Namespace::new("news", news_options())],
            ..Config::default()
        };

        assert_eq!(config.resolve_options("tech").unwrap(), config.channel_options);
        assert_eq!(config.resolve_options(":tech").unwrap(), config.channel_options);
        assert_eq!(config.resolve_options("news:tech").unwrap(), news_options());
        assert!(matches!(
            config.resolve_options("sport:football"),
            Err(ConfigError::NamespaceNotFound(ref n)) if n == "sport"
        ));
    }

    #[test]
    fn test_resolve_uses_configured_boundary() {
        let config = Config {
            namespace_channel_boundary: "/".to_string(),
            namespaces: vec![Namespace::new("news", news_options())],
            ..Config::default()
        };

        assert_eq!(config.resolve_options("news/tech").unwrap(), news_options());
        // With a custom boundary ':' is just part of the name.
        assert_eq!(config.resolve_options("news:tech").unwrap(), ChannelOptions::default());
    }

    #[test]
    fn test_recover_without_history_is_noop() {
        let options = ChannelOptions {
            recover: true,
            ..ChannelOptions::default()
        };
        assert!(!options.recover_enabled());
        assert!(news_options().history_enabled());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            name = "node-a"
            presence_expire_interval = 30
            future_option = "ignored"

            [channel_options]
            anonymous = true

            [[namespaces]]
            name = "news"
            history_size = 10
            history_lifetime = 60
            recover = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.name, "node-a");
        assert_eq!(config.presence_expire_interval, Duration::from_secs(30));
        assert_eq!(config.ping_interval, Duration::from_secs(25));
        assert!(config.channel_options.anonymous);

        let news = config.namespace_options("news").unwrap();
        assert_eq!(news.history_size, 10);
        assert!(news.recover_enabled());
        assert!(!news.presence);
    }

    #[test]
    fn test_secrets_are_redacted() {
        let config = Config {
            secret: Secret::new("hunter2"),
            ..Config::default()
        };
        assert!(!format!("{config:?}").contains("hunter2"));
        assert!(!serde_json::to_string(&config).unwrap().contains("hunter2"));
        assert_eq!(config.secret.expose(), "hunter2");
    }
}
