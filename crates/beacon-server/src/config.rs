//! Server settings.
//!
//! Settings are layered, later sources overriding earlier ones:
//! - Built-in defaults
//! - TOML configuration file
//! - Environment variables (`BEACON_*`, `__` between nested keys)

use anyhow::{Context, Result};
use config::{builder::DefaultState, ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tenvis_beacon_core::Config as BrokerConfig;

/// Environment variable naming an explicit settings file.
pub const CONFIG_ENV: &str = "BEACON_CONFIG";

const CONFIG_PATHS: [&str; 3] = [
    "beacon.toml",
    "/etc/beacon/beacon.toml",
    "~/.config/beacon/beacon.toml",
];

/// Server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Host to bind to.
    pub host: String,

    /// Port to listen on.
    pub port: u16,

    /// Metrics configuration.
    pub metrics: MetricsSettings,

    /// Broker configuration.
    pub broker: BrokerConfig,
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Enable metrics export.
    pub enabled: bool,

    /// Metrics port.
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            metrics: MetricsSettings::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

impl Settings {
    /// Load settings from the first settings file found and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a settings file cannot be parsed or the broker
    /// configuration is invalid.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = Self::find_file() {
            tracing::info!(path = %path.display(), "Loading settings file");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        Self::finish(builder)
    }

    /// Load settings from TOML text and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be parsed.
    pub fn from_toml(text: &str) -> Result<Self> {
        let builder = config::Config::builder().add_source(File::from_str(text, FileFormat::Toml));
        Self::finish(builder)
    }

    fn find_file() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(shellexpand::tilde(&path).as_ref()));
        }
        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    fn finish(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let settings: Settings = builder
            .add_source(
                Environment::with_prefix("BEACON")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read settings")?
            .try_deserialize()
            .context("Failed to parse settings")?;

        settings
            .broker
            .validate()
            .context("Invalid broker configuration")?;
        Ok(settings)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address: {}:{}", self.host, self.port))
    }
}
