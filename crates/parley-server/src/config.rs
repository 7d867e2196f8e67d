//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - built-in defaults
//! - a TOML file (`PARLEY_CONFIG`, else the first of `parley.toml`,
//!   `/etc/parley/parley.toml`, `~/.config/parley/parley.toml`)
//! - environment variables (`PARLEY__SECTION__KEY`)

use anyhow::{Context, Result};
use parley_core::{HubConfig, RelayConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const CONFIG_PATHS: [&str; 3] = [
    "parley.toml",
    "/etc/parley/parley.toml",
    "~/.config/parley/parley.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    pub transport: TransportConfig,
    pub limits: LimitsConfig,
    pub heartbeat: HeartbeatConfig,
    pub relay: RelayBusConfig,
    pub dedup: DedupConfig,
    pub store: StoreConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    pub websocket_path: String,
}

/// Resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Rooms a single connection may join.
    pub max_rooms_per_session: usize,
    /// Events buffered per connection before new ones are dropped.
    pub outbound_capacity: usize,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    pub interval_ms: u64,
    /// Idle time after which a connection is closed, in milliseconds.
    pub timeout_ms: u64,
}

/// Cross-instance relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayBusConfig {
    /// Redis URL. Unset means a single instance on in-memory stores.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    /// Pub/sub channel.
    pub channel: String,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Envelopes queued for publishing before new ones are dropped.
    pub queue_capacity: usize,
    /// Timeout for one publish, in milliseconds.
    pub publish_timeout_ms: u64,
}

/// Per-connection duplicate suppression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub ttl_ms: u64,
    pub capacity: usize,
}

/// Durable store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How long stored messages stay fetchable.
    pub message_ttl_secs: u64,
    /// How long an identity's latest session stays cached.
    pub session_ttl_secs: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter.
    pub enabled: bool,
    /// Exporter port.
    pub port: u16,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            relay: RelayBusConfig::default(),
            dedup: DedupConfig::default(),
            store: StoreConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: "/ws".to_string(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            max_rooms_per_session: 100,
            outbound_capacity: 256,
            max_message_size: 64 * 1024,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 25_000,
            timeout_ms: 60_000,
        }
    }
}

impl Default for RelayBusConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            channel: parley_core::relay::DEFAULT_CHANNEL.to_string(),
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            queue_capacity: parley_core::relay::DEFAULT_QUEUE_CAPACITY,
            publish_timeout_ms: 5_000,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 60_000,
            capacity: 512,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            message_ttl_secs: 24 * 60 * 60,
            session_ttl_secs: 12 * 60 * 60,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "parley=info,parley_core=info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load configuration from defaults, the config file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let path = std::env::var("PARLEY_CONFIG")
            .ok()
            .map(PathBuf::from)
            .or_else(find_config_file);
        Self::load_from(path.as_deref())
    }

    /// Load configuration with an explicit config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Config::default())
            .context("Failed to build default configuration")?;
        let mut builder = config::Config::builder().add_source(defaults);

        match path {
            Some(path) => {
                debug!(path = %path.display(), "Loading configuration file");
                builder = builder.add_source(config::File::from(path.to_path_buf()));
            }
            None => debug!("No configuration file; using defaults and environment"),
        }

        let layered = builder
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        layered
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Render the effective configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form an address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Core hub settings derived from this configuration.
    #[must_use]
    pub fn hub_config(&self, instance_id: String) -> HubConfig {
        HubConfig {
            instance_id,
            max_rooms_per_session: self.limits.max_rooms_per_session,
            seen_ttl: Duration::from_millis(self.dedup.ttl_ms),
            seen_capacity: self.dedup.capacity,
            relay: RelayConfig {
                channel: self.relay.channel.clone(),
                initial_backoff: Duration::from_millis(self.relay.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.relay.max_backoff_ms),
                queue_capacity: self.relay.queue_capacity,
                publish_timeout: Duration::from_millis(self.relay.publish_timeout_ms),
            },
        }
    }
}

fn find_config_file() -> Option<PathBuf> {
    CONFIG_PATHS
        .iter()
        .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
        .find(|p| p.exists())
}
