//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`relay.toml`, `/etc/relay/relay.toml`,
//!   `~/.config/relay/relay.toml`, or an explicit `--config` path)
//! - Environment variables (`RELAY_HOST`, `RELAY_PORT`,
//!   `RELAY_LIMITS__MAX_CONNECTIONS`, ...), which override the file

use anyhow::{ensure, Context, Result};
use relay_core::BrokerConfig;
use relay_protocol::codec::DEFAULT_MAX_FRAME_SIZE;
use relay_transport::TcpConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default configuration file locations, in lookup order.
const CONFIG_PATHS: [&str; 3] = [
    "relay.toml",
    "/etc/relay/relay.toml",
    "~/.config/relay/relay.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Connection timeouts.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum number of topics.
    #[serde(default = "default_max_topics")]
    pub max_topics: usize,

    /// Maximum undelivered messages buffered per topic.
    #[serde(default = "default_max_pending_per_topic")]
    pub max_pending_per_topic: usize,

    /// Maximum size of a single request frame in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Deliveries a connection may have queued before topics wait for it.
    /// Must exceed `max_pending_per_topic` so a full backlog fits at once.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
}

/// Timeout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Close connections with no traffic for this long. `0` disables.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Close a connection whose peer takes longer than this to accept one
    /// frame. `0` disables.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// How long shutdown waits for connection handlers before aborting them.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7878
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_topics() -> usize {
    10_000
}

fn default_max_pending_per_topic() -> usize {
    relay_core::topic::DEFAULT_MAX_PENDING
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_outbox_capacity() -> usize {
    4096
}

fn default_idle_timeout() -> u64 {
    300_000 // 5 minutes
}

fn default_write_timeout() -> u64 {
    30_000
}

fn default_shutdown_grace() -> u64 {
    5_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            limits: LimitsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_topics: default_max_topics(),
            max_pending_per_topic: default_max_pending_per_topic(),
            max_frame_size: default_max_frame_size(),
            outbox_capacity: default_outbox_capacity(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout(),
            write_timeout_ms: default_write_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first default path that exists, or from
    /// defaults. Environment variables apply either way.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Self::from_sources(None)
    }

    /// Load configuration from a specific file, with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_sources(Some(&contents))
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn from_sources(toml_source: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(contents) = toml_source {
            builder = builder.add_source(config::File::from_str(
                contents,
                config::FileFormat::Toml,
            ));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?;

        let config: Self = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the limits are consistent with each other.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first inconsistent setting.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        ensure!(limits.max_connections > 0, "limits.max_connections must be positive");
        ensure!(limits.max_frame_size > 0, "limits.max_frame_size must be positive");
        ensure!(
            limits.outbox_capacity > limits.max_pending_per_topic,
            "limits.outbox_capacity ({}) must exceed limits.max_pending_per_topic ({})",
            limits.outbox_capacity,
            limits.max_pending_per_topic
        );
        Ok(())
    }

    /// Render the effective configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Broker settings derived from the limits section.
    #[must_use]
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            max_topics: self.limits.max_topics,
            max_pending_per_topic: self.limits.max_pending_per_topic,
        }
    }

    /// Transport settings for the TCP listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address is invalid.
    pub fn tcp_config(&self) -> Result<TcpConfig> {
        Ok(TcpConfig {
            bind_addr: self.bind_addr()?,
            max_frame_size: self.limits.max_frame_size,
        })
    }

    /// Idle timeout, or `None` when disabled.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.timeouts.idle_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Per-frame write timeout, or `None` when disabled.
    #[must_use]
    pub fn write_timeout(&self) -> Option<Duration> {
        match self.timeouts.write_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Grace period for connection handlers during shutdown.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.timeouts.shutdown_grace_ms)
    }
}
