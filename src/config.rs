// src/config.rs

//! Manages configuration: loading, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// Sizing of a connection registry table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    /// Number of slots allocated up front.
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,
    /// Hard bound on the table length. Descriptors at or above it are refused.
    #[serde(default = "default_max_capacity")]
    pub max_capacity: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            initial_capacity: default_initial_capacity(),
            max_capacity: default_max_capacity(),
        }
    }
}

fn default_initial_capacity() -> usize {
    1024
}
fn default_max_capacity() -> usize {
    1 << 20
}

/// Idle-connection tracking. Unset limits mean unbounded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,
    /// How long a connection may stay silent before it is closed.
    #[serde(default = "default_heartbeat_timeout", with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Maximum number of connections tracked at once.
    #[serde(default)]
    pub max_tracked: Option<usize>,
    /// How often idle connections are swept. Defaults to the timeout, capped at 1s.
    #[serde(default, with = "humantime_serde")]
    pub sweep_interval: Option<Duration>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: default_heartbeat_timeout(),
            max_tracked: None,
            sweep_interval: None,
        }
    }
}

fn default_heartbeat_timeout() -> Option<Duration> {
    Some(Duration::from_secs(60))
}

impl HeartbeatConfig {
    /// A heartbeat configuration with the given timeout and no tracking limit.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            enabled: true,
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9091
}

/// The complete service configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Worker threads per connection manager.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Number of connection managers accepted connections are spread over.
    #[serde(default = "default_services")]
    pub services: usize,
    #[serde(default)]
    pub table: TableConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9090
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_workers() -> usize {
    1
}
fn default_services() -> usize {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            workers: default_workers(),
            services: default_services(),
            table: TableConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Invalid configuration in '{path}'"))?;
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.workers == 0 {
            return Err(anyhow!("workers cannot be 0"));
        }
        if self.services == 0 {
            return Err(anyhow!("services cannot be 0"));
        }
        if self.workers > 1 {
            warn!(
                "workers is set to {}. Connection tables stay single-writer; extra workers only run state-less jobs.",
                self.workers
            );
        }

        if self.table.initial_capacity == 0 {
            return Err(anyhow!("table.initial_capacity cannot be 0"));
        }
        if self.table.initial_capacity > self.table.max_capacity {
            return Err(anyhow!(
                "table.initial_capacity ({}) cannot exceed table.max_capacity ({})",
                self.table.initial_capacity,
                self.table.max_capacity
            ));
        }

        if self.heartbeat.timeout == Some(Duration::ZERO) {
            return Err(anyhow!("heartbeat.timeout cannot be 0"));
        }
        if self.heartbeat.sweep_interval == Some(Duration::ZERO) {
            return Err(anyhow!("heartbeat.sweep_interval cannot be 0"));
        }
        if self.heartbeat.max_tracked == Some(0) {
            return Err(anyhow!("heartbeat.max_tracked cannot be 0"));
        }
        if self.heartbeat.enabled && self.heartbeat.timeout.is_none() {
            warn!("heartbeat is enabled without a timeout; idle connections will never be closed.");
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main server port"
                ));
            }
        }
        Ok(())
    }
}
