//! Subscriber configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (PULSE_ENDPOINT, PULSE_TOPICS)
//! - TOML configuration file
//! - Command line arguments, which override both

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tenvis_pulse_client::{default_backoff, BackoffFn, SocketOptions};
use pulse_protocol::{JsonSerializer, MsgPackSerializer, Serializer};

/// Subscriber configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Socket endpoint, without the transport suffix.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Topics to join.
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,

    /// Transport to connect with.
    #[serde(default)]
    pub transport: TransportKind,

    /// Wire encoding.
    #[serde(default)]
    pub serializer: SerializerKind,

    /// Query parameters sent when connecting.
    #[serde(default = "empty_object")]
    pub params: Value,

    /// Payload of every join.
    #[serde(default = "empty_object")]
    pub join_params: Value,

    /// Print presence changes.
    #[serde(default = "default_true")]
    pub presence: bool,

    /// Timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Retry delays.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Websocket,
    Longpoll,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    #[default]
    Json,
    Msgpack,
}

/// Timeout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Push and join timeout in milliseconds.
    #[serde(default = "default_push_timeout")]
    pub push_ms: u64,

    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_ms: u64,
}

/// Retry delays, in milliseconds per attempt. The last delay repeats.
/// Empty lists use the stepped 1s, 2s, 5s, 10s schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub reconnect_ms: Vec<u64>,

    #[serde(default)]
    pub rejoin_ms: Vec<u64>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_endpoint() -> String {
    std::env::var("PULSE_ENDPOINT").unwrap_or_else(|_| "ws://127.0.0.1:4000/socket".to_string())
}

fn default_topics() -> Vec<String> {
    std::env::var("PULSE_TOPICS")
        .map(|topics| parse_topics(&topics))
        .unwrap_or_default()
}

fn parse_topics(topics: &str) -> Vec<String> {
    topics
        .split(',')
        .map(str::trim)
        .filter(|topic| !topic.is_empty())
        .map(str::to_string)
        .collect()
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

fn default_true() -> bool {
    true
}

fn default_push_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            topics: default_topics(),
            transport: TransportKind::default(),
            serializer: SerializerKind::default(),
            params: empty_object(),
            join_params: empty_object(),
            presence: true,
            timeouts: TimeoutConfig::default(),
            backoff: BackoffConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            push_ms: default_push_timeout(),
            heartbeat_ms: default_heartbeat_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "pulse-sub.toml",
            "/etc/pulse/pulse-sub.toml",
            "~/.config/pulse/pulse-sub.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        let scheme_ok = ["ws://", "wss://", "http://", "https://"]
            .iter()
            .any(|scheme| self.endpoint.starts_with(scheme));
        if !scheme_ok {
            bail!("endpoint must be a ws, wss, http or https URL: {}", self.endpoint);
        }
        if !self.params.is_object() {
            bail!("params must be a table");
        }
        if !self.join_params.is_object() {
            bail!("join_params must be a table");
        }
        if self.timeouts.push_ms == 0 || self.timeouts.heartbeat_ms == 0 {
            bail!("timeouts must be greater than zero");
        }
        Ok(())
    }

    /// Build socket options.
    #[must_use]
    pub fn socket_options(&self) -> SocketOptions {
        let serializer: Arc<dyn Serializer> = match self.serializer {
            SerializerKind::Json => Arc::new(JsonSerializer),
            SerializerKind::Msgpack => Arc::new(MsgPackSerializer),
        };
        SocketOptions {
            timeout: Duration::from_millis(self.timeouts.push_ms),
            heartbeat_interval: Duration::from_millis(self.timeouts.heartbeat_ms),
            reconnect_after: backoff(&self.backoff.reconnect_ms),
            rejoin_after: backoff(&self.backoff.rejoin_ms),
            params: self.params.clone(),
            serializer,
        }
    }
}

/// Delay for attempt `n` is `delays[n - 1]`, repeating the last entry.
fn backoff(delays: &[u64]) -> BackoffFn {
    if delays.is_empty() {
        return default_backoff();
    }
    let delays = delays.to_vec();
    Arc::new(move |attempt| {
        let index = (attempt.max(1) as usize - 1).min(delays.len() - 1);
        Duration::from_millis(delays[index])
    })
}
