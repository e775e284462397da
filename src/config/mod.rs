//! Configuration
//!
//! TOML-based configuration with `RELAYMQ_`-prefixed environment
//! overrides and `${VAR}` / `${VAR:-default}` substitution inside the
//! file. CLI flags in the binary take precedence over everything here.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::protocol::QoS;

#[cfg(test)]
mod tests;

/// Substitute environment variables in the raw config text.
/// Supports `${VAR}` and `${VAR:-default}`.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static regex");
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading the config file
    Io(std::io::Error),
    /// Parse or layering error
    Config(config::ConfigError),
    /// Semantic validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "io error: {}", e),
            ConfigError::Config(e) => write!(f, "config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub mqtt: MqttConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
    /// WebSocket bind address (unset disables WebSocket)
    pub ws_bind: Option<SocketAddr>,
    /// WebSocket upgrade path
    pub ws_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 1883)),
            ws_bind: None,
            ws_path: "/mqtt".to_string(),
        }
    }
}

/// Connection limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_connections: usize,
    pub max_packet_size: usize,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            max_packet_size: 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Session parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound on each session's pending message queue
    pub max_pending: usize,
    /// Bound on each session's in-flight window
    pub max_inflight: usize,
    /// Upper bound applied to client-requested keep alive
    pub max_keep_alive: u16,
    /// Outbound channel capacity per connection
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_pending: 1000,
            max_inflight: 32,
            max_keep_alive: u16::MAX,
            outbound_capacity: 1024,
        }
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Highest QoS granted to subscribers (0, 1 or 2)
    pub max_qos: u8,
    /// Whether retained messages are stored
    pub retain_available: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: 2,
            retain_available: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file plus `RELAYMQ_*` environment
    /// overrides (e.g. `RELAYMQ_SERVER__BIND=0.0.0.0:2883`)
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);

        let config: Config = config::Config::builder()
            .add_source(File::from_str(&content, FileFormat::Toml))
            .add_source(Environment::with_prefix("RELAYMQ").separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(format!(
                "mqtt.max_qos must be 0, 1 or 2 (got {})",
                self.mqtt.max_qos
            )));
        }
        if self.limits.max_packet_size == 0 {
            return Err(ConfigError::Validation(
                "limits.max_packet_size must be positive".to_string(),
            ));
        }
        if self.session.max_inflight == 0 {
            return Err(ConfigError::Validation(
                "session.max_inflight must be positive".to_string(),
            ));
        }
        if self.session.outbound_capacity == 0 {
            return Err(ConfigError::Validation(
                "session.outbound_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Translate into the broker's runtime configuration
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            bind_addr: self.server.bind,
            ws_bind_addr: self.server.ws_bind,
            ws_path: self.server.ws_path.clone(),
            max_connections: self.limits.max_connections,
            max_packet_size: self.limits.max_packet_size,
            connect_timeout: self.limits.connect_timeout,
            max_keep_alive: self.session.max_keep_alive,
            max_qos: QoS::from_u8(self.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce),
            retain_available: self.mqtt.retain_available,
            max_pending: self.session.max_pending,
            max_inflight: self.session.max_inflight,
            outbound_capacity: self.session.outbound_capacity,
            shutdown_grace: self.limits.shutdown_grace,
        }
    }
}
