//! Configuration management for portico.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::cluster::topology::ReadPreference;

/// Main portico configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Cluster configuration
    pub cluster: ClusterConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: String,
    /// Maximum number of concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Startup nodes used for the initial topology load and every refresh
    pub startup_nodes: Vec<String>,
    /// Password for both client AUTH and backend handshakes; empty disables
    /// proxy-side authentication
    #[serde(default)]
    pub password: String,
    /// One of prefer-master, prefer-slave, prefer-slave-idc
    #[serde(default = "default_read_preference")]
    pub read_preference: String,
    /// Minimum wall time between two topology reloads
    #[serde(default = "default_slot_reload_interval_ms")]
    pub slot_reload_interval_ms: u64,
    /// Forced reload cadence
    #[serde(default = "default_periodic_reload_interval_sec")]
    pub periodic_reload_interval_sec: u64,
    /// Backend dial timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Idle connections kept per backend endpoint
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

fn default_max_connections() -> usize {
    10000
}

fn default_read_preference() -> String {
    "prefer-master".to_string()
}

fn default_slot_reload_interval_ms() -> u64 {
    1000
}

fn default_periodic_reload_interval_sec() -> u64 {
    60
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_pool_max_idle() -> usize {
    8
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "0.0.0.0:6380".to_string(),
                max_connections: default_max_connections(),
            },
            cluster: ClusterConfig {
                startup_nodes: vec!["127.0.0.1:6379".to_string()],
                password: String::new(),
                read_preference: default_read_preference(),
                slot_reload_interval_ms: default_slot_reload_interval_ms(),
                periodic_reload_interval_sec: default_periodic_reload_interval_sec(),
                connect_timeout_ms: default_connect_timeout_ms(),
                pool_max_idle: default_pool_max_idle(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_addr.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "listen_addr cannot be empty".to_string(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        if self.cluster.startup_nodes.is_empty() {
            return Err(ConfigError::ValidationError(
                "startup_nodes cannot be empty".to_string(),
            ));
        }

        for node in &self.cluster.startup_nodes {
            let port = node.rsplit(':').next().unwrap_or("");
            if !node.contains(':') || port.parse::<u16>().is_err() {
                return Err(ConfigError::ValidationError(format!(
                    "invalid startup node (expected host:port): {}",
                    node
                )));
            }
        }

        if self.cluster.read_preference.parse::<ReadPreference>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "invalid read_preference: {}",
                self.cluster.read_preference
            )));
        }

        if self.cluster.slot_reload_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "slot_reload_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.cluster.periodic_reload_interval_sec == 0 {
            return Err(ConfigError::ValidationError(
                "periodic_reload_interval_sec must be greater than 0".to_string(),
            ));
        }

        if self.cluster.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        Ok(())
    }

    /// Create an example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Config {
            cluster: ClusterConfig {
                startup_nodes: vec![
                    "10.0.1.20:6379".to_string(),
                    "10.0.1.21:6379".to_string(),
                    "10.0.1.22:6379".to_string(),
                ],
                ..Config::default().cluster
            },
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("serialize error: {0}")]
    SerializeError(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}
