//! Unified configuration for CuriaDB.
//!
//! Centralized configuration management with support for:
//! - Default values (embedded in binary)
//! - Configuration files (TOML format)
//! - Environment variable overrides (prefix: `CURIA__`)
//!
//! # Environment Variables
//!
//! - `CURIA__AGENCY__ID=1`
//! - `CURIA__AGENCY__ENDPOINTS=http://a:4001,http://b:4001,http://c:4001`
//! - `CURIA__AGENCY__MIN_PING_MS=150`
//! - `CURIA__AGENCY__MAX_PING_MS=300`
//! - `CURIA__STORE__SWEEP_INTERVAL_MS=100`
//! - `CURIA__PERSISTENCE__DATA_DIR=/var/lib/curia`
//! - `CURIA__LOGGING__LEVEL=debug`

use crate::constituent::ElectionConfig;
use curia_core::AgentId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Root configuration for one CuriaDB node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CuriaConfig {
    /// Agency membership and election timing.
    pub agency: AgencyConfig,
    /// Store worker configuration.
    pub store: StoreConfig,
    /// Durable state configuration.
    pub persistence: PersistenceConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Default for CuriaConfig {
    fn default() -> Self {
        Self {
            agency: AgencyConfig::default(),
            store: StoreConfig::default(),
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CuriaConfig {
    /// Loads configuration from an optional file path with environment
    /// variable overrides.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (`CURIA__*`)
    /// 2. Configuration file (if provided)
    /// 3. Built-in defaults
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(file_path) = path {
            if Path::new(file_path).exists() {
                let contents = std::fs::read_to_string(file_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CURIA__AGENCY__ID") {
            if let Ok(v) = val.parse() {
                self.agency.id = v;
            }
        }
        if let Ok(val) = std::env::var("CURIA__AGENCY__ENDPOINTS") {
            let endpoints: Vec<String> =
                val.split(',').map(str::trim).map(str::to_string).collect();
            if !endpoints.is_empty() {
                self.agency.endpoints = endpoints;
            }
        }
        if let Ok(val) = std::env::var("CURIA__AGENCY__MIN_PING_MS") {
            if let Ok(v) = val.parse() {
                self.agency.min_ping_ms = v;
            }
        }
        if let Ok(val) = std::env::var("CURIA__AGENCY__MAX_PING_MS") {
            if let Ok(v) = val.parse() {
                self.agency.max_ping_ms = v;
            }
        }
        if let Ok(val) = std::env::var("CURIA__AGENCY__NOTIFY_PEERS") {
            self.agency.notify_peers = val.to_lowercase() == "true" || val == "1";
        }
        if let Ok(val) = std::env::var("CURIA__STORE__SWEEP_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                self.store.sweep_interval_ms = v;
            }
        }
        if let Ok(val) = std::env::var("CURIA__PERSISTENCE__DATA_DIR") {
            self.persistence.data_dir = val;
        }
        if let Ok(val) = std::env::var("CURIA__LOGGING__LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("CURIA__LOGGING__JSON") {
            self.logging.json = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Serializes the configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// The election configuration derived from this node configuration.
    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig {
            id: AgentId::new(self.agency.id),
            endpoints: self.agency.endpoints.clone(),
            min_ping: Duration::from_millis(self.agency.min_ping_ms),
            max_ping: Duration::from_millis(self.agency.max_ping_ms),
            notify_peers: self.agency.notify_peers,
        }
    }
}

/// Agency membership and election timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgencyConfig {
    /// This node's id, an index into `endpoints`.
    pub id: u64,
    /// Peer endpoints, indexed by agent id.
    pub endpoints: Vec<String>,
    /// Lower bound of the follower election timer, in milliseconds.
    pub min_ping_ms: u64,
    /// Upper bound of the follower election timer, in milliseconds.
    pub max_ping_ms: u64,
    /// Gossip the endpoint list to peers on startup.
    pub notify_peers: bool,
}

impl Default for AgencyConfig {
    fn default() -> Self {
        Self {
            id: 0,
            endpoints: vec!["http://127.0.0.1:4001".to_string()],
            min_ping_ms: 150,
            max_ping_ms: 300,
            notify_peers: false,
        }
    }
}

/// Store worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Fallback TTL sweeper wait when the time table is empty, in
    /// milliseconds.
    pub sweep_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { sweep_interval_ms: 100 }
    }
}

/// Durable state configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Directory holding the election ledger.
    pub data_dir: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { data_dir: "data".to_string() }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Use JSON format for log output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}
