//! Master configuration
//!
//! Sources, lowest to highest priority:
//! 1. Built-in defaults
//! 2. `modbus-master.toml` in the working directory
//! 3. `modbus-master.yaml` in the working directory
//! 4. `MODBUS_MASTER_*` environment variables
//!
//! Values below a field's minimum are raised to the minimum rather than
//! rejected.

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::constants::WRITE_INTERVAL;
use crate::engine::EngineConfig;
use crate::error::{ModbusError, Result};

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 1;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
pub const MIN_IDLE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;
pub const MIN_CONNECT_TIMEOUT_SECS: u64 = 3;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "MODBUS_MASTER_";

/// Timeouts and runtime sizing for a `ModbusMaster`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Time allowed for a device to answer one request
    pub request_timeout_ms: u64,
    /// A connection with no traffic for this long is closed
    pub idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Worker threads of the owned runtime; `None` uses the tokio default
    pub worker_threads: Option<usize>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            worker_threads: None,
        }
    }
}

impl MasterConfig {
    /// Load from the default files and environment
    pub fn load() -> Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("modbus-master.toml"))
            .merge(Yaml::file("modbus-master.yaml"))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        Ok(config.normalized())
    }

    /// Load from one file, picking the format by extension
    ///
    /// Environment variables still override the file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ModbusError::config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ModbusError::config("Config file must have an extension"))?;

        let figment = Figment::from(Serialized::defaults(Self::default()));
        let figment = match extension {
            "toml" => figment.merge(Toml::file(path)),
            "yaml" | "yml" => figment.merge(Yaml::file(path)),
            "json" => figment.merge(Json::file(path)),
            _ => {
                return Err(ModbusError::config(format!(
                    "Unsupported config file format: {extension}"
                )))
            },
        };

        let config: Self = figment.merge(Env::prefixed(ENV_PREFIX)).extract()?;
        Ok(config.normalized())
    }

    /// Raise every value to its minimum
    pub fn normalized(mut self) -> Self {
        self.request_timeout_ms = self.request_timeout_ms.max(MIN_REQUEST_TIMEOUT_MS);
        self.idle_timeout_secs = self.idle_timeout_secs.max(MIN_IDLE_TIMEOUT_SECS);
        self.connect_timeout_secs = self.connect_timeout_secs.max(MIN_CONNECT_TIMEOUT_SECS);
        self.worker_threads = self.worker_threads.map(|n| n.max(1));
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(MIN_REQUEST_TIMEOUT_MS))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(MIN_IDLE_TIMEOUT_SECS))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(MIN_CONNECT_TIMEOUT_SECS))
    }

    /// Engine settings derived from this config
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            request_timeout: self.request_timeout(),
            idle_timeout: self.idle_timeout(),
            write_interval: WRITE_INTERVAL,
        }
    }
}
