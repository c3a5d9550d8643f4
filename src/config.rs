use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::ConfigError;

pub const CONFIG_PATH_ENV: &str = "INFERENCE_GATEWAY_CONFIG";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub dispatch: DispatchConfig,
    pub workers: WorkersConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_clients: usize,
    pub poll_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            max_clients: 64,
            poll_timeout_ms: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_tasks: usize,
    pub max_pending: usize,
    pub max_processing: usize,
    pub max_workers: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_tasks: 128,
            max_pending: 128,
            max_processing: 128,
            max_workers: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    pub idle_backoff_ms: u64,
    /// Tasks older than this are moved to TIMEOUT. Unset disables the sweep.
    pub task_timeout_ms: Option<u64>,
    pub max_fragments_per_sweep: usize,
    pub snapshot_interval_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            idle_backoff_ms: 10,
            task_timeout_ms: None,
            max_fragments_per_sweep: 64,
            snapshot_interval_secs: 30,
        }
    }
}

impl DispatchConfig {
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkersConfig {
    pub addresses: Vec<String>,
    pub connect_timeout_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            connect_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn from_toml_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// First CLI argument, then `INFERENCE_GATEWAY_CONFIG`, then defaults.
    pub fn resolve(cli_path: Option<String>) -> Result<Self, ConfigError> {
        match cli_path.or_else(|| std::env::var(CONFIG_PATH_ENV).ok()) {
            Some(path) if !path.trim().is_empty() => Self::load(path.trim()),
            _ => Ok(Self::default()),
        }
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("limits.max_tasks", self.limits.max_tasks),
            ("limits.max_pending", self.limits.max_pending),
            ("limits.max_processing", self.limits.max_processing),
            ("limits.max_workers", self.limits.max_workers),
            ("server.max_clients", self.server.max_clients),
            ("dispatch.max_fragments_per_sweep", self.dispatch.max_fragments_per_sweep),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.workers.addresses.len() > self.limits.max_workers {
            return Err(ConfigError::Invalid {
                key: "workers.addresses",
                reason: format!(
                    "{} addresses configured but limits.max_workers is {}",
                    self.workers.addresses.len(),
                    self.limits.max_workers
                ),
            });
        }
        if self.dispatch.task_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                key: "dispatch.task_timeout_ms",
                reason: "use a positive deadline or leave it unset".to_string(),
            });
        }
        Ok(())
    }
}
