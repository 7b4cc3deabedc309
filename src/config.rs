//! Service configuration: schema, defaults, TOML loading, env overrides.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity of this TSO instance, stamped into every issued timestamp.
    pub tso_id: u32,
    /// Number of execution cores to bind (1 controller + N workers).
    /// Defaults to the machine's available parallelism.
    pub cores: Option<usize>,
    pub endpoints: EndpointsConfig,
    pub controller: ControllerConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tso_id: 1,
            cores: None,
            endpoints: EndpointsConfig::default(),
            controller: ControllerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    pub host: String,
    /// Core 0 (the controller) binds this port; worker `i` binds `tcp_base_port + 1 + i`.
    pub tcp_base_port: u16,
    /// When set, each core additionally advertises an RDMA endpoint with the
    /// same per-core port layout.
    pub rdma_base_port: Option<u16>,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            tcp_base_port: 13000,
            rdma_base_port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Heartbeat period; also the lease-renewal cadence.
    pub heart_beat_interval_ms: u64,
    /// Time-authority sync period.
    pub time_sync_interval_ms: u64,
    /// Floor for the batch uncertainty window; must stay under the minimum
    /// transaction latency of the deployment.
    pub ts_batch_win_size_ms: u64,
    pub stats_update_interval_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            heart_beat_interval_ms: 10,
            time_sync_interval_ms: 10,
            ts_batch_win_size_ms: 8,
            stats_update_interval_ms: 1000,
        }
    }
}

impl ControllerConfig {
    pub fn heart_beat_interval(&self) -> Duration {
        Duration::from_millis(self.heart_beat_interval_ms)
    }

    pub fn time_sync_interval(&self) -> Duration {
        Duration::from_millis(self.time_sync_interval_ms)
    }

    pub fn stats_update_interval(&self) -> Duration {
        Duration::from_millis(self.stats_update_interval_ms)
    }

    pub fn ts_batch_win_size_ns(&self) -> u64 {
        self.ts_batch_win_size_ms.saturating_mul(1_000_000)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            filter: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Load config from a TOML file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load config, falling back to defaults when no path is given or the file
/// cannot be used.
pub fn load_or_default(path: Option<&Path>) -> Config {
    match path {
        Some(path) => match load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!("config load failed, using defaults: {err}");
                Config::default()
            }
        },
        None => Config::default(),
    }
}

/// Environment overrides, applied after file loading.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(id) = std::env::var("TSOD_TSO_ID")
        && let Ok(id) = id.parse()
    {
        cfg.tso_id = id;
    }
    if let Ok(filter) = std::env::var("TSOD_LOG") {
        cfg.logging.filter = Some(filter);
    }
}
