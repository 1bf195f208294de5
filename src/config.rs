//! Process configuration: JSON file, then `FLOWGUARD_*` environment
//! variables (a `.env` file is honoured), then validation.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::utils::logging::LogLevel;

const ENV_PREFIX: &str = "FLOWGUARD_";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// UDP address of the DNS filtering front end
    pub listen_addr: SocketAddr,
    /// HTTP control endpoint
    pub control_addr: SocketAddr,
    pub upstream_servers: Vec<SocketAddr>,
    pub upstream_timeout_ms: u64,
    /// Shared configuration bundle
    pub store_path: PathBuf,
    pub stats_path: PathBuf,
    pub reload_interval_secs: u64,
    pub stats_retention_days: u32,
    pub top_domains_capacity: usize,
    pub stats_channel_capacity: usize,
    pub active_window_secs: i64,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 2053)),
            control_addr: SocketAddr::from(([127, 0, 0, 1], 9091)),
            upstream_servers: vec![
                SocketAddr::from(([8, 8, 8, 8], 53)),
                SocketAddr::from(([8, 8, 4, 4], 53)),
            ],
            upstream_timeout_ms: 2000,
            store_path: PathBuf::from("flowguard.json"),
            stats_path: PathBuf::from("flowguard-stats.json"),
            reload_interval_secs: 30,
            stats_retention_days: 30,
            top_domains_capacity: 100,
            stats_channel_capacity: 10_000,
            active_window_secs: crate::models::device::DEFAULT_ACTIVE_WINDOW_SECS,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl EngineConfig {
    /// Load defaults, then `path` if given, then the environment
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(env::vars())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Read configuration from {}", path.display());
        Ok(serde_json::from_str(&text)?)
    }

    /// Apply `FLOWGUARD_*` overrides; unknown keys are ignored
    pub fn apply_env<I>(&mut self, vars: I) -> ConfigResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else { continue };
            match name {
                "LISTEN_ADDR" => self.listen_addr = parse_value(&key, &value)?,
                "CONTROL_ADDR" => self.control_addr = parse_value(&key, &value)?,
                "UPSTREAM_SERVERS" => {
                    self.upstream_servers = value
                        .split(',')
                        .filter(|s| !s.trim().is_empty())
                        .map(|s| parse_value(&key, s))
                        .collect::<ConfigResult<_>>()?;
                }
                "UPSTREAM_TIMEOUT_MS" => self.upstream_timeout_ms = parse_value(&key, &value)?,
                "STORE_PATH" => self.store_path = PathBuf::from(value),
                "STATS_PATH" => self.stats_path = PathBuf::from(value),
                "RELOAD_INTERVAL_SECS" => self.reload_interval_secs = parse_value(&key, &value)?,
                "STATS_RETENTION_DAYS" => self.stats_retention_days = parse_value(&key, &value)?,
                "TOP_DOMAINS_CAPACITY" => self.top_domains_capacity = parse_value(&key, &value)?,
                "STATS_CHANNEL_CAPACITY" => self.stats_channel_capacity = parse_value(&key, &value)?,
                "ACTIVE_WINDOW_SECS" => self.active_window_secs = parse_value(&key, &value)?,
                "LOG_LEVEL" => self.log_level = value,
                "LOG_FILE" => self.log_file = Some(PathBuf::from(value)).filter(|p| !p.as_os_str().is_empty()),
                _ => debug!("Ignoring unknown setting {}", key),
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |key: &str, value: String| {
            Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            })
        };

        if self.upstream_servers.is_empty() {
            return invalid("upstream_servers", "[]".into());
        }
        if self.upstream_timeout_ms == 0 {
            return invalid("upstream_timeout_ms", "0".into());
        }
        if self.reload_interval_secs == 0 {
            return invalid("reload_interval_secs", "0".into());
        }
        if self.stats_retention_days == 0 {
            return invalid("stats_retention_days", "0".into());
        }
        if self.top_domains_capacity == 0 {
            return invalid("top_domains_capacity", "0".into());
        }
        if self.stats_channel_capacity == 0 {
            return invalid("stats_channel_capacity", "0".into());
        }
        if self.active_window_secs <= 0 {
            return invalid("active_window_secs", self.active_window_secs.to_string());
        }
        if self.log_level.parse::<LogLevel>().is_err() {
            return invalid("log_level", self.log_level.clone());
        }
        Ok(())
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level.parse().unwrap_or(LogLevel::Info)
    }
}
