use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_password_env")]
    pub password_env: String,
    #[serde(default)]
    pub root_password: Option<String>,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_ups_scan_interval_secs")]
    pub ups_scan_interval_secs: u64,
    #[serde(default)]
    pub ignore_disks: Vec<String>,
    #[serde(default)]
    pub enable_docker: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_cache_timeout_mins")]
    pub cache_timeout_mins: u64,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub availability: AvailabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_canary_timeout_secs")]
    pub canary_timeout_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_elevation_timeout_secs")]
    pub elevation_timeout_secs: u64,
    #[serde(default = "default_command_attempts")]
    pub command_attempts: u32,
    #[serde(default = "default_benign_exit_codes")]
    pub benign_exit_codes: Vec<i32>,
    #[serde(default = "default_slot_wait_secs")]
    pub slot_wait_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AvailabilityConfig {
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            canary_timeout_secs: default_canary_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            elevation_timeout_secs: default_elevation_timeout_secs(),
            command_attempts: default_command_attempts(),
            benign_exit_codes: default_benign_exit_codes(),
            slot_wait_secs: default_slot_wait_secs(),
        }
    }
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: default_probe_timeout_secs(),
            retry_interval_secs: default_retry_interval_secs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::Validation("host is required".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::Validation(
                "port must be in range 1..65535".to_string(),
            ));
        }
        if self.username.trim().is_empty() {
            return Err(ConfigError::Validation("username is required".to_string()));
        }
        if self.scan_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "scan_interval_secs must be >= 1".to_string(),
            ));
        }
        if self.ups_scan_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "ups_scan_interval_secs must be >= 1".to_string(),
            ));
        }
        if self.max_connections == 0 || self.max_connections > 32 {
            return Err(ConfigError::Validation(
                "max_connections must be in range 1..32".to_string(),
            ));
        }
        if self.cache_timeout_mins == 0 {
            return Err(ConfigError::Validation(
                "cache_timeout_mins must be > 0".to_string(),
            ));
        }

        validate_ignore_disks(&self.ignore_disks)?;
        validate_channel(&self.channel)?;
        validate_availability(&self.availability)?;

        Ok(())
    }

    /// Password used for login and sudo. A non-empty `password_env` variable
    /// takes precedence over the value in the file.
    pub fn resolve_password(&self) -> Option<String> {
        if let Ok(v) = std::env::var(&self.password_env) {
            if !v.trim().is_empty() {
                return Some(v);
            }
        }
        self.password
            .as_ref()
            .filter(|v| !v.trim().is_empty())
            .cloned()
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn ups_scan_interval(&self) -> Duration {
        Duration::from_secs(self.ups_scan_interval_secs)
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_timeout_mins * 60)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_ignore_disks(disks: &[String]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for disk in disks {
        if disk.trim().is_empty() {
            return Err(ConfigError::Validation(
                "ignore_disks entries must not be empty".to_string(),
            ));
        }
        if !names.insert(disk.trim()) {
            return Err(ConfigError::Validation(format!(
                "ignore_disks entry '{}' is listed twice",
                disk
            )));
        }
    }
    Ok(())
}

fn validate_channel(cfg: &ChannelConfig) -> Result<(), ConfigError> {
    if cfg.connect_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "channel.connect_timeout_secs must be >= 1".to_string(),
        ));
    }
    if cfg.command_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "channel.command_timeout_secs must be >= 1".to_string(),
        ));
    }
    if cfg.canary_timeout_secs < 1 || cfg.canary_timeout_secs > cfg.command_timeout_secs {
        return Err(ConfigError::Validation(
            "channel.canary_timeout_secs must be in range 1..command_timeout_secs".to_string(),
        ));
    }
    if cfg.elevation_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "channel.elevation_timeout_secs must be >= 1".to_string(),
        ));
    }
    if cfg.command_attempts < 1 {
        return Err(ConfigError::Validation(
            "channel.command_attempts must be >= 1".to_string(),
        ));
    }
    if cfg.benign_exit_codes.contains(&0) {
        return Err(ConfigError::Validation(
            "channel.benign_exit_codes must not contain 0".to_string(),
        ));
    }
    if cfg.slot_wait_secs < 1 {
        return Err(ConfigError::Validation(
            "channel.slot_wait_secs must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_availability(cfg: &AvailabilityConfig) -> Result<(), ConfigError> {
    if cfg.probe_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "availability.probe_timeout_secs must be >= 1".to_string(),
        ));
    }
    if cfg.retry_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "availability.retry_interval_secs must be >= 1".to_string(),
        ));
    }
    Ok(())
}

const fn default_port() -> u16 {
    22
}

fn default_password_env() -> String {
    "NAS_PASSWORD".to_string()
}

const fn default_scan_interval_secs() -> u64 {
    60
}

const fn default_ups_scan_interval_secs() -> u64 {
    30
}

const fn default_max_connections() -> usize {
    5
}

const fn default_cache_timeout_mins() -> u64 {
    30
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

const fn default_canary_timeout_secs() -> u64 {
    2
}

const fn default_command_timeout_secs() -> u64 {
    10
}

const fn default_elevation_timeout_secs() -> u64 {
    10
}

const fn default_command_attempts() -> u32 {
    2
}

fn default_benign_exit_codes() -> Vec<i32> {
    vec![4, 32]
}

const fn default_slot_wait_secs() -> u64 {
    30
}

const fn default_probe_timeout_secs() -> u64 {
    1
}

const fn default_retry_interval_secs() -> u64 {
    30
}
