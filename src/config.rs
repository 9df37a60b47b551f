use crate::bus::unix_socket::default_socket_path;
use crate::bus::{ClientIdentity, RoleType};
use crate::listener::DEFAULT_RETRY_ATTEMPTS;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Socket path override.
pub const ENV_SOCKET: &str = "LUNABRIDGE_SOCKET";
/// Spreader pause after each delivery, in milliseconds.
pub const ENV_SPREAD_DELAY_MS: &str = "LUNABRIDGE_SPREAD_DELAY_MS";
/// Older name of [`ENV_SPREAD_DELAY_MS`], still honoured.
pub const ENV_SPREAD_DELAY_LEGACY: &str = "WEBOS_QML_WEBOSSERVICES_SPREAD_EVENTS_WAIT_AFTER_RESPONSE";
pub const ENV_APP_ID: &str = "APP_ID";
pub const ENV_ROLE_TYPE: &str = "ROLE_TYPE";

/// Upper bound for the spreader pause; anything longer stalls every listener.
const MAX_POST_DELAY_MS: u64 = 10_000;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to find config directory")]
    NoConfigDir,

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub calls: CallsConfig,

    #[serde(default)]
    pub spreader: SpreaderConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct BusConfig {
    /// Hub socket; the runtime directory default is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,

    /// Application id to call as. Empty means a plain service client.
    #[serde(default)]
    pub app_id: String,

    /// "regular", "privileged" or empty.
    #[serde(default)]
    pub role_type: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CallsConfig {
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Per-call timeout in milliseconds; 0 disables it.
    #[serde(default)]
    pub timeout_ms: u64,
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            timeout_ms: 0,
        }
    }
}

fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct SpreaderConfig {
    /// Pause after each spread delivery, in milliseconds.
    #[serde(default)]
    pub post_delay_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("org", "webosports", "lunabridge")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from file, or create default if not exists.
    ///
    /// Environment overrides are applied on top.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;

        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            let config = Config::default();
            config.save_to(&path)?;
            config
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load and validate the file at `path`, without environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.calls.retry_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry_attempts must be at least 1".into(),
            ));
        }

        if self.spreader.post_delay_ms > MAX_POST_DELAY_MS {
            return Err(ConfigError::ValidationError(format!(
                "post_delay_ms cannot exceed {} ms",
                MAX_POST_DELAY_MS
            )));
        }

        if !self.bus.role_type.is_empty() && RoleType::parse(&self.bus.role_type).is_none() {
            return Err(ConfigError::ValidationError(format!(
                "unknown role_type \"{}\" (expected regular or privileged)",
                self.bus.role_type
            )));
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "unknown logging level \"{}\"",
                self.logging.level
            )));
        }

        if self.bus.app_id.chars().any(char::is_whitespace) {
            return Err(ConfigError::ValidationError(
                "app_id must not contain whitespace".into(),
            ));
        }

        if let Some(path) = &self.bus.socket_path {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::ValidationError(
                    "socket_path must not be empty".into(),
                ));
            }
        }

        Ok(())
    }

    /// Save config to file
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Create config directory if needed
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;

        info!("Config saved to: {}", path.display());
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`. Unparsable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(socket) = lookup(ENV_SOCKET).filter(|s| !s.is_empty()) {
            self.bus.socket_path = Some(PathBuf::from(socket));
        }
        if let Some(app_id) = lookup(ENV_APP_ID).filter(|s| !s.is_empty()) {
            self.bus.app_id = app_id;
        }
        if let Some(role) = lookup(ENV_ROLE_TYPE) {
            if RoleType::parse(&role).is_some() {
                self.bus.role_type = role;
            } else {
                warn!("Ignoring {}={:?}", ENV_ROLE_TYPE, role);
            }
        }

        let delay = lookup(ENV_SPREAD_DELAY_MS)
            .map(|v| (ENV_SPREAD_DELAY_MS, v))
            .or_else(|| lookup(ENV_SPREAD_DELAY_LEGACY).map(|v| (ENV_SPREAD_DELAY_LEGACY, v)));
        if let Some((name, value)) = delay {
            match value.trim().parse::<u64>() {
                Ok(ms) => self.spreader.post_delay_ms = ms,
                Err(_) => warn!("Ignoring {}={:?}: not a number of milliseconds", name, value),
            }
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.bus
            .socket_path
            .clone()
            .unwrap_or_else(default_socket_path)
    }

    pub fn spread_delay(&self) -> Duration {
        Duration::from_millis(self.spreader.post_delay_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        (self.calls.timeout_ms > 0).then(|| Duration::from_millis(self.calls.timeout_ms))
    }

    /// Identity calls are made as.
    ///
    /// With an app id this is an application client, otherwise a service
    /// client named `fallback`.
    pub fn identity(&self, fallback: &str) -> ClientIdentity {
        let role = RoleType::parse(&self.bus.role_type).unwrap_or_default();
        if self.bus.app_id.is_empty() {
            ClientIdentity::service(fallback).with_role(role)
        } else {
            ClientIdentity::application(self.bus.app_id.clone()).with_role(role)
        }
    }
}

/// Show current configuration
pub fn show() -> anyhow::Result<()> {
    let config = Config::load()?;
    let path = Config::config_path()?;

    println!("Config file: {}\n", path.display());
    println!("{}", toml::to_string_pretty(&config)?);
    println!("# effective socket: {}", config.socket_path().display());

    Ok(())
}

/// Update configuration
pub fn update(
    socket: Option<PathBuf>,
    app_id: Option<String>,
    retry: Option<u32>,
    spread_delay_ms: Option<u64>,
) -> anyhow::Result<()> {
    let path = Config::config_path()?;
    let mut config = if path.exists() {
        Config::load_from(&path)?
    } else {
        Config::default()
    };
    let mut changed = false;

    if let Some(socket) = socket {
        config.bus.socket_path = Some(socket);
        changed = true;
    }

    if let Some(id) = app_id {
        config.bus.app_id = id;
        changed = true;
    }

    if let Some(attempts) = retry {
        config.calls.retry_attempts = attempts;
        changed = true;
    }

    if let Some(ms) = spread_delay_ms {
        config.spreader.post_delay_ms = ms;
        changed = true;
    }

    if changed {
        config.validate()?;
        config.save_to(&path)?;
        println!("Configuration updated.");
    } else {
        println!("No changes. Use --show to view current config.");
    }

    Ok(())
}
