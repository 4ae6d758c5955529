//! Configuration loading, validation, and management for Aegis.
//!
//! Loads configuration from `~/.aegis/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use aegis_core::agent::{AgentConfig, default_max_iterations};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variables that override file settings.
pub const ENV_AGENT_ID: &str = "AEGIS_AGENT_ID";
pub const ENV_DB_PATH: &str = "AEGIS_DB_PATH";
pub const ENV_STORE_BACKEND: &str = "AEGIS_STORE_BACKEND";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "AEGIS_REQUEST_TIMEOUT_MS";

/// The root configuration structure.
///
/// Maps directly to `~/.aegis/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentSection,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The `[agent]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    /// Address other components use to reach this agent
    #[serde(default = "default_agent_id")]
    pub id: String,

    #[serde(default = "default_agent_name")]
    pub name: String,

    #[serde(default)]
    pub instructions: String,

    /// Generation rounds per turn before giving up
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_agent_id() -> String {
    "aegis".into()
}

fn default_agent_name() -> String {
    "Aegis".into()
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            name: default_agent_name(),
            instructions: String::new(),
            max_iterations: default_max_iterations(),
        }
    }
}

impl AgentSection {
    pub fn to_agent_config(&self) -> AgentConfig {
        AgentConfig::new(&self.id)
            .with_name(&self.name)
            .with_instructions(&self.instructions)
            .with_max_iterations(self.max_iterations)
    }
}

/// Where sessions are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::ValidationError(format!(
                "unknown store backend '{other}' (expected 'sqlite' or 'memory')"
            ))),
        }
    }
}

/// The `[store]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// SQLite database file; defaults to `~/.aegis/sessions.db`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn db_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("sessions.db"))
    }
}

/// The `[bus]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// How long a request waits for its reply
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    120_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl BusConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// The `[logging]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.aegis/config.toml),
    /// then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_from(&config_path)?.with_env_overrides()
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply `AEGIS_*` variables from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (highest priority), then re-validate.
    pub fn with_overrides_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(id) = lookup(ENV_AGENT_ID) {
            self.agent.id = id;
        }
        if let Some(path) = lookup(ENV_DB_PATH) {
            self.store.path = Some(PathBuf::from(path));
        }
        if let Some(backend) = lookup(ENV_STORE_BACKEND) {
            self.store.backend = backend.parse()?;
        }
        if let Some(timeout) = lookup(ENV_REQUEST_TIMEOUT_MS) {
            self.bus.request_timeout_ms = timeout.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "{ENV_REQUEST_TIMEOUT_MS} must be a whole number of milliseconds, got '{timeout}'"
                ))
            })?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".aegis")
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.id.trim().is_empty() {
            return Err(ConfigError::ValidationError("agent.id must not be empty".into()));
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        if self.bus.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "bus.request_timeout_ms must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
