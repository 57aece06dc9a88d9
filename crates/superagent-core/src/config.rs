//! Configuration management for Superagent
//!
//! Handles loading, saving, and managing application configuration
//! including session timing, cron settings and stateful connection definitions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConnectionError, Error, Result};
use crate::retry::RetryPolicy;
use crate::scheduler::CronConfig;
use crate::session::SessionConfig;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General application settings
    #[serde(default)]
    pub general: GeneralConfig,
    /// Session lifecycle settings
    #[serde(default)]
    pub session: SessionSettings,
    /// Cron scheduler settings
    #[serde(default)]
    pub cron: CronSettings,
    /// Stateful connection definitions, keyed by connection name
    #[serde(default)]
    pub connections: HashMap<String, ConnectionConfig>,
}

impl Config {
    /// Get a connection definition by name
    pub fn get_connection(&self, name: &str) -> Option<&ConnectionConfig> {
        self.connections.get(name)
    }

    /// Enabled connections, sorted by name
    pub fn enabled_connections(&self) -> Vec<(&str, &ConnectionConfig)> {
        let mut enabled: Vec<_> = self
            .connections
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(name, c)| (name.as_str(), c))
            .collect();
        enabled.sort_by(|a, b| a.0.cmp(b.0));
        enabled
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::from(&self.session)
    }

    pub fn cron_config(&self) -> CronConfig {
        CronConfig::from(&self.cron)
    }
}

/// Session lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Idle time after which a session is reaped (seconds)
    pub expiry_secs: u64,
    /// How often a waiting consumer re-checks for expiry (milliseconds)
    pub idle_poll_ms: u64,
    /// Reaper tick (milliseconds)
    pub reaper_tick_ms: u64,
    /// Upper bound on a single connection acquisition (seconds)
    pub acquire_timeout_secs: u64,
    /// Retry policy for connection attempts
    pub connect_retry: RetryPolicy,
}

fn default_connect_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        delay_ms: 500,
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            expiry_secs: 600,
            idle_poll_ms: 1000,
            reaper_tick_ms: 1000,
            acquire_timeout_secs: 60,
            connect_retry: default_connect_retry(),
        }
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            expiry: Duration::from_secs(settings.expiry_secs),
            idle_poll: Duration::from_millis(settings.idle_poll_ms.max(1)),
            reaper_tick: Duration::from_millis(settings.reaper_tick_ms.max(1)),
            acquire_timeout: Duration::from_secs(settings.acquire_timeout_secs),
            connect_retry: settings.connect_retry,
        }
    }
}

/// Cron scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronSettings {
    /// Job store location
    pub persistence_path: PathBuf,
    /// Maximum wait for a delivered job to finish (seconds)
    pub response_timeout_secs: u64,
    /// Floor for the delay between fires (milliseconds)
    pub min_delay_ms: u64,
    /// Retry policy for delivering a fire into the cron session
    pub delivery_retry: RetryPolicy,
}

impl Default for CronSettings {
    fn default() -> Self {
        Self {
            persistence_path: PathBuf::from("./cron_jobs.json"),
            response_timeout_secs: 300,
            min_delay_ms: 100,
            delivery_retry: RetryPolicy::default(),
        }
    }
}

impl From<&CronSettings> for CronConfig {
    fn from(settings: &CronSettings) -> Self {
        Self {
            persistence_path: settings.persistence_path.clone(),
            response_timeout: Duration::from_secs(settings.response_timeout_secs),
            min_delay: Duration::from_millis(settings.min_delay_ms),
            delivery_retry: settings.delivery_retry,
        }
    }
}

/// How a stateful connection reaches its server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Http,
}

/// Stateful connection definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub transport: TransportKind,
    /// Command to launch (stdio)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Endpoint (http)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ConnectionConfig {
    /// Subprocess speaking over stdin/stdout
    pub fn stdio(command: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Stdio,
            command: Some(command.into()),
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            enabled: true,
        }
    }

    /// Remote server over streamable HTTP
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Http,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.into()),
            headers: HashMap::new(),
            enabled: true,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Check the definition is usable for its transport
    pub fn validate(&self, name: &str) -> std::result::Result<(), ConnectionError> {
        if !self.enabled {
            return Err(ConnectionError::Disabled(name.to_string()));
        }
        let missing = match self.transport {
            TransportKind::Stdio if self.command.as_deref().is_none_or(str::is_empty) => "command",
            TransportKind::Http if self.url.as_deref().is_none_or(str::is_empty) => "url",
            _ => return Ok(()),
        };
        Err(ConnectionError::InvalidConfig {
            name: name.to_string(),
            reason: format!("missing {}", missing),
        })
    }
}

/// General application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
        }
    }
}

/// Configuration manager for loading and saving config
pub struct ConfigManager {
    config_path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::with_path(config_path)
    }

    /// Create a config manager with a specific path
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let config = if config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            Config::default()
        };

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Get the default config path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".to_string()))?;

        Ok(config_dir.join("superagent").join("config.toml"))
    }

    /// Load configuration from a file
    fn load_from_path(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Path the configuration is loaded from and saved to
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get mutable access to configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(&self.config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&self.config_path, content)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Add or replace a connection definition
    pub fn set_connection(&mut self, name: &str, connection: ConnectionConfig) {
        self.config.connections.insert(name.to_string(), connection);
    }

    /// Remove a connection definition, returning it if present
    pub fn remove_connection(&mut self, name: &str) -> Option<ConnectionConfig> {
        self.config.connections.remove(name)
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self {
            config_path: PathBuf::from("config.toml"),
            config: Config::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.session.expiry_secs, 600);
        assert_eq!(config.session.reaper_tick_ms, 1000);
        assert_eq!(config.cron.response_timeout_secs, 300);
        assert_eq!(config.cron.delivery_retry.max_attempts, 3);
        assert_eq!(config.session.connect_retry.max_attempts, 1);
        assert!(config.connections.is_empty());
    }

    #[test]
    fn test_runtime_conversion() {
        let config = Config::default();
        let session = config.session_config();
        assert_eq!(session.expiry, Duration::from_secs(600));
        assert_eq!(session.idle_poll, Duration::from_secs(1));

        let cron = config.cron_config();
        assert_eq!(cron.min_delay, Duration::from_millis(100));
        assert_eq!(cron.persistence_path, PathBuf::from("./cron_jobs.json"));
    }

    #[test]
    fn test_zero_poll_is_clamped() {
        let settings = SessionSettings {
            idle_poll_ms: 0,
            reaper_tick_ms: 0,
            ..Default::default()
        };
        let session = SessionConfig::from(&settings);
        assert_eq!(session.idle_poll, Duration::from_millis(1));
        assert_eq!(session.reaper_tick, Duration::from_millis(1));
    }

    #[test]
    fn test_connection_validation() {
        assert!(ConnectionConfig::stdio("npx").validate("fs").is_ok());
        assert!(ConnectionConfig::http("http://localhost:8931/mcp")
            .validate("browser")
            .is_ok());

        let no_url = ConnectionConfig {
            url: None,
            ..ConnectionConfig::http("")
        };
        assert!(matches!(
            no_url.validate("remote"),
            Err(ConnectionError::InvalidConfig { .. })
        ));

        let disabled = ConnectionConfig::stdio("npx").with_enabled(false);
        assert!(matches!(
            disabled.validate("fs"),
            Err(ConnectionError::Disabled(_))
        ));
    }

    #[test]
    fn test_enabled_connections_sorted() {
        let mut config = Config::default();
        config
            .connections
            .insert("zeta".to_string(), ConnectionConfig::stdio("z"));
        config
            .connections
            .insert("alpha".to_string(), ConnectionConfig::stdio("a"));
        config.connections.insert(
            "off".to_string(),
            ConnectionConfig::stdio("o").with_enabled(false),
        );

        let names: Vec<_> = config.enabled_connections().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
