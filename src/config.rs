use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::bus::{ReconnectPolicy, SyncOptions, DEFAULT_SIGNALING};
use crate::models::SyncChannel;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncConfig {
    /// Channel shared by all devices that should replicate together
    pub channel_name: Option<String>,
    /// Optional passphrase; devices must use the same one to meet
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Relay URL (e.g., "ws://127.0.0.1:4444")
    pub signaling: Option<String>,
    /// Stable device id; a random one is used per run when unset
    pub device_id: Option<String>,
    /// First reconnect delay in milliseconds
    pub reconnect_initial_ms: Option<u64>,
    /// Upper bound for the reconnect delay in milliseconds
    pub reconnect_max_ms: Option<u64>,
}

impl SyncConfig {
    /// Returns true if a channel name is set
    pub fn is_configured(&self) -> bool {
        self.channel_name
            .as_deref()
            .is_some_and(|name| !name.trim().is_empty())
    }

    pub fn channel(&self) -> Option<SyncChannel> {
        let name = self.channel_name.as_ref()?;
        let channel = SyncChannel::new(name.clone());
        Some(match &self.password {
            Some(password) if !password.is_empty() => channel.with_password(password.clone()),
            _ => channel,
        })
    }

    pub fn signaling_url(&self) -> &str {
        self.signaling.as_deref().unwrap_or(DEFAULT_SIGNALING)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let default = ReconnectPolicy::default();
        ReconnectPolicy {
            initial: self
                .reconnect_initial_ms
                .map(Duration::from_millis)
                .unwrap_or(default.initial),
            max: self
                .reconnect_max_ms
                .map(Duration::from_millis)
                .unwrap_or(default.max),
            multiplier: default.multiplier,
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            signaling: self.signaling_url().to_string(),
            reconnect: self.reconnect_policy(),
            ..SyncOptions::default()
        }
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the SQLite database
    pub database_path: ConfigValue<PathBuf>,
    /// Name announced to peers
    pub device_name: ConfigValue<String>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    /// Sync configuration
    pub sync: SyncConfig,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    device_name: Option<String>,
    sync: Option<SyncConfig>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::load_with_env(config_path, |key| std::env::var(key).ok())
    }

    /// Like [`Config::load`], reading environment overrides through `env`.
    pub fn load_with_env(
        config_path: Option<PathBuf>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut database_path = ConfigValue::new(
            Self::default_data_dir().join("chatsync.db"),
            ConfigSource::Default,
        );
        let mut device_name = ConfigValue::new("chatsync".to_string(), ConfigSource::Default);
        let mut config_file = None;
        let mut sync = SyncConfig::default();

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(db_path) = file_config.database_path {
                // Resolve relative paths against config file's directory
                let resolved_path = if db_path.is_relative() {
                    path.parent().map(|p| p.join(&db_path)).unwrap_or(db_path)
                } else {
                    db_path
                };
                database_path = ConfigValue::new(resolved_path, ConfigSource::File);
            }
            if let Some(name) = file_config.device_name {
                device_name = ConfigValue::new(name, ConfigSource::File);
            }
            if let Some(sync_config) = file_config.sync {
                sync = sync_config;
            }
        }

        // Apply environment variable overrides
        if let Some(db_path) = env("CHATSYNC_DATABASE_PATH") {
            database_path = ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        if let Some(name) = env("CHATSYNC_DEVICE_NAME") {
            device_name = ConfigValue::new(name, ConfigSource::Environment);
        }
        if let Some(channel) = env("CHATSYNC_CHANNEL") {
            sync.channel_name = Some(channel);
        }
        if let Some(password) = env("CHATSYNC_PASSWORD") {
            sync.password = Some(password);
        }
        if let Some(url) = env("CHATSYNC_SIGNALING") {
            sync.signaling = Some(url);
        }
        if let Some(device_id) = env("CHATSYNC_DEVICE_ID") {
            sync.device_id = Some(device_id);
        }

        Ok(Self {
            database_path,
            device_name,
            config_file,
            sync,
        })
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/chatsync/
    /// - macOS: ~/Library/Application Support/chatsync/
    /// - Windows: %APPDATA%/chatsync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatsync")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/chatsync/
    /// - macOS: ~/Library/Application Support/chatsync/
    /// - Windows: %APPDATA%/chatsync/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatsync")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadError(_, e) => Some(e),
            ConfigError::ParseError(_, e) => Some(e),
        }
    }
}
