//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/agentchat/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/agentchat/` (~/.config/agentchat/)
//! - Data: `$XDG_DATA_HOME/agentchat/` (~/.local/share/agentchat/)
//! - State/Logs: `$XDG_STATE_HOME/agentchat/` (~/.local/state/agentchat/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Conversation behaviour
    #[serde(default)]
    pub chat: ChatConfig,

    /// HTTP client settings shared by all model backends
    #[serde(default)]
    pub http: HttpConfig,

    /// Per-provider overrides keyed by provider code
    #[serde(default)]
    pub providers: HashMap<String, ProviderOverride>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Conversation orchestration settings
#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// Number of prior messages replayed into the prompt
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Characters of the first message used as the session title
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,

    /// Title used when the first message is blank
    #[serde(default = "default_title")]
    pub default_title: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            title_max_chars: default_title_max_chars(),
            default_title: default_title(),
        }
    }
}

fn default_history_window() -> usize {
    30
}

fn default_title_max_chars() -> usize {
    30
}

fn default_title() -> String {
    "New Chat".to_string()
}

/// HTTP client configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Whole-request timeout in seconds (covers streaming bodies)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Operator-level override for one provider code
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProviderOverride {
    /// Base URL used when the provider profile does not set one
    pub base_url: Option<String>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.chat.history_window == 0 {
            return Err(Error::Config(
                "chat.history_window must be at least 1".to_string(),
            ));
        }
        if self.chat.title_max_chars == 0 {
            return Err(Error::Config(
                "chat.title_max_chars must be at least 1".to_string(),
            ));
        }
        if self.http.timeout_secs == 0 {
            return Err(Error::Config("http.timeout_secs must be positive".to_string()));
        }
        Ok(())
    }

    /// Operator base URL override for a provider code, if any.
    ///
    /// Table keys and `code` are compared trimmed and case-insensitively.
    pub fn provider_base_url(&self, code: &str) -> Option<&str> {
        let code = code.trim();
        self.providers
            .iter()
            .find(|(key, _)| key.trim().eq_ignore_ascii_case(code))
            .and_then(|(_, p)| p.base_url.as_deref())
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/agentchat/config.toml` (~/.config/agentchat/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("agentchat").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/agentchat/` (~/.local/share/agentchat/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("agentchat")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/agentchat/` (~/.local/state/agentchat/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("agentchat")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/agentchat/agentchat.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("agentchat.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/agentchat/agentchat.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("agentchat.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.chat.history_window, 30);
        assert_eq!(config.chat.title_max_chars, 30);
        assert_eq!(config.chat.default_title, "New Chat");
        assert_eq!(config.http.timeout_secs, 120);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[chat]
history_window = 10

[http]
timeout_secs = 30

[providers.deepseek]
base_url = "https://proxy.internal/deepseek"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.chat.history_window, 10);
        assert_eq!(config.chat.title_max_chars, 30);
        assert_eq!(config.http.timeout_secs, 30);
        assert_eq!(
            config.provider_base_url("DeepSeek"),
            Some("https://proxy.internal/deepseek")
        );
        assert_eq!(config.provider_base_url("openai"), None);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_provider_base_url_key_is_case_insensitive() {
        let toml = r#"
[providers.DeepSeek]
base_url = " https://proxy.internal/deepseek "

[providers.openai]
base_url = "  "
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(
            config.provider_base_url(" deepseek"),
            Some("https://proxy.internal/deepseek")
        );
        assert_eq!(config.provider_base_url("OPENAI"), None);
    }

    #[test]
    fn test_validation_rejects_zero_window() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.chat.history_window = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[chat]\ndefault_title = \"Untitled\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.chat.default_title, "Untitled");
    }

    #[test]
    fn test_paths_end_with_expected_names() {
        assert!(Config::database_path().ends_with("agentchat/agentchat.db"));
        assert!(Config::log_path().ends_with("agentchat/agentchat.log"));
    }
}
