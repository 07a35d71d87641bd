//! Configuration management for TaskBridge
//!
//! Handles loading, saving, and validating the engine configuration:
//! render debounce and splitting, input coalescing, interactive wait bounds,
//! the agent subprocess, and session storage.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Characters kept free in every message for the part header and status line
pub const CHROME_RESERVE: usize = 100;
/// Smallest body budget of one message part
pub const MIN_BUDGET: usize = 64;

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Update renderer settings
    #[serde(default)]
    pub render: RenderConfig,
    /// Input coalescer settings
    #[serde(default)]
    pub coalesce: CoalesceConfig,
    /// Human-in-the-loop wait bounds
    #[serde(default)]
    pub interaction: InteractionConfig,
    /// Agent subprocess settings
    #[serde(default)]
    pub agent: AgentConfig,
    /// Session defaults and storage
    #[serde(default)]
    pub session: SessionConfig,
    /// General application settings
    #[serde(default)]
    pub general: GeneralConfig,
}

impl Config {
    /// Check the values that would make the engine misbehave
    pub fn validate(&self) -> Result<()> {
        if self.render.max_message_len < RenderConfig::MIN_MESSAGE_LEN {
            return Err(Error::Config(format!(
                "render.max_message_len must be at least {}, got {}",
                RenderConfig::MIN_MESSAGE_LEN,
                self.render.max_message_len
            )));
        }
        if self.render.debounce_ms == 0 {
            return Err(Error::Config("render.debounce_ms must be positive".to_string()));
        }
        if !(self.render.backoff_multiplier > 0.0) {
            return Err(Error::Config(format!(
                "render.backoff_multiplier must be positive, got {}",
                self.render.backoff_multiplier
            )));
        }
        if self.coalesce.window_ms == 0 {
            return Err(Error::Config("coalesce.window_ms must be positive".to_string()));
        }
        Ok(())
    }
}

/// Update renderer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Minimum interval between two flushes of the same render target
    pub debounce_ms: u64,
    /// Maximum length of one outbound message, in characters
    pub max_message_len: usize,
    /// Edit retries after a rate-limit rejection, per flush
    pub max_rate_limit_retries: u32,
    /// Upper bound on a single rate-limit wait
    pub max_backoff_ms: u64,
    /// Scale applied to the transport's `retry_after`
    pub backoff_multiplier: f64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2000,
            max_message_len: 4096,
            max_rate_limit_retries: 3,
            max_backoff_ms: 30_000,
            backoff_multiplier: 1.0,
        }
    }
}

impl RenderConfig {
    /// Shortest message that still fits the chrome and a minimal body
    pub const MIN_MESSAGE_LEN: usize = CHROME_RESERVE + MIN_BUDGET;

    /// Body budget of one part, given the limit the transport reports
    pub fn body_budget(&self, transport_limit: Option<usize>) -> usize {
        let limit = match transport_limit {
            Some(transport_limit) => transport_limit.min(self.max_message_len),
            None => self.max_message_len,
        };
        limit.saturating_sub(CHROME_RESERVE).max(MIN_BUDGET)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Wait to apply for a transport-instructed retry delay
    pub fn backoff_for(&self, retry_after: Duration) -> Duration {
        retry_after
            .mul_f64(self.backoff_multiplier)
            .min(self.max_backoff())
    }
}

/// Input coalescer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalesceConfig {
    /// How long a batch stays open collecting inputs
    pub window_ms: u64,
    /// Bound on waiting for an in-flight countdown after cancelling it
    pub settle_timeout_ms: u64,
    /// Joiner used when combining inputs into one text
    pub separator: String,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            window_ms: 1500,
            settle_timeout_ms: 1000,
            separator: "\n\n".to_string(),
        }
    }
}

impl CoalesceConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }
}

/// Interactive wait bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionConfig {
    pub permission_timeout_secs: u64,
    pub question_timeout_secs: u64,
    pub plan_timeout_secs: u64,
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self {
            permission_timeout_secs: 300,
            question_timeout_secs: 300,
            plan_timeout_secs: 600,
        }
    }
}

impl InteractionConfig {
    pub fn permission_timeout(&self) -> Duration {
        Duration::from_secs(self.permission_timeout_secs)
    }

    pub fn question_timeout(&self) -> Duration {
        Duration::from_secs(self.question_timeout_secs)
    }

    pub fn plan_timeout(&self) -> Duration {
        Duration::from_secs(self.plan_timeout_secs)
    }
}

/// Agent subprocess configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Executable speaking the JSON-lines turn protocol
    pub command: String,
    /// Extra arguments passed to the executable
    pub args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude-agent".to_string(),
            args: Vec::new(),
        }
    }
}

/// Session defaults and storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Working directory for users without a stored preference
    pub default_working_dir: PathBuf,
    /// Directory for persisted session files
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_working_dir: std::env::current_dir().unwrap_or_default(),
            storage_dir: None,
        }
    }
}

impl SessionConfig {
    /// Storage directory, falling back to the platform data dir
    pub fn storage_dir(&self) -> PathBuf {
        self.storage_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|p| p.join("taskbridge"))
                .unwrap_or_else(|| PathBuf::from(".taskbridge"))
                .join("sessions")
        })
    }
}

/// General application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
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
        config.validate()?;

        Ok(Self { config_path, config })
    }

    /// Get the default config path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".to_string()))?;

        Ok(config_dir.join("taskbridge").join("config.toml"))
    }

    fn load_from_path(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> Result<()> {
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
}
