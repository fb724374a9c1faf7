use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from `~/.auto-tundra/config.toml`.
///
/// Every section falls back to defaults, so a partial file (or no file at
/// all) yields a usable configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub qa: QaConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl Config {
    /// Load config from `~/.auto-tundra/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.agents.validate()?;
        self.qa.validate()?;
        self.health.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".auto-tundra")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

fn non_zero(value: u64, field: &str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Validation(format!("{field} must be greater than 0")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `human` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl GeneralConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log_format.as_str() {
            "human" | "json" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "general.log_format must be 'human' or 'json', got '{other}'"
            ))),
        }
    }
}

fn default_project_name() -> String {
    "auto-tundra".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "human".into()
}

/// Agent subprocess settings used by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Executable for the coding-agent CLI.
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Arguments placed before the directive.
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    /// Agent settings file (relative to the project) that receives hooks.
    #[serde(default = "default_settings_file")]
    pub settings_file: String,
    /// Directory (relative to the project) for session log and progress files.
    #[serde(default = "default_session_dir")]
    pub session_dir: String,
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,
    /// Silence longer than this raises a watchdog alert.
    #[serde(default = "default_watchdog_timeout")]
    pub watchdog_timeout_secs: u64,
    /// How long terminal sessions stay queryable before being pruned.
    #[serde(default = "default_session_retention")]
    pub session_retention_secs: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
            settings_file: default_settings_file(),
            session_dir: default_session_dir(),
            watchdog_interval_secs: default_watchdog_interval(),
            watchdog_timeout_secs: default_watchdog_timeout(),
            session_retention_secs: default_session_retention(),
        }
    }
}

impl AgentsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "agents.command must not be empty".to_string(),
            ));
        }
        non_zero(self.watchdog_interval_secs, "agents.watchdog_interval_secs")?;
        non_zero(self.watchdog_timeout_secs, "agents.watchdog_timeout_secs")?;
        Ok(())
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout_secs)
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }
}

fn default_agent_command() -> String {
    "claude".into()
}
fn default_agent_args() -> Vec<String> {
    vec!["--dangerously-skip-permissions".into(), "-p".into()]
}
fn default_settings_file() -> String {
    ".claude/settings.local.json".into()
}
fn default_session_dir() -> String {
    ".auto-tundra/agent-sessions".into()
}
fn default_watchdog_interval() -> u64 {
    15
}
fn default_watchdog_timeout() -> u64 {
    120
}
fn default_session_retention() -> u64 {
    3600
}

/// Polling cadence for the QA runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaConfig {
    /// Settling delay before the first completion check.
    #[serde(default = "default_qa_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_qa_poll_interval")]
    pub poll_interval_ms: u64,
    /// Upper bound on how long a QA agent may run before it is killed.
    #[serde(default = "default_qa_max_wait")]
    pub max_wait_secs: u64,
    /// Directory (relative to the project) holding per-task QA output.
    #[serde(default = "default_qa_output_dir")]
    pub output_dir: String,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_qa_initial_delay(),
            poll_interval_ms: default_qa_poll_interval(),
            max_wait_secs: default_qa_max_wait(),
            output_dir: default_qa_output_dir(),
        }
    }
}

impl QaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero(self.poll_interval_ms, "qa.poll_interval_ms")?;
        non_zero(self.max_wait_secs, "qa.max_wait_secs")?;
        Ok(())
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

fn default_qa_initial_delay() -> u64 {
    5_000
}
fn default_qa_poll_interval() -> u64 {
    3_000
}
fn default_qa_max_wait() -> u64 {
    1_800
}
fn default_qa_output_dir() -> String {
    ".auto-tundra/qa".into()
}

/// Liveness sweep parameters for the health registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// A pulse is missed once silence exceeds `miss_multiplier * expected_interval`.
    #[serde(default = "default_miss_multiplier")]
    pub miss_multiplier: f64,
    /// Consecutive misses before a service is marked unhealthy.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            miss_multiplier: default_miss_multiplier(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero(self.sweep_interval_secs, "health.sweep_interval_secs")?;
        if !(self.miss_multiplier >= 1.0) {
            return Err(ConfigError::Validation(format!(
                "health.miss_multiplier must be >= 1.0, got {}",
                self.miss_multiplier
            )));
        }
        if self.unhealthy_threshold == 0 {
            return Err(ConfigError::Validation(
                "health.unhealthy_threshold must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_sweep_interval() -> u64 {
    30
}
fn default_miss_multiplier() -> f64 {
    1.5
}
fn default_unhealthy_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_max_notifications")]
    pub max_notifications: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            max_notifications: default_max_notifications(),
        }
    }
}

fn default_max_notifications() -> usize {
    100
}
