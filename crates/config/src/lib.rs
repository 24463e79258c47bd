//! Configuration loading, validation, and management for Loopwright.
//!
//! Loads configuration from `~/.loopwright/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.loopwright/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Turn loop settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Context window budget
    #[serde(default)]
    pub context: ContextConfig,

    /// Compaction strategy selection and thresholds
    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Approval policy
    #[serde(default)]
    pub approval: ApprovalConfig,

    /// History storage backend
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Upper bound on model calls per run
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

fn default_max_steps() -> usize {
    25
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Tokens of the model context window allocated to history
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Compact when usage exceeds `max_tokens * trigger_ratio`
    #[serde(default = "default_trigger_ratio")]
    pub trigger_ratio: f64,

    /// Per-part character budget for stored tool output
    #[serde(default = "default_tool_output_max_chars")]
    pub tool_output_max_chars: usize,
}

fn default_max_tokens() -> usize {
    128_000
}
fn default_trigger_ratio() -> f64 {
    1.0
}
fn default_tool_output_max_chars() -> usize {
    20_000
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            trigger_ratio: default_trigger_ratio(),
            tool_output_max_chars: default_tool_output_max_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Registry tag of the active strategy
    #[serde(default = "default_strategy")]
    pub strategy: String,

    #[serde(default = "default_preserve_last_n_turns")]
    pub preserve_last_n_turns: usize,

    /// Decline when the candidate set has this many messages or fewer
    #[serde(default = "default_min_messages_to_summarize")]
    pub min_messages_to_summarize: usize,

    /// Minimum kept messages when turn boundaries cannot be found
    #[serde(default = "default_fallback_min_keep")]
    pub fallback_min_keep: usize,

    /// Fraction of messages kept when turn boundaries cannot be found
    #[serde(default = "default_fallback_keep_ratio")]
    pub fallback_keep_ratio: f64,

    /// Character preview per message in the summary prompt
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,

    #[serde(default = "default_eviction_min_trailing")]
    pub eviction_min_trailing: usize,

    /// Eviction aims for `max_tokens * eviction_target_ratio`
    #[serde(default = "default_eviction_target_ratio")]
    pub eviction_target_ratio: f64,
}

fn default_strategy() -> String {
    "reactive-summary".into()
}
fn default_preserve_last_n_turns() -> usize {
    2
}
fn default_min_messages_to_summarize() -> usize {
    4
}
fn default_fallback_min_keep() -> usize {
    3
}
fn default_fallback_keep_ratio() -> f64 {
    0.2
}
fn default_preview_chars() -> usize {
    500
}
fn default_eviction_min_trailing() -> usize {
    6
}
fn default_eviction_target_ratio() -> f64 {
    0.6
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            preserve_last_n_turns: default_preserve_last_n_turns(),
            min_messages_to_summarize: default_min_messages_to_summarize(),
            fallback_min_keep: default_fallback_min_keep(),
            fallback_keep_ratio: default_fallback_keep_ratio(),
            preview_chars: default_preview_chars(),
            eviction_min_trailing: default_eviction_min_trailing(),
            eviction_target_ratio: default_eviction_target_ratio(),
        }
    }
}

/// How tool confirmations are resolved when nothing more specific applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalMode {
    /// Ask and wait for a response
    #[default]
    Manual,
    AutoApprove,
    AutoDeny,
}

impl std::str::FromStr for ApprovalMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "auto-approve" | "auto_approve" => Ok(Self::AutoApprove),
            "auto-deny" | "auto_deny" => Ok(Self::AutoDeny),
            other => Err(ConfigError::ValidationError(format!(
                "unknown approval mode '{other}' (expected manual, auto-approve or auto-deny)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default)]
    pub mode: ApprovalMode,

    #[serde(default = "default_approval_timeout_secs")]
    pub timeout_secs: u64,

    /// Tool names or `prefix*` patterns that never ask
    #[serde(default)]
    pub auto_approve_tools: Vec<String>,

    #[serde(default = "default_true")]
    pub elicitation_enabled: bool,
}

fn default_approval_timeout_secs() -> u64 {
    120
}
fn default_true() -> bool {
    true
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            mode: ApprovalMode::default(),
            timeout_secs: default_approval_timeout_secs(),
            auto_approve_tools: Vec::new(),
            elicitation_enabled: true,
        }
    }
}

/// Known history backends.
pub const HISTORY_BACKENDS: &[&str] = &["memory", "file", "sqlite"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// "memory", "file" or "sqlite"
    #[serde(default = "default_history_backend")]
    pub backend: String,

    /// Directory (file) or database path (sqlite); defaults under the config dir
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_history_backend() -> String {
    "file".into()
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            backend: default_history_backend(),
            path: None,
        }
    }
}

impl HistoryConfig {
    /// The storage location for the configured backend.
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        match self.backend.as_str() {
            "sqlite" => AppConfig::config_dir().join("history.db"),
            _ => AppConfig::config_dir().join("history"),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.loopwright/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `LOOPWRIGHT_MAX_STEPS`
    /// - `LOOPWRIGHT_MAX_TOKENS`
    /// - `LOOPWRIGHT_APPROVAL_MODE`
    /// - `LOOPWRIGHT_HISTORY_BACKEND`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
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

    /// Apply overrides from an environment lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("LOOPWRIGHT_MAX_STEPS") {
            self.runtime.max_steps = parse_env("LOOPWRIGHT_MAX_STEPS", &raw)?;
        }
        if let Some(raw) = lookup("LOOPWRIGHT_MAX_TOKENS") {
            self.context.max_tokens = parse_env("LOOPWRIGHT_MAX_TOKENS", &raw)?;
        }
        if let Some(raw) = lookup("LOOPWRIGHT_APPROVAL_MODE") {
            self.approval.mode = raw.parse()?;
        }
        if let Some(raw) = lookup("LOOPWRIGHT_HISTORY_BACKEND") {
            self.history.backend = raw.trim().to_ascii_lowercase();
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".loopwright")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.max_steps must be at least 1".into(),
            ));
        }

        if self.context.max_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "context.max_tokens must be > 0".into(),
            ));
        }

        if !(self.context.trigger_ratio > 0.0 && self.context.trigger_ratio <= 4.0) {
            return Err(ConfigError::ValidationError(
                "context.trigger_ratio must be in (0.0, 4.0]".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.compaction.fallback_keep_ratio) {
            return Err(ConfigError::ValidationError(
                "compaction.fallback_keep_ratio must be between 0.0 and 1.0".into(),
            ));
        }

        if !(self.compaction.eviction_target_ratio > 0.0
            && self.compaction.eviction_target_ratio <= 1.0)
        {
            return Err(ConfigError::ValidationError(
                "compaction.eviction_target_ratio must be in (0.0, 1.0]".into(),
            ));
        }

        if !HISTORY_BACKENDS.contains(&self.history.backend.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "history.backend '{}' is not one of {}",
                self.history.backend,
                HISTORY_BACKENDS.join(", ")
            )));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{key}='{raw}' is not a valid number")))
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

impl From<ConfigError> for loopwright_core::Error {
    fn from(err: ConfigError) -> Self {
        loopwright_core::Error::Config {
            message: err.to_string(),
        }
    }
}
