//! Configuration management for tether.
//!
//! Loads configuration from ${TETHER_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Reasoning effort requested from the app-server when a thread is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    None,
    Minimal,
    Low,
    /// Balanced default
    #[default]
    Medium,
    High,
    XHigh,
}

impl ReasoningEffort {
    /// Returns the wire label for this effort.
    pub fn as_wire(self) -> &'static str {
        match self {
            ReasoningEffort::None => "none",
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
            ReasoningEffort::XHigh => "xhigh",
        }
    }
}

/// How to launch and drive the app-server subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppServerConfig {
    /// Executable to spawn.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Working directory for the subprocess (and for new threads).
    pub cwd: Option<PathBuf>,
    /// Model requested for new threads.
    pub model: Option<String>,
    pub reasoning_effort: ReasoningEffort,
    /// Approval policy requested for new threads.
    pub approval_policy: String,
    /// Sandbox mode requested for new threads.
    pub sandbox: String,
    /// Tool-routing endpoint exposed back to the subprocess (MCP over HTTP).
    pub tool_endpoint: Option<String>,
    /// Name the tool endpoint is registered under.
    pub tool_server_name: String,
    /// Deadline for a single physical attempt in seconds (0 disables).
    pub turn_timeout_secs: u64,
}

impl Default for AppServerConfig {
    fn default() -> Self {
        Self {
            command: "codex".to_string(),
            args: vec!["app-server".to_string()],
            cwd: None,
            model: None,
            reasoning_effort: ReasoningEffort::default(),
            approval_policy: "never".to_string(),
            sandbox: "read-only".to_string(),
            tool_endpoint: None,
            tool_server_name: "tether".to_string(),
            turn_timeout_secs: 600,
        }
    }
}

impl AppServerConfig {
    pub fn turn_timeout(&self) -> Option<Duration> {
        if self.turn_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.turn_timeout_secs))
        }
    }
}

/// Burst dispatcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Coalescing window in milliseconds.
    pub coalesce_window_ms: u64,
    /// Bounded queue depth per conversation key.
    pub queue_depth: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: 1200,
            queue_depth: 128,
        }
    }
}

impl DispatchConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }
}

/// Answers given to server-initiated requests.
///
/// Approval requests are always declined; only the user-input heuristic is
/// configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Substrings (case-insensitive) that mark the preferred option when
    /// answering a user-input request.
    pub decline_labels: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            decline_labels: vec!["decline".to_string(), "cancel".to_string()],
        }
    }
}

/// Instructions sent with every new thread.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    /// Optional inline base instructions
    pub base_instructions: Option<String>,
    /// Optional path to a file containing the base instructions
    pub base_instructions_file: Option<String>,
    /// Optional developer instructions
    pub developer_instructions: Option<String>,
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`).
    pub level: String,
    /// Also write a daily-rolling log file under `${TETHER_HOME}/logs`.
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: false,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app_server: AppServerConfig,
    pub dispatch: DispatchConfig,
    pub policy: PolicyConfig,
    pub prompts: PromptsConfig,
    pub logging: LoggingConfig,
}

/// Returns the default config template with comments.
///
/// This is embedded from default_config.toml at compile time.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

pub mod paths {
    //! Path resolution for tether configuration and data directories.
    //!
    //! TETHER_HOME resolution order:
    //! 1. TETHER_HOME environment variable (if set)
    //! 2. ~/.config/tether (default)
    //! 3. ./.tether when no home directory can be determined

    use std::path::PathBuf;

    /// Returns the tether home directory.
    pub fn tether_home() -> PathBuf {
        if let Ok(home) = std::env::var("TETHER_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".tether"),
            |h| h.join(".config").join("tether"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        tether_home().join("config.toml")
    }

    /// Returns the directory for rolling log files.
    pub fn logs_dir() -> PathBuf {
        tether_home().join("logs")
    }
}

impl Config {
    /// Loads configuration from the default config path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Writes the commented default template to `path`.
    ///
    /// # Errors
    /// Fails if the file already exists (no silent overwrite) or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        Self::write_config(path, default_config_template())
    }

    /// Returns the effective base instructions, preferring the file if both are set.
    ///
    /// # Errors
    /// Returns an error if the instructions file cannot be read.
    pub fn effective_base_instructions(&self) -> Result<Option<String>> {
        if let Some(path_str) = &self.prompts.base_instructions_file {
            let path = Path::new(path_str);
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read base instructions file: {path_str}"))?;
            let trimmed = content.trim();
            return Ok((!trimmed.is_empty()).then(|| trimmed.to_string()));
        }

        let trimmed = self
            .prompts
            .base_instructions
            .as_deref()
            .unwrap_or("")
            .trim();
        Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
    }

    /// Returns the developer instructions, if any non-blank ones are set.
    pub fn developer_instructions(&self) -> Option<String> {
        let trimmed = self
            .prompts
            .developer_instructions
            .as_deref()
            .unwrap_or("")
            .trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    fn write_config(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }
}
