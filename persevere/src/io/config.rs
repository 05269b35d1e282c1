//! Plugin configuration stored under `.persevere/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = ".persevere/config.toml";
pub const DEFAULT_STATE_PATH: &str = ".persevere/loop-state.md";

/// Plugin configuration (TOML).
///
/// Every field is optional in the file; missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PluginConfig {
    /// Seconds between an idle session with open todos and the continuation prompt.
    pub countdown_seconds: u64,

    /// Show a toast for every elapsed countdown second.
    pub countdown_toasts: bool,

    /// Suppress todo continuations for this long after a session error.
    pub error_cooldown_ms: u64,

    pub toast_duration_ms: u64,

    /// Iteration ceiling for loops started without an explicit one.
    pub default_max_iterations: u32,

    /// Secondary agent the continuation prompt suggests asking when blocked.
    pub help_agent: Option<String>,

    /// Passed through to every prompt call.
    pub agent: Option<String>,
    pub model: Option<String>,

    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,

    /// Persisted iteration loop record.
    pub state_path: PathBuf,

    /// Number of recent messages handed to the completion evaluator.
    pub transcript_limit: usize,

    pub delivery: DeliveryMode,

    pub evaluator: EvaluatorConfig,
}

/// Who owns the wait before an injection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// The scheduler runs its own timer and sends the prompt.
    #[default]
    Direct,
    /// The host is told about the injection and triggers it when ready.
    Host,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluatorMode {
    /// Ask the host to judge completion.
    #[default]
    Host,
    /// Run an external command.
    Command,
    /// No evaluator; any running loop is torn down on its first idle.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub mode: EvaluatorMode,
    /// Argv for `mode = "command"` (e.g. `["./judge.sh"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            mode: EvaluatorMode::Host,
            command: Vec::new(),
            timeout_secs: 300,
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            countdown_seconds: 2,
            countdown_toasts: true,
            error_cooldown_ms: 3_000,
            toast_duration_ms: 900,
            default_max_iterations: 10,
            help_agent: None,
            agent: None,
            model: None,
            log_level: "warn".to_string(),
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            transcript_limit: 20,
            delivery: DeliveryMode::Direct,
            evaluator: EvaluatorConfig::default(),
        }
    }
}

impl PluginConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_max_iterations == 0 {
            return Err(anyhow!("default_max_iterations must be > 0"));
        }
        if self.toast_duration_ms == 0 {
            return Err(anyhow!("toast_duration_ms must be > 0"));
        }
        if self.transcript_limit == 0 {
            return Err(anyhow!("transcript_limit must be > 0"));
        }
        if self.state_path.as_os_str().is_empty() {
            return Err(anyhow!("state_path must not be empty"));
        }
        if self.evaluator.mode == EvaluatorMode::Command {
            if self.evaluator.command.is_empty() || self.evaluator.command[0].trim().is_empty() {
                return Err(anyhow!("evaluator.command must be a non-empty array"));
            }
            if self.evaluator.timeout_secs == 0 {
                return Err(anyhow!("evaluator.timeout_secs must be > 0"));
            }
        }
        Ok(())
    }

    pub fn countdown(&self) -> Duration {
        Duration::from_secs(self.countdown_seconds)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_millis(self.error_cooldown_ms)
    }

    /// Resolve `state_path` against `root` when it is relative.
    pub fn state_path_in(&self, root: &Path) -> PathBuf {
        if self.state_path.is_absolute() {
            self.state_path.clone()
        } else {
            root.join(&self.state_path)
        }
    }
}

/// Load the plugin config. A missing file means every default applies.
pub fn load_config(path: &Path) -> Result<PluginConfig> {
    let cfg = match fs::read_to_string(path) {
        Ok(contents) => toml::from_str::<PluginConfig>(&contents)
            .with_context(|| format!("plugin config {} is not valid TOML", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => PluginConfig::default(),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("cannot read plugin config {}", path.display()));
        }
    };
    cfg.validate()
        .with_context(|| format!("plugin config {} rejected", path.display()))?;
    Ok(cfg)
}

/// Persist `cfg` as TOML, replacing any existing file atomically.
pub fn write_config(path: &Path, cfg: &PluginConfig) -> Result<()> {
    cfg.validate().context("refusing to write an invalid plugin config")?;
    let rendered = toml::to_string_pretty(cfg).context("render plugin config as TOML")?;
    super::write_atomic(path, &format!("{rendered}\n"))
}
