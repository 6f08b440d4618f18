//! Configuration loading.
//!
//! Layering: built-in defaults, then the TOML config file, then `OTTR__`
//! prefixed environment variables (`OTTR__BRIDGE__FALLBACK_ANSWER=...`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::bridge::{DEFAULT_OVERFLOW_MARKERS, ManagerConfig};
use crate::sandbox::RuntimeKind;
use crate::session::AgentCommand;

pub const APP_NAME: &str = "ottr";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub bridge: BridgeSection,
    pub sandbox: SandboxSection,
    pub log: LogSection,
}

/// `[agent]`: how to launch the agent CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub binary: String,
    /// The defaults enable bidirectional stream-JSON with approval prompts
    /// disabled.
    pub args: Vec<String>,
    /// Working directory for the agent process.
    pub workdir: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        let command = AgentCommand::default();
        Self {
            binary: command.program,
            args: command.args,
            workdir: None,
        }
    }
}

/// `[bridge]`: output shaping and recovery tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSection {
    pub question_debounce_ms: u64,
    pub choice_timeout_secs: u64,
    /// Regexes matched against a turn's combined text to detect context
    /// overflow.
    pub overflow_patterns: Vec<String>,
    /// Input sent when a choice prompt times out or resolves without text.
    pub fallback_answer: String,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            question_debounce_ms: 800,
            choice_timeout_secs: 300,
            overflow_patterns: DEFAULT_OVERFLOW_MARKERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fallback_answer: "skip".to_string(),
        }
    }
}

/// `[sandbox]`: where the agent process runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub mode: SandboxMode,
    /// Container name (container mode).
    pub container: String,
    /// Image used to create the container if it does not exist.
    pub image: String,
    /// Explicit runtime; auto-detected when unset.
    pub runtime: Option<RuntimeKind>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            mode: SandboxMode::Host,
            container: "ottr-agent".to_string(),
            image: "ottr-sandbox:latest".to_string(),
            runtime: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    /// Agent runs directly on the host.
    #[default]
    Host,
    /// Agent runs inside a managed container.
    Container,
}

/// `[log]`: logging defaults; CLI flags override.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
    pub json: bool,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration: defaults, then the config file (if present), then
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_file = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_file()?,
        };

        let built = Config::builder()
            .add_source(
                File::from(config_file.as_path())
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(Environment::with_prefix("OTTR").separator("__"))
            .build()
            .context("loading configuration")?;

        // `config` only layers what the sources provide; fill the rest from
        // serde defaults.
        let mut cfg: AppConfig = built.try_deserialize().context("parsing configuration")?;
        if cfg.bridge.overflow_patterns.is_empty() {
            cfg.bridge.overflow_patterns = BridgeSection::default().overflow_patterns;
        }
        Ok(cfg)
    }

    /// Compile the bridge settings the session manager consumes.
    pub fn manager_config(&self) -> Result<ManagerConfig> {
        let mut patterns = Vec::with_capacity(self.bridge.overflow_patterns.len());
        for pattern in &self.bridge.overflow_patterns {
            patterns.push(
                Regex::new(pattern)
                    .with_context(|| format!("invalid overflow pattern {pattern:?}"))?,
            );
        }

        let mut agent = AgentCommand::new(&self.agent.binary).with_args(self.agent.args.clone());
        if let Some(ref workdir) = self.agent.workdir {
            agent.cwd = Some(expand_path(workdir));
        }

        Ok(ManagerConfig {
            agent,
            question_debounce: Duration::from_millis(self.bridge.question_debounce_ms),
            choice_timeout: Duration::from_secs(self.bridge.choice_timeout_secs),
            overflow_patterns: patterns,
            fallback_answer: self.bridge.fallback_answer.clone(),
        })
    }

    /// Render the effective configuration as TOML (for `check --print`).
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serializing configuration")
    }
}

/// Default config file location: `<config dir>/ottr/config.toml`.
pub fn default_config_file() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("could not determine config directory")?;
    Ok(dir.join(APP_NAME).join("config.toml"))
}

/// Expand `~` in a user-supplied path.
pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}
