//! Agent configuration stored at `<brain home>/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://api.coding.super25.ai";
pub const DEFAULT_MODEL: &str = "glm-4.7-flash";
pub const HOME_ENV: &str = "BRAIN_HOME";
pub const API_KEY_ENV: &str = "BRAIN_API_KEY";

/// Where brain keeps its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrainPaths {
    pub home: PathBuf,
    pub config_path: PathBuf,
    pub sessions_dir: PathBuf,
}

impl BrainPaths {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            config_path: home.join("config.toml"),
            sessions_dir: home.join("sessions"),
            home,
        }
    }

    /// `$BRAIN_HOME`, or `~/.brain`.
    pub fn resolve() -> Result<Self> {
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::new(PathBuf::from(home)));
        }
        let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
        Ok(Self::new(home.join(".brain")))
    }
}

/// Agent configuration (TOML).
///
/// Edited by humans and by `brain auth`. Missing fields take defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrainConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    pub api_base: String,

    pub default_model: String,

    /// Send the session event log to the backend when a session ends.
    pub telemetry: bool,

    pub model_timeout_secs: u64,

    /// Wall-clock limit for one command block.
    pub command_timeout_secs: u64,

    pub telemetry_timeout_secs: u64,

    /// Truncate captured stdout/stderr beyond this many bytes per stream.
    pub output_limit_bytes: usize,

    /// Overrides `<brain home>/sessions`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions_dir: Option<PathBuf>,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            telemetry: true,
            model_timeout_secs: 120,
            command_timeout_secs: 120,
            telemetry_timeout_secs: 3,
            output_limit_bytes: 100_000,
            sessions_dir: None,
        }
    }
}

impl BrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.api_base.trim().is_empty() {
            return Err(anyhow!("api_base must not be empty"));
        }
        if self.default_model.trim().is_empty() {
            return Err(anyhow!("default_model must not be empty"));
        }
        if self.model_timeout_secs == 0 {
            return Err(anyhow!("model_timeout_secs must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.telemetry_timeout_secs == 0 {
            return Err(anyhow!("telemetry_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    /// Apply an API key taken from the environment; blank values are ignored.
    pub fn apply_env_api_key(&mut self, key: Option<String>) {
        if let Some(key) = key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty()) {
            debug!("api key taken from environment");
            self.api_key = Some(key);
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    /// Key for display: first 8 characters followed by `...`.
    pub fn masked_api_key(&self) -> String {
        match self.api_key() {
            Some(key) => format!("{}...", key.chars().take(8).collect::<String>()),
            None => "(not set)".to_string(),
        }
    }

    pub fn sessions_dir(&self, paths: &BrainPaths) -> PathBuf {
        self.sessions_dir
            .clone()
            .unwrap_or_else(|| paths.sessions_dir.clone())
    }

    /// Explicit runtime settings handed to the orchestrator.
    pub fn agent_config(&self, paths: &BrainPaths, workdir: PathBuf, model: Option<String>) -> AgentConfig {
        AgentConfig {
            api_key: self.api_key().map(str::to_string),
            api_base: self.api_base.trim_end_matches('/').to_string(),
            model: model.unwrap_or_else(|| self.default_model.clone()),
            model_timeout: Duration::from_secs(self.model_timeout_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            telemetry: self.telemetry,
            telemetry_timeout: Duration::from_secs(self.telemetry_timeout_secs),
            output_limit_bytes: self.output_limit_bytes,
            sessions_dir: self.sessions_dir(paths),
            workdir,
        }
    }
}

/// Runtime settings for one invocation. No global state is consulted after this is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: String,
    pub model_timeout: Duration,
    pub command_timeout: Duration,
    pub telemetry: bool,
    pub telemetry_timeout: Duration,
    pub output_limit_bytes: usize,
    pub sessions_dir: PathBuf,
    pub workdir: PathBuf,
}

/// Load config from a TOML file.
///
/// A missing file yields `BrainConfig::default()`. A leading UTF-8 BOM (left by
/// some Windows editors) is ignored.
pub fn load_config(path: &Path) -> Result<BrainConfig> {
    if !path.exists() {
        let cfg = BrainConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let contents = contents.strip_prefix('\u{feff}').unwrap_or(&contents);
    let cfg: BrainConfig =
        toml::from_str(contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &BrainConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
