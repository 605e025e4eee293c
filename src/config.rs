//! Layered configuration.
//!
//! Precedence, lowest to highest:
//!
//! 1. Built-in defaults
//! 2. Global config file (`{config dir}/config.toml` via [`ProjectDirs`])
//! 3. Project config file (`./drover.toml`)
//! 4. `DROVER_*` environment variables

use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::engine::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DroverConfig {
    /// Agent CLI binary used for `leaf-prompt` steps.
    pub agent_command: String,

    /// Extra arguments inserted before the prompt on every agent
    /// invocation, parsed with shell quoting rules.
    pub agent_args: String,

    /// Where run records live. Defaults to `~/.drover/state`.
    pub state_dir: Option<PathBuf>,

    /// Where per-run execution logs live. Defaults to `{state_dir}/logs`.
    pub log_dir: Option<PathBuf>,

    /// Where parallel-branch worktrees live. Defaults to
    /// `~/.drover/worktrees/{repo}`.
    pub worktree_dir: Option<PathBuf>,

    /// Hard cap on a single leaf invocation, unless the workflow sets its
    /// own.
    #[serde(with = "humantime_serde")]
    pub step_timeout: Option<Duration>,

    /// Retry defaults applied when neither the workflow nor the step sets a
    /// policy.
    pub retry: Option<RetryPolicy>,
}

impl Default for DroverConfig {
    fn default() -> Self {
        Self {
            agent_command: "claude".to_string(),
            agent_args: String::new(),
            state_dir: None,
            log_dir: None,
            worktree_dir: None,
            step_timeout: None,
            retry: None,
        }
    }
}

/// One file's worth of overrides; only the keys present apply.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigLayer {
    agent_command: Option<String>,
    agent_args: Option<String>,
    state_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    worktree_dir: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    step_timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
}

impl DroverConfig {
    /// Load with the standard file locations and the process environment.
    pub fn load() -> anyhow::Result<Self> {
        let global = ProjectDirs::from("com", "drover", "drover")
            .map(|dirs| dirs.config_dir().join("config.toml"));
        let mut config = Self::load_layered(global.as_deref(), Path::new("drover.toml"))?;
        config.apply_env(&std::env::vars().collect());
        Ok(config)
    }

    fn load_layered(global: Option<&Path>, project: &Path) -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(global) = global {
            config.merge_file(global)?;
        }
        config.merge_file(project)?;
        Ok(config)
    }

    fn merge_file(&mut self, path: &Path) -> anyhow::Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let layer: ConfigLayer = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        self.apply_layer(layer);
        debug!("Loaded config from {}", path.display());
        Ok(())
    }

    fn apply_layer(&mut self, layer: ConfigLayer) {
        if let Some(agent_command) = layer.agent_command {
            self.agent_command = agent_command;
        }
        if let Some(agent_args) = layer.agent_args {
            self.agent_args = agent_args;
        }
        if layer.state_dir.is_some() {
            self.state_dir = layer.state_dir;
        }
        if layer.log_dir.is_some() {
            self.log_dir = layer.log_dir;
        }
        if layer.worktree_dir.is_some() {
            self.worktree_dir = layer.worktree_dir;
        }
        if layer.step_timeout.is_some() {
            self.step_timeout = layer.step_timeout;
        }
        if layer.retry.is_some() {
            self.retry = layer.retry;
        }
    }

    /// Environment overrides. `DROVER_STEP_TIMEOUT` is in seconds.
    fn apply_env(&mut self, vars: &HashMap<String, String>) {
        if let Some(value) = vars.get("DROVER_AGENT_COMMAND") {
            self.agent_command = value.clone();
        }
        if let Some(value) = vars.get("DROVER_AGENT_ARGS") {
            self.agent_args = value.clone();
        }
        if let Some(value) = vars.get("DROVER_STATE_DIR") {
            self.state_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = vars.get("DROVER_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = vars.get("DROVER_WORKTREE_DIR") {
            self.worktree_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = vars.get("DROVER_STEP_TIMEOUT") {
            match value.parse::<u64>() {
                Ok(seconds) => self.step_timeout = Some(Duration::from_secs(seconds)),
                Err(_) => {
                    tracing::warn!("Ignoring DROVER_STEP_TIMEOUT '{value}', expected seconds")
                }
            }
        }
    }

    pub fn effective_state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".drover")
                .join("state")
        })
    }

    pub fn effective_log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.effective_state_dir().join("logs"))
    }

    /// The configured agent arguments, split with shell quoting rules.
    pub fn agent_args_list(&self) -> anyhow::Result<Vec<String>> {
        shell_words::split(&self.agent_args)
            .with_context(|| format!("invalid agent_args '{}'", self.agent_args))
    }
}
