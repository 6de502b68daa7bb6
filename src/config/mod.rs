//! Configuration — config.toml loading and the directory layout for
//! persistent state.
//!
//! Everything the daemon persists (session index, transcripts, bindings,
//! agents, providers, cron jobs, subagent runs) lives under `state_dir`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Terminal socket adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Address the JSON-lines socket listens on.
    #[serde(default = "default_terminal_bind")]
    pub bind: String,
}

fn default_terminal_bind() -> String {
    "127.0.0.1:7878".to_string()
}

/// Telegram bot adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Sender ids permitted to talk to the bot. Empty denies everyone,
    /// `"*"` allows everyone.
    #[serde(default)]
    pub allowed_senders: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub terminal: Option<TerminalConfig>,
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentConfig {
    /// Minutes a finished `keep` run stays in the registry before the
    /// sweeper archives it.
    #[serde(default = "default_archive_after_minutes")]
    pub archive_after_minutes: i64,
}

fn default_archive_after_minutes() -> i64 {
    60
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            archive_after_minutes: default_archive_after_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root for all persistent state.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Working directory agents operate in; also where `skills/` lives.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub subagents: SubagentConfig,
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".crossbar")
}

fn default_workspace_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("crossbar")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            workspace_dir: default_workspace_dir(),
            channels: ChannelsConfig::default(),
            subagents: SubagentConfig::default(),
        }
    }
}

impl Config {
    /// Load config.toml from `path`, or defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Default config file location: `<state_dir>/config.toml`.
    pub fn default_path() -> PathBuf {
        default_state_dir().join("config.toml")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    pub fn bindings_path(&self) -> PathBuf {
        self.state_dir.join("bindings.json")
    }

    pub fn agents_path(&self) -> PathBuf {
        self.state_dir.join("agents.json")
    }

    pub fn providers_path(&self) -> PathBuf {
        self.state_dir.join("providers.json")
    }

    pub fn cron_jobs_path(&self) -> PathBuf {
        self.state_dir.join("cron_jobs.json")
    }

    pub fn subagent_runs_path(&self) -> PathBuf {
        self.state_dir.join("subagent_runs.json")
    }
}
