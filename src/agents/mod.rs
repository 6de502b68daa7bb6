//! Agent configurations — which model an agent runs, its system prompt, and
//! the default-agent invariant.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const BUILTIN_DEFAULT_AGENT_ID: &str = "default";
pub const BUILTIN_DEFAULT_MODEL: &str = "claude-sonnet-4";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub agent_id: String,
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Exactly one agent carries this flag.
    #[serde(default)]
    pub default: bool,
}

impl AgentConfig {
    fn builtin_default() -> Self {
        Self {
            agent_id: BUILTIN_DEFAULT_AGENT_ID.into(),
            name: "Assistant".into(),
            model: BUILTIN_DEFAULT_MODEL.into(),
            base_url: None,
            system_prompt: None,
            default: true,
        }
    }
}

/// Persisted agent configs, one keyed mapping on disk.
///
/// A store with no file gets a built-in default agent so the daemon is
/// usable before any configuration happens.
pub struct AgentStore {
    path: PathBuf,
    agents: Mutex<HashMap<String, AgentConfig>>,
}

impl AgentStore {
    pub fn open(path: &Path) -> Result<Self> {
        let mut agents = HashMap::new();
        if path.exists() {
            let raw =
                fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let list: Vec<AgentConfig> =
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
            for a in list {
                agents.insert(a.agent_id.clone(), a);
            }
        }
        if agents.is_empty() {
            let builtin = AgentConfig::builtin_default();
            agents.insert(builtin.agent_id.clone(), builtin);
        }
        Ok(Self {
            path: path.to_path_buf(),
            agents: Mutex::new(agents),
        })
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentConfig> {
        self.lock().get(agent_id).cloned()
    }

    pub fn default_agent(&self) -> AgentConfig {
        let guard = self.lock();
        guard
            .values()
            .find(|a| a.default)
            .cloned()
            .unwrap_or_else(AgentConfig::builtin_default)
    }

    pub fn list(&self) -> Vec<AgentConfig> {
        let mut list: Vec<AgentConfig> = self.lock().values().cloned().collect();
        list.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        list
    }

    /// Insert or replace a config. Marking a config default clears the flag
    /// everywhere else.
    pub fn upsert(&self, mut config: AgentConfig) -> Result<()> {
        {
            let mut guard = self.lock();
            if config.default {
                for a in guard.values_mut() {
                    a.default = false;
                }
            } else {
                // Never leave the store without a default.
                let default_elsewhere = guard
                    .values()
                    .any(|a| a.default && a.agent_id != config.agent_id);
                if !default_elsewhere {
                    config.default = true;
                }
            }
            guard.insert(config.agent_id.clone(), config);
        }
        self.persist()
    }

    /// Delete an agent. The default agent cannot be deleted.
    pub fn delete(&self, agent_id: &str) -> Result<bool> {
        let existed = {
            let mut guard = self.lock();
            match guard.get(agent_id) {
                None => false,
                Some(a) if a.default => {
                    anyhow::bail!("cannot delete the default agent: {agent_id}")
                }
                Some(_) => {
                    guard.remove(agent_id);
                    true
                }
            }
        };
        if existed {
            self.persist()?;
        }
        Ok(existed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AgentConfig>> {
        self.agents
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let data = {
            let mut list: Vec<AgentConfig> = self.lock().values().cloned().collect();
            list.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
            serde_json::to_string_pretty(&list).context("serializing agents")?
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &data).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming {} into place", tmp.display()))?;
        Ok(())
    }
}
