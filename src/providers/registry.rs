//! The provider registry — persisted provider configs and model resolution.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The two supported wire encodings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    OpenAi,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub credential: String,
    pub dialect: Dialect,
    /// Models this provider serves. Uniqueness across providers is not
    /// enforced; resolution takes the first match in insertion order.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub seq: u64,
}

/// Persisted provider configs, one keyed mapping on disk.
pub struct ProviderRegistry {
    path: PathBuf,
    providers: Mutex<HashMap<String, ProviderConfig>>,
    next_seq: Mutex<u64>,
}

impl ProviderRegistry {
    pub fn open(path: &Path) -> Result<Self> {
        let mut providers = HashMap::new();
        if path.exists() {
            let raw =
                fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let list: Vec<ProviderConfig> =
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
            for p in list {
                providers.insert(p.id.clone(), p);
            }
        }
        let next_seq = providers.values().map(|p| p.seq + 1).max().unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            providers: Mutex::new(providers),
            next_seq: Mutex::new(next_seq),
        })
    }

    pub fn get(&self, id: &str) -> Option<ProviderConfig> {
        self.lock().get(id).cloned()
    }

    pub fn list(&self) -> Vec<ProviderConfig> {
        let mut list: Vec<ProviderConfig> = self.lock().values().cloned().collect();
        list.sort_by_key(|p| p.seq);
        list
    }

    pub fn default_provider(&self) -> Option<ProviderConfig> {
        self.list().into_iter().find(|p| p.default)
    }

    /// Resolve a model name to its serving provider: first provider (in
    /// insertion order) listing the model, else the default provider.
    pub fn resolve_model(&self, model: &str) -> Option<ProviderConfig> {
        let list = self.list();
        list.iter()
            .find(|p| p.models.iter().any(|m| m == model))
            .cloned()
            .or_else(|| list.into_iter().find(|p| p.default))
    }

    /// Insert or replace a config. Marking one default clears the flag
    /// elsewhere; the first config added becomes default automatically.
    pub fn upsert(&self, mut config: ProviderConfig) -> Result<()> {
        {
            let mut guard = self.lock();
            if config.seq == 0 && !guard.contains_key(&config.id) {
                let mut seq_guard = self
                    .next_seq
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                config.seq = *seq_guard;
                *seq_guard += 1;
            }
            if config.default {
                for p in guard.values_mut() {
                    p.default = false;
                }
            } else {
                // Never leave the registry without a default.
                let default_elsewhere =
                    guard.values().any(|p| p.default && p.id != config.id);
                if !default_elsewhere {
                    config.default = true;
                }
            }
            guard.insert(config.id.clone(), config);
        }
        self.persist()
    }

    /// Delete a provider. The default provider cannot be deleted.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let existed = {
            let mut guard = self.lock();
            match guard.get(id) {
                None => false,
                Some(p) if p.default => {
                    anyhow::bail!("cannot delete the default provider: {id}")
                }
                Some(_) => {
                    guard.remove(id);
                    true
                }
            }
        };
        if existed {
            self.persist()?;
        }
        Ok(existed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProviderConfig>> {
        self.providers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let data = {
            let mut list: Vec<ProviderConfig> = self.lock().values().cloned().collect();
            list.sort_by_key(|p| p.seq);
            serde_json::to_string_pretty(&list).context("serializing providers")?
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &data).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming {} into place", tmp.display()))?;
        Ok(())
    }
}
