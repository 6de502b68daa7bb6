//! Routing — bindings map a (channel, identity) tuple to an agent.
//!
//! Resolution is tiered: peer, then guild, then team, then account, then
//! channel default, then the ambient default agent. Within a tier the lowest
//! priority number wins; ties break on insertion order.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// A peer constraint: kind (`"dm"`, `"group"`, …) plus the platform id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerMatch {
    pub kind: String,
    pub id: String,
}

/// The identity constraints one binding matches against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BindingMatch {
    pub channel: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub peer: Option<PeerMatch>,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Binding {
    pub binding_id: String,
    pub agent_id: String,
    #[serde(rename = "match")]
    pub matcher: BindingMatch,
    pub priority: i64,
    /// Monotonic insertion counter; the tie-breaker inside a priority level.
    #[serde(default)]
    pub seq: u64,
}

/// One inbound identity to resolve.
#[derive(Debug, Clone, Default)]
pub struct RouteInput {
    pub channel: String,
    pub account_id: Option<String>,
    pub peer: Option<PeerMatch>,
    pub guild_id: Option<String>,
    pub team_id: Option<String>,
}

/// Which tier produced the winning agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    Peer,
    Guild,
    Team,
    Account,
    ChannelDefault,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteResolution {
    pub agent_id: String,
    pub matched_by: MatchedBy,
}

/// Resolve `input` against `bindings`.
///
/// Deterministic for identical inputs and bindings: every tier sorts by
/// `(priority, seq)` before picking.
pub fn resolve(bindings: &[Binding], input: &RouteInput, default_agent_id: &str) -> RouteResolution {
    let mut on_channel: Vec<&Binding> = bindings
        .iter()
        .filter(|b| b.matcher.channel == input.channel)
        .collect();
    on_channel.sort_by_key(|b| (b.priority, b.seq));

    let account_matches = |b: &Binding| match (&b.matcher.account_id, &input.account_id) {
        (None, _) => true,
        (Some(want), _) if want == "*" => true,
        (Some(want), Some(have)) => want == have,
        (Some(_), None) => false,
    };

    // Tier 1: peer (kind + id).
    if let Some(peer) = &input.peer {
        if let Some(b) = on_channel
            .iter()
            .find(|b| b.matcher.peer.as_ref() == Some(peer) && account_matches(b))
        {
            return RouteResolution {
                agent_id: b.agent_id.clone(),
                matched_by: MatchedBy::Peer,
            };
        }
    }

    // Tier 2: guild.
    if let Some(guild) = &input.guild_id {
        if let Some(b) = on_channel.iter().find(|b| {
            b.matcher.peer.is_none()
                && b.matcher.guild_id.as_deref() == Some(guild.as_str())
                && account_matches(b)
        }) {
            return RouteResolution {
                agent_id: b.agent_id.clone(),
                matched_by: MatchedBy::Guild,
            };
        }
    }

    // Tier 3: team.
    if let Some(team) = &input.team_id {
        if let Some(b) = on_channel.iter().find(|b| {
            b.matcher.peer.is_none()
                && b.matcher.guild_id.is_none()
                && b.matcher.team_id.as_deref() == Some(team.as_str())
                && account_matches(b)
        }) {
            return RouteResolution {
                agent_id: b.agent_id.clone(),
                matched_by: MatchedBy::Team,
            };
        }
    }

    // Tier 4: account with no narrower constraint.
    if let Some(account) = &input.account_id {
        if let Some(b) = on_channel.iter().find(|b| {
            b.matcher.peer.is_none()
                && b.matcher.guild_id.is_none()
                && b.matcher.team_id.is_none()
                && b.matcher.account_id.as_deref() == Some(account.as_str())
        }) {
            return RouteResolution {
                agent_id: b.agent_id.clone(),
                matched_by: MatchedBy::Account,
            };
        }
    }

    // Tier 5: channel default (account absent or "*", nothing narrower).
    if let Some(b) = on_channel.iter().find(|b| {
        b.matcher.peer.is_none()
            && b.matcher.guild_id.is_none()
            && b.matcher.team_id.is_none()
            && matches!(b.matcher.account_id.as_deref(), None | Some("*"))
    }) {
        return RouteResolution {
            agent_id: b.agent_id.clone(),
            matched_by: MatchedBy::ChannelDefault,
        };
    }

    // Tier 6: ambient default.
    RouteResolution {
        agent_id: default_agent_id.to_string(),
        matched_by: MatchedBy::Default,
    }
}

// ── BindingStore ─────────────────────────────────────────────────

/// Persisted bindings, one keyed mapping on disk.
pub struct BindingStore {
    path: PathBuf,
    bindings: Mutex<HashMap<String, Binding>>,
    next_seq: Mutex<u64>,
}

impl BindingStore {
    pub fn open(path: &Path) -> Result<Self> {
        let mut bindings = HashMap::new();
        if path.exists() {
            let raw =
                fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let list: Vec<Binding> =
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
            for b in list {
                bindings.insert(b.binding_id.clone(), b);
            }
        }
        let next_seq = bindings.values().map(|b| b.seq + 1).max().unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            bindings: Mutex::new(bindings),
            next_seq: Mutex::new(next_seq),
        })
    }

    pub fn add(&self, agent_id: &str, matcher: BindingMatch, priority: i64) -> Result<Binding> {
        let binding = {
            let mut seq_guard = self
                .next_seq
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let binding = Binding {
                binding_id: Uuid::new_v4().to_string(),
                agent_id: agent_id.to_string(),
                matcher,
                priority,
                seq: *seq_guard,
            };
            *seq_guard += 1;

            let mut guard = self.lock();
            guard.insert(binding.binding_id.clone(), binding.clone());
            binding
        };
        self.persist()?;
        Ok(binding)
    }

    pub fn remove(&self, binding_id: &str) -> Result<bool> {
        let existed = self.lock().remove(binding_id).is_some();
        if existed {
            self.persist()?;
        }
        Ok(existed)
    }

    pub fn list(&self) -> Vec<Binding> {
        let mut list: Vec<Binding> = self.lock().values().cloned().collect();
        list.sort_by_key(|b| (b.priority, b.seq));
        list
    }

    /// Resolve using the current binding set.
    pub fn resolve(&self, input: &RouteInput, default_agent_id: &str) -> RouteResolution {
        resolve(&self.list(), input, default_agent_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Binding>> {
        self.bindings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let data = {
            let mut list: Vec<Binding> = self.lock().values().cloned().collect();
            list.sort_by_key(|b| b.seq);
            serde_json::to_string_pretty(&list).context("serializing bindings")?
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &data).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming {} into place", tmp.display()))?;
        Ok(())
    }
}
