//! Background-run records — persisted lifecycle tracking plus the archival
//! sweeper.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const SUBAGENT_KEY_PREFIX: &str = "subagent:";
const SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubagentOutcome {
    Ok,
    Error,
    Timeout,
    /// The process restarted while the run was in flight.
    Interrupted,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CleanupMode {
    /// Remove the child session once its result was announced.
    #[default]
    Delete,
    /// Keep the child session until the archive deadline passes.
    Keep,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubagentRun {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    pub requester_channel: String,
    pub task: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub cleanup: CleanupMode,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outcome: Option<SubagentOutcome>,
    /// When the sweeper may drop this record.
    #[serde(default)]
    pub archive_at_ms: Option<i64>,
}

impl SubagentRun {
    pub fn display_label(&self) -> String {
        match self.label.as_deref().filter(|l| !l.is_empty()) {
            Some(label) => label.to_string(),
            None => crate::util::truncate_with_ellipsis(&self.task, 48),
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0)),
            _ => None,
        }
    }
}

pub struct RegisterParams {
    pub requester_session_key: String,
    pub requester_channel: String,
    pub task: String,
    pub label: Option<String>,
    pub cleanup: CleanupMode,
}

type CompletionCallback = Box<dyn FnOnce(&SubagentRun) + Send>;

/// Persisted run registry. All operations serialise on one lock, which also
/// gives the required per-run ordering between the runner, tools, and the
/// sweeper.
pub struct SubagentRegistry {
    path: PathBuf,
    runs: Mutex<HashMap<String, SubagentRun>>,
    callbacks: Mutex<HashMap<String, Vec<CompletionCallback>>>,
    archive_after_minutes: i64,
    interrupted: Mutex<Vec<SubagentRun>>,
}

impl SubagentRegistry {
    /// Load the registry from disk. Runs that never ended before the last
    /// shutdown are marked `interrupted`; `take_interrupted` hands them to
    /// the gateway for a one-time announce.
    pub fn open(path: &Path, archive_after_minutes: i64) -> Result<Self> {
        let mut runs: HashMap<String, SubagentRun> = HashMap::new();
        if path.exists() {
            let raw =
                fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let list: Vec<SubagentRun> =
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
            for run in list {
                runs.insert(run.run_id.clone(), run);
            }
        }

        let mut interrupted = Vec::new();
        let now = Utc::now();
        for run in runs.values_mut() {
            if run.ended_at.is_none() {
                run.ended_at = Some(now);
                run.outcome = Some(SubagentOutcome::Interrupted);
                interrupted.push(run.clone());
            }
        }

        let registry = Self {
            path: path.to_path_buf(),
            runs: Mutex::new(runs),
            callbacks: Mutex::new(HashMap::new()),
            archive_after_minutes,
            interrupted: Mutex::new(interrupted),
        };
        if !registry.lock_interrupted().is_empty() {
            registry.persist()?;
        }
        Ok(registry)
    }

    /// Runs found in flight at startup, handed out once.
    pub fn take_interrupted(&self) -> Vec<SubagentRun> {
        std::mem::take(&mut *self.lock_interrupted())
    }

    pub fn register(&self, params: RegisterParams) -> Result<SubagentRun> {
        let run_id = Uuid::new_v4().to_string();
        let run = SubagentRun {
            child_session_key: format!("{SUBAGENT_KEY_PREFIX}{run_id}"),
            run_id,
            requester_session_key: params.requester_session_key,
            requester_channel: params.requester_channel,
            task: params.task,
            label: params.label,
            cleanup: params.cleanup,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            outcome: None,
            archive_at_ms: None,
        };
        self.lock_runs().insert(run.run_id.clone(), run.clone());
        self.persist()?;
        Ok(run)
    }

    pub fn mark_started(&self, run_id: &str) -> Result<()> {
        self.update(run_id, |run| run.started_at = Some(Utc::now()))?;
        Ok(())
    }

    /// Record the terminal outcome and fire any completion callbacks.
    pub fn mark_completed(&self, run_id: &str, outcome: SubagentOutcome) -> Result<SubagentRun> {
        let run = self.update(run_id, |run| {
            run.ended_at = Some(Utc::now());
            run.outcome = Some(outcome);
        })?;

        let callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(run_id)
            .unwrap_or_default();
        for cb in callbacks {
            cb(&run);
        }
        Ok(run)
    }

    /// Run `cb` when the run completes; immediately if it already has.
    pub fn on_completion(&self, run_id: &str, cb: CompletionCallback) {
        let completed = self
            .lock_runs()
            .get(run_id)
            .filter(|r| r.ended_at.is_some())
            .cloned();
        match completed {
            Some(run) => cb(&run),
            None => self
                .callbacks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .entry(run_id.to_string())
                .or_default()
                .push(cb),
        }
    }

    /// Apply the cleanup policy after the announce. Returns the child
    /// session key the caller must delete, if any.
    pub fn finalize_cleanup(&self, run_id: &str, did_announce: bool) -> Result<Option<String>> {
        let archive_at = crate::util::now_ms() + self.archive_after_minutes * 60_000;
        let run = self.update(run_id, |run| run.archive_at_ms = Some(archive_at))?;

        match run.cleanup {
            CleanupMode::Delete if did_announce => Ok(Some(run.child_session_key)),
            _ => Ok(None),
        }
    }

    pub fn get(&self, run_id: &str) -> Option<SubagentRun> {
        self.lock_runs().get(run_id).cloned()
    }

    pub fn list_by_requester(&self, requester_session_key: &str) -> Vec<SubagentRun> {
        let mut list: Vec<SubagentRun> = self
            .lock_runs()
            .values()
            .filter(|r| r.requester_session_key == requester_session_key)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub fn list_active(&self) -> Vec<SubagentRun> {
        self.lock_runs()
            .values()
            .filter(|r| r.ended_at.is_none())
            .cloned()
            .collect()
    }

    pub fn delete(&self, run_id: &str) -> Result<bool> {
        let existed = self.lock_runs().remove(run_id).is_some();
        if existed {
            self.persist()?;
        }
        Ok(existed)
    }

    /// Drop every record whose archive deadline has passed. Returns how many
    /// went.
    pub fn sweep_once(&self, now_ms: i64) -> Result<usize> {
        let removed = {
            let mut runs = self.lock_runs();
            let before = runs.len();
            runs.retain(|_, run| !run.archive_at_ms.is_some_and(|at| at <= now_ms));
            before - runs.len()
        };
        if removed > 0 {
            tracing::debug!(removed, "swept archived background runs");
            self.persist()?;
        }
        Ok(removed)
    }

    /// Background sweeper, one pass per minute.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = registry.sweep_once(crate::util::now_ms()) {
                    tracing::warn!(error = %e, "subagent sweep failed");
                }
            }
        })
    }

    // ── Internal helpers ─────────────────────────────────────────

    fn update<F>(&self, run_id: &str, update: F) -> Result<SubagentRun>
    where
        F: FnOnce(&mut SubagentRun),
    {
        let run = {
            let mut runs = self.lock_runs();
            let run = runs
                .get_mut(run_id)
                .ok_or_else(|| anyhow::anyhow!("subagent run not found: {run_id}"))?;
            update(run);
            run.clone()
        };
        self.persist()?;
        Ok(run)
    }

    fn lock_runs(&self) -> std::sync::MutexGuard<'_, HashMap<String, SubagentRun>> {
        self.runs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_interrupted(&self) -> std::sync::MutexGuard<'_, Vec<SubagentRun>> {
        self.interrupted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let data = {
            let mut list: Vec<SubagentRun> = self.lock_runs().values().cloned().collect();
            list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            serde_json::to_string_pretty(&list).context("serializing subagent runs")?
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &data).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming {} into place", tmp.display()))?;
        Ok(())
    }
}
