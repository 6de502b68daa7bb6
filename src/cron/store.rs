//! Persisted cron jobs — one keyed mapping, written atomically.

use super::types::CronJob;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct CronStore {
    path: PathBuf,
    jobs: Mutex<HashMap<String, CronJob>>,
}

impl CronStore {
    pub fn open(path: &Path) -> Result<Self> {
        let mut jobs = HashMap::new();
        if path.exists() {
            let raw =
                fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let list: Vec<CronJob> =
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
            for job in list {
                jobs.insert(job.job_id.clone(), job);
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            jobs: Mutex::new(jobs),
        })
    }

    pub fn get(&self, job_id: &str) -> Option<CronJob> {
        self.lock().get(job_id).cloned()
    }

    pub fn list(&self) -> Vec<CronJob> {
        let mut list: Vec<CronJob> = self.lock().values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub fn insert(&self, job: CronJob) -> Result<()> {
        self.lock().insert(job.job_id.clone(), job);
        self.persist()
    }

    pub fn remove(&self, job_id: &str) -> Result<bool> {
        let existed = self.lock().remove(job_id).is_some();
        if existed {
            self.persist()?;
        }
        Ok(existed)
    }

    /// Apply `update` to a job and persist. Returns the updated record.
    pub fn update<F>(&self, job_id: &str, update: F) -> Result<CronJob>
    where
        F: FnOnce(&mut CronJob),
    {
        let updated = {
            let mut guard = self.lock();
            let job = guard
                .get_mut(job_id)
                .ok_or_else(|| anyhow::anyhow!("cron job not found: {job_id}"))?;
            update(job);
            job.clone()
        };
        self.persist()?;
        Ok(updated)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CronJob>> {
        self.jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let data = {
            let mut list: Vec<CronJob> = self.lock().values().cloned().collect();
            list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            serde_json::to_string_pretty(&list).context("serializing cron jobs")?
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &data).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming {} into place", tmp.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::types::{DeliveryConfig, Schedule};
    use chrono::Utc;
    use tempfile::TempDir;

    fn job(id: &str) -> CronJob {
        CronJob {
            job_id: id.into(),
            name: None,
            schedule: Schedule::Every { every_ms: 60_000 },
            message: "check the mailbox".into(),
            enabled: true,
            agent_id: None,
            delivery: DeliveryConfig::default(),
            delete_after_run: false,
            created_at: Utc::now(),
            last_run_at: None,
            last_status: None,
            last_output: None,
        }
    }

    #[test]
    fn insert_get_remove() {
        let tmp = TempDir::new().unwrap();
        let store = CronStore::open(&tmp.path().join("jobs.json")).unwrap();

        store.insert(job("j1")).unwrap();
        assert!(store.get("j1").is_some());
        assert!(store.remove("j1").unwrap());
        assert!(!store.remove("j1").unwrap());
    }

    #[test]
    fn update_mutates_and_persists() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("jobs.json");
        {
            let store = CronStore::open(&path).unwrap();
            store.insert(job("j1")).unwrap();
            let updated = store
                .update("j1", |j| {
                    j.enabled = false;
                    j.last_status = Some("ok".into());
                })
                .unwrap();
            assert!(!updated.enabled);
        }
        let store = CronStore::open(&path).unwrap();
        let loaded = store.get("j1").unwrap();
        assert!(!loaded.enabled);
        assert_eq!(loaded.last_status.as_deref(), Some("ok"));
    }

    #[test]
    fn update_missing_job_errors() {
        let tmp = TempDir::new().unwrap();
        let store = CronStore::open(&tmp.path().join("jobs.json")).unwrap();
        assert!(store.update("ghost", |_| {}).is_err());
    }
}
