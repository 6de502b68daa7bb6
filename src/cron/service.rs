//! The cron service — one timer task per job, isolated headless fires, and
//! the delivery contract.

use super::schedule::{next_run, validate};
use super::store::CronStore;
use super::types::{CronJob, CronJobOptions, DeliveryConfig, Schedule};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Executes one fire as a headless agent turn. Implemented by the gateway;
/// the service stays free of agent wiring.
#[async_trait]
pub trait CronExecutor: Send + Sync {
    async fn execute(&self, job: &CronJob) -> Result<String>;
}

pub struct CronService {
    store: CronStore,
    executor: OnceLock<Arc<dyn CronExecutor>>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl CronService {
    pub fn new(store: CronStore) -> Self {
        Self {
            store,
            executor: OnceLock::new(),
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Wire the executor. Must happen before `start`.
    pub fn set_executor(&self, executor: Arc<dyn CronExecutor>) {
        let _ = self.executor.set(executor);
    }

    /// Start timer tasks for every enabled job.
    pub fn start(self: &Arc<Self>) {
        for job in self.store.list() {
            if job.enabled {
                self.start_timer(&job.job_id);
            }
        }
    }

    pub fn add(
        self: &Arc<Self>,
        schedule: Schedule,
        message: &str,
        opts: CronJobOptions,
    ) -> Result<CronJob> {
        validate(&schedule, Utc::now())?;
        if message.trim().is_empty() {
            anyhow::bail!("cron job message must not be empty");
        }

        let delete_after_run = opts.delete_after_run || matches!(schedule, Schedule::At { .. });
        let job = CronJob {
            job_id: Uuid::new_v4().to_string(),
            name: opts.name,
            schedule,
            message: message.to_string(),
            enabled: true,
            agent_id: opts.agent_id,
            delivery: opts.delivery,
            delete_after_run,
            created_at: Utc::now(),
            last_run_at: None,
            last_status: None,
            last_output: None,
        };
        self.store.insert(job.clone())?;
        self.start_timer(&job.job_id);
        Ok(job)
    }

    /// Remove a job. The timer stops before the record goes.
    pub fn remove(&self, job_id: &str) -> Result<bool> {
        self.stop_timer(job_id);
        self.store.remove(job_id)
    }

    /// Enable or disable without losing the record.
    pub fn set_enabled(self: &Arc<Self>, job_id: &str, enabled: bool) -> Result<CronJob> {
        let job = self.store.update(job_id, |j| j.enabled = enabled)?;
        if enabled {
            self.start_timer(job_id);
        } else {
            self.stop_timer(job_id);
        }
        Ok(job)
    }

    pub fn get(&self, job_id: &str) -> Option<CronJob> {
        self.store.get(job_id)
    }

    pub fn list(&self) -> Vec<CronJob> {
        self.store.list()
    }

    /// Fire a job once, now. `last_run_at` advances before the handler runs,
    /// so a crash mid-run cannot double-fire on restart.
    pub async fn fire(&self, job_id: &str) -> Result<()> {
        let Some(executor) = self.executor.get().cloned() else {
            anyhow::bail!("cron executor not wired");
        };
        let job = self.store.update(job_id, |j| {
            j.last_run_at = Some(Utc::now());
        })?;

        tracing::info!(job_id, "firing scheduled job");
        match executor.execute(&job).await {
            Ok(output) => {
                self.store.update(job_id, |j| {
                    j.last_status = Some("ok".into());
                    j.last_output = Some(output.clone());
                })?;
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "scheduled job failed");
                self.store.update(job_id, |j| {
                    j.last_status = Some("error".into());
                    j.last_output = Some(e.to_string());
                })?;
            }
        }
        Ok(())
    }

    // ── Timer plumbing ───────────────────────────────────────────

    fn start_timer(self: &Arc<Self>, job_id: &str) {
        self.stop_timer(job_id);

        let service = Arc::clone(self);
        let job_id_owned = job_id.to_string();
        let handle = tokio::spawn(async move {
            service.run_timer(&job_id_owned).await;
        });

        self.timers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(job_id.to_string(), handle);
    }

    fn stop_timer(&self, job_id: &str) {
        if let Some(handle) = self
            .timers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(job_id)
        {
            handle.abort();
        }
    }

    /// One job's timer loop. Fires never overlap per job: the next sleep is
    /// computed only after the previous fire returns.
    async fn run_timer(self: &Arc<Self>, job_id: &str) {
        loop {
            let Some(job) = self.store.get(job_id) else {
                return;
            };
            if !job.enabled {
                return;
            }

            let now = Utc::now();
            let next = match next_run(&job.schedule, now) {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!(job_id, error = %e, "cannot compute next run; stopping timer");
                    return;
                }
            };

            let wait = (next - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            if let Err(e) = self.fire(job_id).await {
                tracing::warn!(job_id, error = %e, "fire failed");
            }

            if self.store.get(job_id).is_some_and(|j| j.delete_after_run) {
                if let Err(e) = self.store.remove(job_id) {
                    tracing::warn!(job_id, error = %e, "failed to remove one-shot job");
                }
                return;
            }
        }
    }
}

/// The extra system prompt enforcing the delivery contract on a cron turn.
///
/// The instruction names the configured destination so the model has no
/// routing decision to make.
pub fn delivery_instructions(delivery: &DeliveryConfig) -> String {
    let delivery_line = match (&delivery.channel, &delivery.to) {
        (Some(channel), Some(to)) => format!(
            "You MUST deliver the result by calling the send_message tool with \
             channel \"{channel}\" and to \"{to}\"."
        ),
        _ => "You MUST deliver the result by calling the send_message tool \
              (it defaults to this conversation)."
            .to_string(),
    };

    format!(
        "You are executing a scheduled task; nobody is watching this conversation.\n\
         1. Execute the task below.\n\
         2. {delivery_line}\n\
         3. Do not ask clarifying questions.\n\
         4. Do not end your turn until the result has been delivered."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingExecutor {
        fires: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CronExecutor for CountingExecutor {
        async fn execute(&self, job: &CronJob) -> Result<String> {
            self.fires.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(format!("did: {}", job.message))
        }
    }

    fn service(tmp: &TempDir) -> Arc<CronService> {
        let store = CronStore::open(&tmp.path().join("jobs.json")).unwrap();
        Arc::new(CronService::new(store))
    }

    #[tokio::test]
    async fn add_validates_schedule() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        assert!(svc
            .add(
                Schedule::Cron {
                    expr: "nope".into()
                },
                "task",
                CronJobOptions::default(),
            )
            .is_err());
        assert!(svc
            .add(Schedule::Every { every_ms: 1000 }, "  ", CronJobOptions::default())
            .is_err());
    }

    #[tokio::test]
    async fn one_shot_schedules_are_marked_delete_after_run() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let job = svc
            .add(
                Schedule::At {
                    at: Utc::now() + chrono::Duration::hours(1),
                },
                "remind me",
                CronJobOptions::default(),
            )
            .unwrap();
        assert!(job.delete_after_run);
    }

    #[tokio::test]
    async fn fire_advances_last_run_before_the_handler() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let executor = Arc::new(CountingExecutor {
            fires: AtomicUsize::new(0),
            fail: true,
        });
        svc.set_executor(executor.clone());

        let job = svc
            .add(
                Schedule::Every { every_ms: 3_600_000 },
                "task",
                CronJobOptions::default(),
            )
            .unwrap();
        svc.fire(&job.job_id).await.unwrap();

        let stored = svc.get(&job.job_id).unwrap();
        assert!(stored.last_run_at.is_some());
        assert_eq!(stored.last_status.as_deref(), Some("error"));
        assert_eq!(stored.last_output.as_deref(), Some("boom"));
        assert_eq!(executor.fires.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fire_records_success_output() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        svc.set_executor(Arc::new(CountingExecutor {
            fires: AtomicUsize::new(0),
            fail: false,
        }));

        let job = svc
            .add(
                Schedule::Every { every_ms: 3_600_000 },
                "water the plants",
                CronJobOptions::default(),
            )
            .unwrap();
        svc.fire(&job.job_id).await.unwrap();

        let stored = svc.get(&job.job_id).unwrap();
        assert_eq!(stored.last_status.as_deref(), Some("ok"));
        assert_eq!(stored.last_output.as_deref(), Some("did: water the plants"));
    }

    #[tokio::test]
    async fn disable_preserves_the_job() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let job = svc
            .add(
                Schedule::Every { every_ms: 1000 },
                "task",
                CronJobOptions::default(),
            )
            .unwrap();

        let disabled = svc.set_enabled(&job.job_id, false).unwrap();
        assert!(!disabled.enabled);
        assert!(svc.get(&job.job_id).is_some());

        let enabled = svc.set_enabled(&job.job_id, true).unwrap();
        assert!(enabled.enabled);
    }

    #[tokio::test]
    async fn remove_deletes_job_and_timer() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let job = svc
            .add(
                Schedule::Every { every_ms: 1000 },
                "task",
                CronJobOptions::default(),
            )
            .unwrap();
        assert!(svc.remove(&job.job_id).unwrap());
        assert!(svc.get(&job.job_id).is_none());
    }

    #[tokio::test]
    async fn timer_fires_and_removes_one_shots() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let executor = Arc::new(CountingExecutor {
            fires: AtomicUsize::new(0),
            fail: false,
        });
        svc.set_executor(executor.clone());

        svc.add(
            Schedule::At {
                at: Utc::now() + chrono::Duration::milliseconds(50),
            },
            "one shot",
            CronJobOptions::default(),
        )
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        assert_eq!(executor.fires.load(Ordering::SeqCst), 1);
        assert!(svc.list().is_empty());
    }

    #[test]
    fn delivery_instructions_name_the_destination() {
        let with_target = delivery_instructions(&DeliveryConfig {
            channel: Some("telegram".into()),
            to: Some("123".into()),
        });
        assert!(with_target.contains("send_message"));
        assert!(with_target.contains("\"telegram\""));
        assert!(with_target.contains("\"123\""));
        assert!(with_target.contains("Do not ask clarifying questions"));

        let without = delivery_instructions(&DeliveryConfig::default());
        assert!(without.contains("send_message"));
        assert!(without.contains("defaults to this conversation"));
    }
}
