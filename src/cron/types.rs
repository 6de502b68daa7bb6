//! Scheduled-job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Schedule {
    /// Cron expression; 5-field crontab syntax or 6/7-field with seconds.
    Cron { expr: String },
    /// Fixed interval.
    Every { every_ms: u64 },
    /// One-shot at an absolute time.
    At { at: DateTime<Utc> },
}

/// Where a fire's result must be delivered.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

impl DeliveryConfig {
    pub fn is_configured(&self) -> bool {
        self.channel.is_some() && self.to.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CronJob {
    pub job_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub schedule: Schedule,
    /// The task text handed to the agent on each fire.
    pub message: String,
    pub enabled: bool,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// One-shot jobs remove themselves after firing.
    #[serde(default)]
    pub delete_after_run: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status: Option<String>,
    #[serde(default)]
    pub last_output: Option<String>,
}

impl CronJob {
    /// Session title for a fire: the job name, or the head of the task text.
    pub fn session_title(&self) -> String {
        match self.name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => crate::util::truncate_with_ellipsis(&self.message, 40),
        }
    }
}

/// Optional settings for a new job.
#[derive(Debug, Clone, Default)]
pub struct CronJobOptions {
    pub name: Option<String>,
    pub agent_id: Option<String>,
    pub delivery: DeliveryConfig,
    pub delete_after_run: bool,
}
