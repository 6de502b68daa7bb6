//! Agent-facing schedule management: create, list, and remove recurring or
//! one-shot jobs.

use super::traits::{Tool, ToolContext};
use crate::cron::{CronJobOptions, CronService, DeliveryConfig, Schedule};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Write;
use std::sync::Arc;

pub struct ScheduleTool {
    cron: Arc<CronService>,
}

impl ScheduleTool {
    pub fn new(cron: Arc<CronService>) -> Self {
        Self { cron }
    }

    fn parse_schedule(args: &serde_json::Value) -> anyhow::Result<Schedule> {
        if let Some(expr) = args.get("cron").and_then(serde_json::Value::as_str) {
            return Ok(Schedule::Cron {
                expr: expr.to_string(),
            });
        }
        if let Some(every_ms) = args.get("every_ms").and_then(serde_json::Value::as_u64) {
            return Ok(Schedule::Every { every_ms });
        }
        if let Some(at) = args.get("at").and_then(serde_json::Value::as_str) {
            let at = DateTime::parse_from_rfc3339(at)
                .map_err(|e| anyhow::anyhow!("invalid 'at' timestamp: {e}"))?
                .with_timezone(&Utc);
            return Ok(Schedule::At { at });
        }
        anyhow::bail!("provide one of 'cron', 'every_ms', or 'at'")
    }
}

#[async_trait]
impl Tool for ScheduleTool {
    fn name(&self) -> &str {
        "schedule"
    }

    fn description(&self) -> &str {
        "Manage scheduled tasks. action=add creates a job from a cron \
         expression, an interval, or a one-shot timestamp; action=list shows \
         existing jobs; action=remove deletes one by id. Each fire runs the \
         task text in a fresh conversation and delivers the result back here."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["add", "list", "remove"]
                },
                "message": {
                    "type": "string",
                    "description": "Task text executed on each fire (add)"
                },
                "name": {
                    "type": "string",
                    "description": "Optional job name (add)"
                },
                "cron": {
                    "type": "string",
                    "description": "Cron expression, e.g. \"0 9 * * *\" (add)"
                },
                "every_ms": {
                    "type": "integer",
                    "description": "Interval in milliseconds (add)"
                },
                "at": {
                    "type": "string",
                    "description": "One-shot RFC3339 timestamp (add)"
                },
                "job_id": {
                    "type": "string",
                    "description": "Job to remove (remove)"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let action = args
            .get("action")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("list");

        match action {
            "add" => {
                let message = args
                    .get("message")
                    .and_then(serde_json::Value::as_str)
                    .filter(|m| !m.trim().is_empty())
                    .ok_or_else(|| anyhow::anyhow!("schedule add requires 'message'"))?;
                let schedule = Self::parse_schedule(&args)?;

                // Results flow back to the conversation that created the job.
                let delivery = DeliveryConfig {
                    channel: Some(ctx.channel.clone()),
                    to: Some(ctx.to.clone()),
                };
                let job = self.cron.add(
                    schedule,
                    message,
                    CronJobOptions {
                        name: args
                            .get("name")
                            .and_then(serde_json::Value::as_str)
                            .map(ToString::to_string),
                        agent_id: Some(ctx.agent_id.clone()),
                        delivery,
                        delete_after_run: false,
                    },
                )?;
                Ok(format!(
                    "Scheduled job {} ({})",
                    job.job_id,
                    job.session_title()
                ))
            }
            "list" => {
                let jobs = self.cron.list();
                if jobs.is_empty() {
                    return Ok("No scheduled jobs.".into());
                }
                let mut out = String::new();
                for job in jobs {
                    let state = if job.enabled { "enabled" } else { "disabled" };
                    let _ = writeln!(
                        out,
                        "{} [{}] {} — {:?}",
                        job.job_id,
                        state,
                        job.session_title(),
                        job.schedule
                    );
                }
                Ok(out)
            }
            "remove" => {
                let job_id = args
                    .get("job_id")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("schedule remove requires 'job_id'"))?;
                if self.cron.remove(job_id)? {
                    Ok(format!("Removed job {job_id}"))
                } else {
                    Ok(format!("No such job: {job_id}"))
                }
            }
            other => anyhow::bail!("unknown schedule action: {other}"),
        }
    }
}
