//! Background-task tool — fan a scoped task out to an independent runner.
//! Its completion is announced back into the requesting conversation.

use super::traits::{Tool, ToolContext};
use crate::gateway::{SpawnRequest, SubagentSpawner};

use async_trait::async_trait;
use std::sync::Arc;

pub const SPAWN_TOOL_NAME: &str = "spawn_subagent";

pub struct SpawnSubagentTool {
    spawner: Arc<dyn SubagentSpawner>,
}

impl SpawnSubagentTool {
    pub fn new(spawner: Arc<dyn SubagentSpawner>) -> Self {
        Self { spawner }
    }
}

#[async_trait]
impl Tool for SpawnSubagentTool {
    fn name(&self) -> &str {
        SPAWN_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Run a task in the background with a separate agent instance. Returns \
         immediately with a run id; the result is announced back into this \
         conversation when the task finishes. Good for long or parallelisable \
         work."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Full task description for the background agent"
                },
                "label": {
                    "type": "string",
                    "description": "Short human-readable label for progress reporting"
                },
                "keep_transcript": {
                    "type": "boolean",
                    "description": "Keep the background conversation for inspection instead of deleting it (default false)"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let task = args
            .get("task")
            .and_then(serde_json::Value::as_str)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("spawn_subagent requires non-empty 'task'"))?;

        let label = args
            .get("label")
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string);
        let keep_transcript = args
            .get("keep_transcript")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        let run_id = self
            .spawner
            .spawn(SpawnRequest {
                requester_session_key: ctx.session_key.clone(),
                requester_channel: ctx.channel.clone(),
                agent_id: ctx.agent_id.clone(),
                task: task.to_string(),
                label: label.clone(),
                keep_transcript,
            })
            .await?;

        let shown = label.unwrap_or_else(|| crate::util::truncate_with_ellipsis(task, 40));
        Ok(format!(
            "Started background task \"{shown}\" (run {run_id}). Its result will \
             be announced here when it completes."
        ))
    }
}
