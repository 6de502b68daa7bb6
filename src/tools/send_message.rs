//! Delivery tool — push a message to a session/channel directly, bypassing
//! the final-reply path. The agent answers `NO_REPLY` afterwards when the
//! send already said everything.

use super::traits::{Tool, ToolContext};
use crate::gateway::GatewayRef;

use async_trait::async_trait;
use std::sync::Arc;

pub struct SendMessageTool {
    gateway: Arc<dyn GatewayRef>,
}

impl SendMessageTool {
    pub fn new(gateway: Arc<dyn GatewayRef>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }

    fn description(&self) -> &str {
        "Send a message to a conversation immediately. Defaults to the current \
         conversation; pass channel and to for a different destination. Use this \
         for scheduled-task results and mid-task progress updates, then reply \
         NO_REPLY if nothing else needs saying."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "Message text to deliver"
                },
                "channel": {
                    "type": "string",
                    "description": "Target channel name (defaults to the current channel)"
                },
                "to": {
                    "type": "string",
                    "description": "Recipient address on the target channel (defaults to the current peer)"
                }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let text = args
            .get("text")
            .and_then(serde_json::Value::as_str)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("send_message requires non-empty 'text'"))?;

        let channel = args
            .get("channel")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(&ctx.channel);
        let to = args
            .get("to")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(&ctx.to);
        if channel.is_empty() || to.is_empty() {
            anyhow::bail!("no delivery destination: channel and to are required");
        }

        // The target conversation is the channel address, which for cron and
        // background contexts differs from the calling session.
        let session_key = format!("{channel}:{to}");

        self.gateway
            .send_to_session(&session_key, channel, text)
            .await?;

        Ok(format!("Message sent to {session_key}"))
    }
}
