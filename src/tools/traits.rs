//! The tool contract — named callables with a declared JSON schema, executed
//! with an explicit per-call context.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a tool invocation knows about its caller. Passed on every call
/// instead of reading ambient state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolContext {
    pub session_key: String,
    pub channel: String,
    /// Reply address on the originating channel.
    pub to: String,
    pub agent_id: String,
}

/// Description of a tool as offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A named callable the agent may invoke.
///
/// `execute` returns the string handed back to the model. Failures should be
/// returned as `Err`; the runner folds them into an `Error: …` tool result so
/// the loop continues and the model can react.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON-schema-shaped input description: properties plus required fields.
    fn input_schema(&self) -> serde_json::Value;

    async fn execute(&self, args: serde_json::Value, ctx: &ToolContext) -> anyhow::Result<String>;

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the input back"
        }

        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" }
                },
                "required": ["text"]
            })
        }

        async fn execute(
            &self,
            args: serde_json::Value,
            ctx: &ToolContext,
        ) -> anyhow::Result<String> {
            let text = args
                .get("text")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            Ok(format!("{} (from {})", text, ctx.session_key))
        }
    }

    #[test]
    fn spec_mirrors_tool_metadata() {
        let spec = EchoTool.spec();
        assert_eq!(spec.name, "echo");
        assert_eq!(spec.input_schema["required"][0], "text");
    }

    #[tokio::test]
    async fn execute_receives_context() {
        let ctx = ToolContext {
            session_key: "terminal:alice".into(),
            channel: "terminal".into(),
            to: "alice".into(),
            agent_id: "default".into(),
        };
        let out = EchoTool
            .execute(serde_json::json!({"text": "hi"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out, "hi (from terminal:alice)");
    }
}
