//! Tool registry — named callables with declared schemas, filterable by
//! caller role.

pub mod schedule;
pub mod send_message;
pub mod spawn_subagent;
pub mod traits;

pub use schedule::ScheduleTool;
pub use send_message::SendMessageTool;
pub use spawn_subagent::{SpawnSubagentTool, SPAWN_TOOL_NAME};
pub use traits::{Tool, ToolContext, ToolSpec};

use crate::cron::CronService;
use crate::gateway::{GatewayRef, SubagentSpawner};

use std::sync::Arc;

/// The tools one runner can call.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    /// The registry a subagent runner sees: everything except the spawn
    /// tool, so background runs cannot fan out further.
    pub fn without_spawn(&self) -> Self {
        Self {
            tools: self
                .tools
                .iter()
                .filter(|t| t.name() != SPAWN_TOOL_NAME)
                .cloned()
                .collect(),
        }
    }

    /// Schemas offered to the model, filtered by caller role.
    pub fn specs_for(&self, is_subagent: bool) -> Vec<ToolSpec> {
        if is_subagent {
            self.without_spawn().specs()
        } else {
            self.specs()
        }
    }
}

/// The control-plane tool set every agent gets.
pub fn control_plane_tools(
    gateway: Arc<dyn GatewayRef>,
    spawner: Arc<dyn SubagentSpawner>,
    cron: Arc<CronService>,
) -> ToolRegistry {
    ToolRegistry::new(vec![
        Arc::new(SendMessageTool::new(gateway)),
        Arc::new(SpawnSubagentTool::new(spawner)),
        Arc::new(ScheduleTool::new(cron)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NamedTool(&'static str);

    #[async_trait]
    impl Tool for NamedTool {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "test tool"
        }

        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }

        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> anyhow::Result<String> {
            Ok("ok".into())
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new(vec![
            Arc::new(NamedTool("echo")),
            Arc::new(NamedTool(SPAWN_TOOL_NAME)),
        ])
    }

    #[test]
    fn lookup_by_name() {
        let reg = registry();
        assert!(reg.get("echo").is_some());
        assert!(reg.get("missing").is_none());
    }

    #[test]
    fn subagent_filter_removes_the_spawn_tool() {
        let reg = registry();
        assert_eq!(reg.specs_for(false).len(), 2);

        let filtered = reg.specs_for(true);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.iter().all(|s| s.name != SPAWN_TOOL_NAME));

        assert!(reg.without_spawn().get(SPAWN_TOOL_NAME).is_none());
        assert!(reg.without_spawn().get("echo").is_some());
    }
}
