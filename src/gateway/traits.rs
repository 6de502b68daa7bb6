//! Capability traits handed to tools at construction, so tools can re-enter
//! the gateway without a mutual import.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// How a `trigger_agent` call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerOutcome {
    /// Injected into a live runner mid-loop.
    Steered,
    /// A fresh run was kicked off.
    Invoked,
    Failed,
}

/// Re-entry surface the gateway exposes to tools.
#[async_trait]
pub trait GatewayRef: Send + Sync {
    /// Append an assistant entry to the session transcript and push it out
    /// on the channel, without re-triggering the agent.
    async fn send_to_session(
        &self,
        session_key: &str,
        channel: &str,
        text: &str,
    ) -> anyhow::Result<()>;

    /// Wake the agent bound to `session_key` with `message`: inject when a
    /// runner is live, otherwise process as a fresh inbound message.
    async fn trigger_agent(
        &self,
        session_key: &str,
        channel: &str,
        message: &str,
    ) -> anyhow::Result<TriggerOutcome>;
}

/// Parameters for launching a background run.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub requester_session_key: String,
    pub requester_channel: String,
    pub agent_id: String,
    pub task: String,
    pub label: Option<String>,
    /// Delete the child session after the announce, or keep it around for
    /// inspection until archival.
    pub keep_transcript: bool,
}

/// Launches background runs. Withheld from subagent tool sets, which is what
/// makes the no-nesting rule hold.
#[async_trait]
pub trait SubagentSpawner: Send + Sync {
    /// Start a background run and return its run id immediately.
    async fn spawn(&self, request: SpawnRequest) -> anyhow::Result<String>;
}
