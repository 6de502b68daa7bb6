//! Agent execution — the bounded tool-calling loop, prompt composition, and
//! the followup inbox.

pub mod followup;
pub mod prompt;
pub mod runner;

pub use followup::{FollowupMode, FollowupQueue, FollowupSink};
pub use prompt::{compose_system_prompt, PromptParams};
pub use runner::{
    frame_input, suppresses_delivery, AgentRunner, RunSource, ABORTED_SENTINEL, DONE_SENTINEL,
    NO_REPLY,
};

/// Streaming surface for one turn: text chunks, tool invocations, and tool
/// results, in the order the runner emits them.
pub trait TurnObserver: Send + Sync {
    fn on_chunk(&self, _text: &str) {}
    fn on_tool_call(&self, _name: &str, _input: &serde_json::Value) {}
    fn on_tool_result(&self, _name: &str, _result: &str) {}
}

/// Observer that ignores everything.
pub struct NullTurnObserver;

impl TurnObserver for NullTurnObserver {}
