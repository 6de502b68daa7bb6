//! The model-client contract — one streamed chat turn, dialect-agnostic.

use crate::session::{ToolCall, TranscriptEntry};
use crate::tools::ToolSpec;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Why the model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolUse,
    Length,
    Other,
}

/// Aggregated result of one chat turn.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
}

impl ChatOutcome {
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.tool_calls.is_empty()
    }
}

/// Streaming callback surface. Dialect quirks and delta fragmentation are
/// resolved before these fire: `on_chunk` sees every appended text fragment,
/// `on_tool_call` fires once per call with fully assembled arguments.
pub trait ChatObserver: Send + Sync {
    fn on_chunk(&self, _text: &str) {}
    fn on_tool_call(&self, _name: &str, _input: &serde_json::Value) {}
}

/// Observer that ignores everything.
pub struct NullObserver;

impl ChatObserver for NullObserver {}

/// Marker error for an aborted stream, so callers can tell cancellation from
/// transport failure with `err.is::<Cancelled>()`.
#[derive(Debug)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "model stream cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// One streamed chat turn against a model endpoint.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn chat(
        &self,
        messages: &[TranscriptEntry],
        tools: &[ToolSpec],
        observer: &dyn ChatObserver,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ChatOutcome>;
}

/// Build an error from a non-success API response, preserving status and body.
pub async fn api_error(provider: &str, response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    anyhow::anyhow!("{provider} API error {status}: {body}")
}
