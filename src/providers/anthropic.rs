//! Anthropic messages client.
//!
//! The system prompt is a separate request field, tool schemas are flat
//! `{name, description, input_schema}` objects, tool use and results travel
//! as typed content blocks, and streaming deltas arrive as
//! `content_block_start` / `content_block_delta` events with
//! `input_json_delta` argument fragments.

use super::sse::{SseLineBuffer, ToolCallAssembler};
use super::traits::{api_error, Cancelled, ChatObserver, ChatOutcome, FinishReason, ModelClient};
use crate::session::{Role, ToolCall, TranscriptEntry};
use crate::tools::ToolSpec;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

pub struct AnthropicClient {
    base_url: String,
    credential: Option<String>,
    model: String,
    http: Client,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    stream: bool,
}

impl AnthropicClient {
    pub fn new(base_url: &str, credential: Option<&str>, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            credential: credential
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(ToString::to_string),
            model: model.to_string(),
            http: Client::builder()
                .timeout(std::time::Duration::from_secs(300))
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Split the transcript into the `system` field and the message array.
    ///
    /// Tool results become `tool_result` blocks inside user messages;
    /// consecutive results merge into one user turn so the alternation
    /// constraint holds.
    fn convert_messages(messages: &[TranscriptEntry]) -> (Option<String>, Vec<Value>) {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut wire: Vec<Value> = Vec::new();

        for entry in messages {
            match entry.role {
                Role::System => system_parts.push(&entry.content),
                Role::User => wire.push(json!({
                    "role": "user",
                    "content": [{"type": "text", "text": entry.content}],
                })),
                Role::Assistant => {
                    let mut blocks: Vec<Value> = Vec::new();
                    if !entry.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": entry.content}));
                    }
                    for call in entry.tool_calls.iter().flatten() {
                        let input: Value = serde_json::from_str(&call.arguments)
                            .unwrap_or(Value::Object(Default::default()));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": input,
                        }));
                    }
                    if blocks.is_empty() {
                        blocks.push(json!({"type": "text", "text": ""}));
                    }
                    wire.push(json!({"role": "assistant", "content": blocks}));
                }
                Role::Tool => {
                    let block = json!({
                        "type": "tool_result",
                        "tool_use_id": entry.tool_call_id.clone().unwrap_or_default(),
                        "content": entry.content,
                    });
                    // Merge with a preceding tool-result turn if present.
                    let merged = wire.last_mut().is_some_and(|last| {
                        last["role"] == "user"
                            && last["content"]
                                .as_array()
                                .and_then(|blocks| blocks.first())
                                .and_then(|b| b.get("type"))
                                .and_then(Value::as_str)
                                == Some("tool_result")
                    });
                    if merged {
                        if let Some(blocks) =
                            wire.last_mut().and_then(|l| l["content"].as_array_mut())
                        {
                            blocks.push(block);
                        }
                    } else {
                        wire.push(json!({"role": "user", "content": [block]}));
                    }
                }
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, wire)
    }

    fn convert_tools(tools: &[ToolSpec]) -> Option<Vec<Value>> {
        if tools.is_empty() {
            return None;
        }
        Some(
            tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect(),
        )
    }

    /// Fold one stream event into the accumulating state. Returns `true`
    /// when the message is complete.
    fn apply_event(
        event: &Value,
        content: &mut String,
        assembler: &mut ToolCallAssembler,
        finish: &mut FinishReason,
        observer: &dyn ChatObserver,
    ) -> anyhow::Result<bool> {
        match event.get("type").and_then(Value::as_str) {
            Some("content_block_start") => {
                let index = event.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                if let Some(block) = event.get("content_block") {
                    if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                        let id = block.get("id").and_then(Value::as_str);
                        let name = block.get("name").and_then(Value::as_str).unwrap_or("");
                        assembler.start(index, id, name);
                    }
                }
            }
            Some("content_block_delta") => {
                let index = event.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                if let Some(delta) = event.get("delta") {
                    match delta.get("type").and_then(Value::as_str) {
                        Some("text_delta") => {
                            if let Some(text) = delta.get("text").and_then(Value::as_str) {
                                if !text.is_empty() {
                                    observer.on_chunk(text);
                                    content.push_str(text);
                                }
                            }
                        }
                        Some("input_json_delta") => {
                            if let Some(fragment) =
                                delta.get("partial_json").and_then(Value::as_str)
                            {
                                assembler.append_arguments(index, fragment);
                            }
                        }
                        _ => {}
                    }
                }
            }
            Some("message_delta") => {
                if let Some(reason) = event
                    .pointer("/delta/stop_reason")
                    .and_then(Value::as_str)
                {
                    *finish = match reason {
                        "end_turn" => FinishReason::Stop,
                        "tool_use" => FinishReason::ToolUse,
                        "max_tokens" => FinishReason::Length,
                        _ => FinishReason::Other,
                    };
                }
            }
            Some("message_stop") => return Ok(true),
            Some("error") => {
                let message = event
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown stream error");
                anyhow::bail!("Anthropic stream error: {message}");
            }
            _ => {}
        }
        Ok(false)
    }

    fn report_tool_calls(calls: &[ToolCall], observer: &dyn ChatObserver) {
        for call in calls {
            let input: Value =
                serde_json::from_str(&call.arguments).unwrap_or(Value::Object(Default::default()));
            observer.on_tool_call(&call.name, &input);
        }
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn chat(
        &self,
        messages: &[TranscriptEntry],
        tools: &[ToolSpec],
        observer: &dyn ChatObserver,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ChatOutcome> {
        let credential = self
            .credential
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Anthropic credential not set"))?;

        let (system, wire_messages) = Self::convert_messages(messages);
        let request = WireRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system,
            messages: wire_messages,
            tools: Self::convert_tools(tools),
            stream: true,
        };

        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", credential)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error("Anthropic", response).await);
        }

        let stream = response.bytes_stream();
        tokio::pin!(stream);
        let mut lines = SseLineBuffer::new();
        let mut assembler = ToolCallAssembler::new();
        let mut content = String::new();
        let mut finish = FinishReason::Other;

        'outer: loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => return Err(anyhow::Error::new(Cancelled)),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let bytes = chunk?;

            for payload in lines.push(&bytes) {
                match serde_json::from_str::<Value>(&payload) {
                    Ok(event) => {
                        if Self::apply_event(
                            &event,
                            &mut content,
                            &mut assembler,
                            &mut finish,
                            observer,
                        )? {
                            break 'outer;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "unparseable Anthropic stream frame");
                    }
                }
            }
        }

        let tool_calls = assembler.finish();
        Self::report_tool_calls(&tool_calls, observer);

        if !tool_calls.is_empty() {
            finish = FinishReason::ToolUse;
        }

        Ok(ChatOutcome {
            content,
            tool_calls,
            finish_reason: finish,
        })
    }
}
