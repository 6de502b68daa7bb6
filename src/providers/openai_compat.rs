//! OpenAI-compatible chat/completions client.
//!
//! The system prompt travels as the first message, tool schemas nest under
//! `{"type":"function","function":{…}}`, tool results are `role:"tool"`
//! messages, and streaming deltas arrive as `choices[].delta` frames with
//! indexed tool-call partials.

use super::sse::{SseLineBuffer, ToolCallAssembler};
use super::traits::{api_error, Cancelled, ChatObserver, ChatOutcome, FinishReason, ModelClient};
use crate::session::{Role, ToolCall, TranscriptEntry};
use crate::tools::ToolSpec;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub struct OpenAiCompatClient {
    provider_name: String,
    base_url: String,
    credential: Option<String>,
    model: String,
    http: Client,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireToolSpec<'a>>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireToolSpec<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionSpec<'a>,
}

#[derive(Debug, Serialize)]
struct WireFunctionSpec<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

impl OpenAiCompatClient {
    pub fn new(
        provider_name: &str,
        base_url: &str,
        credential: Option<&str>,
        model: &str,
    ) -> Self {
        Self {
            provider_name: provider_name.to_string(),
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

    fn convert_messages(messages: &[TranscriptEntry]) -> Vec<WireMessage> {
        messages
            .iter()
            .map(|entry| match entry.role {
                Role::System => WireMessage {
                    role: "system",
                    content: Some(entry.content.clone()),
                    tool_call_id: None,
                    tool_calls: None,
                },
                Role::User => WireMessage {
                    role: "user",
                    content: Some(entry.content.clone()),
                    tool_call_id: None,
                    tool_calls: None,
                },
                Role::Assistant => {
                    let tool_calls = entry.tool_calls.as_ref().map(|calls| {
                        calls
                            .iter()
                            .map(|c| WireToolCall {
                                id: c.id.clone(),
                                kind: "function",
                                function: WireFunctionCall {
                                    name: c.name.clone(),
                                    arguments: c.arguments.clone(),
                                },
                            })
                            .collect()
                    });
                    WireMessage {
                        role: "assistant",
                        content: (!entry.content.is_empty()).then(|| entry.content.clone()),
                        tool_call_id: None,
                        tool_calls,
                    }
                }
                Role::Tool => WireMessage {
                    role: "tool",
                    content: Some(entry.content.clone()),
                    tool_call_id: entry.tool_call_id.clone(),
                    tool_calls: None,
                },
            })
            .collect()
    }

    fn convert_tools<'a>(tools: &'a [ToolSpec]) -> Option<Vec<WireToolSpec<'a>>> {
        if tools.is_empty() {
            return None;
        }
        Some(
            tools
                .iter()
                .map(|t| WireToolSpec {
                    kind: "function",
                    function: WireFunctionSpec {
                        name: &t.name,
                        description: &t.description,
                        parameters: &t.input_schema,
                    },
                })
                .collect(),
        )
    }

    /// Fold one `choices[].delta` frame into the accumulating state.
    fn apply_delta(
        frame: &Value,
        content: &mut String,
        assembler: &mut ToolCallAssembler,
        finish: &mut FinishReason,
        observer: &dyn ChatObserver,
    ) {
        let Some(choice) = frame.get("choices").and_then(Value::as_array).and_then(|c| c.first())
        else {
            return;
        };

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            *finish = match reason {
                "stop" => FinishReason::Stop,
                "tool_calls" => FinishReason::ToolUse,
                "length" => FinishReason::Length,
                _ => FinishReason::Other,
            };
        }

        let Some(delta) = choice.get("delta") else {
            return;
        };

        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                observer.on_chunk(text);
                content.push_str(text);
            }
        }

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                if let Some(function) = call.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        let id = call.get("id").and_then(Value::as_str);
                        assembler.start(index, id, name);
                    }
                    if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                        assembler.append_arguments(index, args);
                    }
                }
            }
        }
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
impl ModelClient for OpenAiCompatClient {
    async fn chat(
        &self,
        messages: &[TranscriptEntry],
        tools: &[ToolSpec],
        observer: &dyn ChatObserver,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ChatOutcome> {
        let credential = self.credential.as_ref().ok_or_else(|| {
            anyhow::anyhow!("{} credential not set", self.provider_name)
        })?;

        let request = WireRequest {
            model: &self.model,
            messages: Self::convert_messages(messages),
            tools: Self::convert_tools(tools),
            stream: true,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {credential}"))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(&self.provider_name, response).await);
        }

        let stream = response.bytes_stream();
        tokio::pin!(stream);
        let mut lines = SseLineBuffer::new();
        let mut assembler = ToolCallAssembler::new();
        let mut content = String::new();
        let mut finish = FinishReason::Other;

        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => return Err(anyhow::Error::new(Cancelled)),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let bytes = chunk?;

            for payload in lines.push(&bytes) {
                if payload == "[DONE]" {
                    continue;
                }
                match serde_json::from_str::<Value>(&payload) {
                    Ok(frame) => {
                        if let Some(error) = frame.get("error") {
                            anyhow::bail!(
                                "{} stream error: {}",
                                self.provider_name,
                                error
                            );
                        }
                        Self::apply_delta(
                            &frame,
                            &mut content,
                            &mut assembler,
                            &mut finish,
                            observer,
                        );
                    }
                    Err(e) => {
                        tracing::warn!(provider = %self.provider_name, error = %e, "unparseable stream frame");
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
