//! Server-sent-event framing and tool-call delta reassembly, shared by both
//! wire dialects.

use crate::session::ToolCall;

use std::collections::BTreeMap;
use uuid::Uuid;

/// Incremental SSE decoder: feed raw body bytes, get back the payload of
/// each complete `data:` line.
///
/// Event-name lines are ignored; the payloads themselves carry a type field
/// in both dialects.
pub struct SseLineBuffer {
    buf: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self { buf: String::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));

        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
        payloads
    }
}

struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Joins indexed tool-call partials into complete calls.
///
/// The name is set once per index; argument fragments are concatenated as
/// raw JSON text and validated only when the stream finishes. A call whose
/// assembled arguments fail to parse is dropped with a logged error.
pub struct ToolCallAssembler {
    calls: BTreeMap<usize, PartialCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self {
            calls: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Begin a call at `index`. Missing ids get a generated one.
    pub fn start(&mut self, index: usize, id: Option<&str>, name: &str) {
        let id = match id.filter(|i| !i.is_empty()) {
            Some(id) => id.to_string(),
            None => format!("call_{}", Uuid::new_v4()),
        };
        self.calls.entry(index).or_insert(PartialCall {
            id,
            name: name.to_string(),
            arguments: String::new(),
        });
    }

    /// Append an argument fragment to the call at `index`. Fragments for an
    /// index that never started are dropped.
    pub fn append_arguments(&mut self, index: usize, fragment: &str) {
        if let Some(call) = self.calls.get_mut(&index) {
            call.arguments.push_str(fragment);
        } else {
            tracing::warn!(index, "argument fragment for unknown tool call index");
        }
    }

    /// Validate and emit the assembled calls in index order.
    pub fn finish(self) -> Vec<ToolCall> {
        let mut out = Vec::new();
        for (index, call) in self.calls {
            let arguments = if call.arguments.trim().is_empty() {
                "{}".to_string()
            } else {
                call.arguments
            };
            match serde_json::from_str::<serde_json::Value>(&arguments) {
                Ok(_) => out.push(ToolCall {
                    id: call.id,
                    name: call.name,
                    arguments,
                }),
                Err(e) => {
                    tracing::error!(
                        index,
                        name = %call.name,
                        error = %e,
                        "dropping tool call with malformed arguments"
                    );
                }
            }
        }
        out
    }
}
