//! Interactive terminal socket adapter.
//!
//! JSON lines over TCP, one object per line in both directions. Inbound:
//! `{"text": "..."}`. Outbound frames carry a `type` of `message`, `chunk`,
//! `tool_call`, `tool_result`, or `typing`, so an interactive client can
//! render streaming progress.

use super::traits::{Channel, IncomingMessage, OutgoingMessage};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const TERMINAL_CHANNEL: &str = "terminal";

pub struct TerminalChannel {
    bind: String,
    // peer address → write half of its connection
    clients: Mutex<HashMap<String, tokio::sync::mpsc::UnboundedSender<String>>>,
    shutdown: CancellationToken,
}

impl TerminalChannel {
    pub fn new(bind: &str) -> Self {
        Self {
            bind: bind.to_string(),
            clients: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn push_frame(&self, reply_to: &str, frame: serde_json::Value) -> anyhow::Result<()> {
        let sender = self
            .clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(reply_to)
            .cloned();
        match sender {
            Some(sender) => {
                sender
                    .send(frame.to_string())
                    .map_err(|_| anyhow::anyhow!("terminal client {reply_to} disconnected"))?;
                Ok(())
            }
            None => anyhow::bail!("no connected terminal client: {reply_to}"),
        }
    }

    async fn writer_loop(
        mut write_half: OwnedWriteHalf,
        mut outbox: tokio::sync::mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(line) = outbox.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
        }
    }
}

#[async_trait]
impl Channel for TerminalChannel {
    fn name(&self) -> &str {
        TERMINAL_CHANNEL
    }

    async fn start(&self, ingress: mpsc::Sender<IncomingMessage>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.bind).await?;
        tracing::info!(bind = %self.bind, "terminal channel listening");

        loop {
            let (socket, peer) = tokio::select! {
                () = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            let peer = peer.to_string();
            let (read_half, write_half) = socket.into_split();

            let (outbox_tx, outbox_rx) = tokio::sync::mpsc::unbounded_channel();
            self.clients
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(peer.clone(), outbox_tx);
            tokio::spawn(Self::writer_loop(write_half, outbox_rx));

            let ingress = ingress.clone();
            let peer_for_reader = peer.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    // Accept either a JSON object with "text" or a raw line.
                    let text = serde_json::from_str::<serde_json::Value>(&line)
                        .ok()
                        .and_then(|v| {
                            v.get("text")
                                .and_then(serde_json::Value::as_str)
                                .map(ToString::to_string)
                        })
                        .unwrap_or(line);

                    let message = IncomingMessage {
                        channel: TERMINAL_CHANNEL.into(),
                        from: peer_for_reader.clone(),
                        text,
                        session_key: format!("{TERMINAL_CHANNEL}:{peer_for_reader}"),
                        reply_to: peer_for_reader.clone(),
                        timestamp: Utc::now(),
                    };
                    if ingress.send(message).await.is_err() {
                        return;
                    }
                }
                tracing::debug!(peer = %peer_for_reader, "terminal client disconnected");
            });
        }
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        Ok(())
    }

    async fn send(&self, reply_to: &str, message: &OutgoingMessage) -> anyhow::Result<()> {
        let mut frame = json!({"type": "message", "text": message.text});
        if let Some(summary) = &message.tool_calls_summary {
            frame["tool_calls_summary"] = json!(summary);
        }
        self.push_frame(reply_to, frame)
    }

    async fn send_typing(&self, reply_to: &str) -> anyhow::Result<()> {
        self.push_frame(reply_to, json!({"type": "typing"}))
    }

    async fn send_chunk(&self, reply_to: &str, text: &str) -> anyhow::Result<()> {
        self.push_frame(reply_to, json!({"type": "chunk", "text": text}))
    }

    async fn send_tool_call(
        &self,
        reply_to: &str,
        name: &str,
        input: &serde_json::Value,
    ) -> anyhow::Result<()> {
        self.push_frame(
            reply_to,
            json!({"type": "tool_call", "name": name, "input": input}),
        )
    }

    async fn send_tool_result(
        &self,
        reply_to: &str,
        name: &str,
        summary: &str,
    ) -> anyhow::Result<()> {
        self.push_frame(
            reply_to,
            json!({"type": "tool_result", "name": name, "summary": summary}),
        )
    }
}
