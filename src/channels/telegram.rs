//! Telegram bot adapter — long-poll ingest, allowlist filtering, plain
//! sends.

use super::traits::{Channel, IncomingMessage, OutgoingMessage};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const TELEGRAM_CHANNEL: &str = "telegram";
const POLL_TIMEOUT_SECS: u64 = 30;

pub struct TelegramChannel {
    token: String,
    allowed_senders: Vec<String>,
    base_url: String,
    http: Client,
    offset: AtomicI64,
    shutdown: CancellationToken,
}

impl TelegramChannel {
    pub fn new(token: &str, allowed_senders: Vec<String>) -> Self {
        Self::with_base_url(token, allowed_senders, "https://api.telegram.org")
    }

    pub fn with_base_url(token: &str, allowed_senders: Vec<String>, base_url: &str) -> Self {
        Self {
            token: token.to_string(),
            allowed_senders,
            base_url: base_url.trim_end_matches('/').to_string(),
            http: Client::builder()
                .timeout(std::time::Duration::from_secs(POLL_TIMEOUT_SECS + 15))
                .build()
                .unwrap_or_else(|_| Client::new()),
            offset: AtomicI64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Empty allowlist denies everyone; `"*"` allows everyone.
    fn sender_allowed(&self, sender: &str) -> bool {
        self.allowed_senders
            .iter()
            .any(|allowed| allowed == "*" || allowed == sender)
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.base_url, self.token)
    }

    fn parse_update(&self, update: &Value) -> Option<IncomingMessage> {
        let message = update.get("message")?;
        let text = message.get("text").and_then(Value::as_str)?;
        let chat_id = message.pointer("/chat/id").and_then(Value::as_i64)?;
        let sender = message
            .pointer("/from/id")
            .and_then(Value::as_i64)
            .map(|id| id.to_string())
            .unwrap_or_else(|| chat_id.to_string());

        if !self.sender_allowed(&sender) {
            tracing::debug!(sender, "dropping message from sender outside the allowlist");
            return None;
        }

        Some(IncomingMessage {
            channel: TELEGRAM_CHANNEL.into(),
            from: sender,
            text: text.to_string(),
            session_key: format!("{TELEGRAM_CHANNEL}:{chat_id}"),
            reply_to: chat_id.to_string(),
            timestamp: Utc::now(),
        })
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        TELEGRAM_CHANNEL
    }

    async fn start(&self, ingress: mpsc::Sender<IncomingMessage>) -> anyhow::Result<()> {
        tracing::info!("telegram channel polling for updates");

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let offset = self.offset.load(Ordering::SeqCst);
            let response = tokio::select! {
                () = self.shutdown.cancelled() => return Ok(()),
                r = self
                    .http
                    .get(self.api_url("getUpdates"))
                    .query(&[
                        ("timeout", POLL_TIMEOUT_SECS.to_string()),
                        ("offset", offset.to_string()),
                    ])
                    .send() => r,
            };

            let body: Value = match response {
                Ok(r) => match r.json().await {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::warn!(error = %e, "telegram poll returned bad JSON");
                        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "telegram poll failed");
                    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                    continue;
                }
            };

            for update in body
                .get("result")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if let Some(update_id) = update.get("update_id").and_then(Value::as_i64) {
                    self.offset.store(update_id + 1, Ordering::SeqCst);
                }
                if let Some(message) = self.parse_update(update) {
                    if ingress.send(message).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        Ok(())
    }

    async fn send(&self, reply_to: &str, message: &OutgoingMessage) -> anyhow::Result<()> {
        let response = self
            .http
            .post(self.api_url("sendMessage"))
            .json(&json!({"chat_id": reply_to, "text": message.text}))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(crate::providers::api_error("Telegram", response).await);
        }
        Ok(())
    }

    async fn send_typing(&self, reply_to: &str) -> anyhow::Result<()> {
        let _ = self
            .http
            .post(self.api_url("sendChatAction"))
            .json(&json!({"chat_id": reply_to, "action": "typing"}))
            .send()
            .await;
        Ok(())
    }
}
