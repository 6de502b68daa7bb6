//! The channel adapter contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// A normalised inbound event, ready for routing.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub channel: String,
    /// Sender identity on the transport.
    pub from: String,
    pub text: String,
    /// Stable conversation address, `<channel>:<peer>` by convention.
    pub session_key: String,
    /// Reply address the adapter's `send` understands.
    pub reply_to: String,
    pub timestamp: DateTime<Utc>,
}

/// An outbound reply.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub text: String,
    pub tool_calls_summary: Option<String>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls_summary: None,
        }
    }
}

/// A transport adapter. The gateway registers one ingress handler at
/// startup; the streaming helpers are optional and default to no-ops for
/// transports without incremental display.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Start ingesting. Long-running; resolves when the transport shuts
    /// down.
    async fn start(&self, ingress: mpsc::Sender<IncomingMessage>) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Ship one outbound message to `reply_to`.
    async fn send(&self, reply_to: &str, message: &OutgoingMessage) -> anyhow::Result<()>;

    /// Typing indicator, where the transport has one.
    async fn send_typing(&self, _reply_to: &str) -> anyhow::Result<()> {
        Ok(())
    }

    // Streaming helpers for interactive transports.

    async fn send_chunk(&self, _reply_to: &str, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_tool_call(
        &self,
        _reply_to: &str,
        _name: &str,
        _input: &serde_json::Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_tool_result(
        &self,
        _reply_to: &str,
        _name: &str,
        _summary: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Reply address for a session key of this channel: the part after
/// `<channel>:`.
pub fn reply_to_from_session_key<'a>(channel: &str, session_key: &'a str) -> &'a str {
    session_key
        .strip_prefix(channel)
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or(session_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyChannel;

    #[async_trait]
    impl Channel for DummyChannel {
        fn name(&self) -> &str {
            "dummy"
        }

        async fn start(&self, ingress: mpsc::Sender<IncomingMessage>) -> anyhow::Result<()> {
            ingress
                .send(IncomingMessage {
                    channel: "dummy".into(),
                    from: "tester".into(),
                    text: "hello".into(),
                    session_key: "dummy:tester".into(),
                    reply_to: "tester".into(),
                    timestamp: Utc::now(),
                })
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))
        }

        async fn send(&self, _reply_to: &str, _message: &OutgoingMessage) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_methods_are_no_ops() {
        let channel = DummyChannel;
        assert!(channel.send_typing("x").await.is_ok());
        assert!(channel.send_chunk("x", "t").await.is_ok());
        assert!(channel
            .send_tool_call("x", "bash", &serde_json::json!({}))
            .await
            .is_ok());
        assert!(channel.send_tool_result("x", "bash", "ok").await.is_ok());
        assert!(channel.stop().await.is_ok());
    }

    #[tokio::test]
    async fn start_feeds_the_ingress_channel() {
        let channel = DummyChannel;
        let (tx, mut rx) = mpsc::channel(1);
        channel.start(tx).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.session_key, "dummy:tester");
        assert_eq!(msg.text, "hello");
    }

    #[test]
    fn reply_to_extraction() {
        assert_eq!(reply_to_from_session_key("telegram", "telegram:123"), "123");
        assert_eq!(
            reply_to_from_session_key("terminal", "terminal:127.0.0.1:5050"),
            "127.0.0.1:5050"
        );
        // Foreign keys pass through untouched.
        assert_eq!(reply_to_from_session_key("telegram", "cron:job-1"), "cron:job-1");
    }
}
