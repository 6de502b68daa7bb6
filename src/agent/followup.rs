//! Per-session followup inbox.
//!
//! `Steer` hands each message straight to the registered sink, which either
//! injects into a live runner or routes the message as freshly arrived.
//! `Collect` batches per session until drained; the gateway never wires this
//! mode today, it is kept for deterministic replay.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FollowupMode {
    #[default]
    Steer,
    Collect,
}

/// Where steered messages go. Registered once at gateway startup.
#[async_trait]
pub trait FollowupSink: Send + Sync {
    async fn steer(&self, session_key: &str, text: &str) -> Result<()>;
}

pub struct FollowupQueue {
    mode: FollowupMode,
    sink: Mutex<Option<Arc<dyn FollowupSink>>>,
    pending: Mutex<HashMap<String, Vec<String>>>,
}

impl FollowupQueue {
    pub fn new(mode: FollowupMode) -> Self {
        Self {
            mode,
            sink: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_sink(&self, sink: Arc<dyn FollowupSink>) {
        *self
            .sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(sink);
    }

    pub async fn enqueue(&self, session_key: &str, text: &str) -> Result<()> {
        match self.mode {
            FollowupMode::Steer => {
                let sink = self
                    .sink
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .clone();
                match sink {
                    Some(sink) => sink.steer(session_key, text).await,
                    None => {
                        anyhow::bail!("no followup sink registered for {session_key}")
                    }
                }
            }
            FollowupMode::Collect => {
                self.pending
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .entry(session_key.to_string())
                    .or_default()
                    .push(text.to_string());
                Ok(())
            }
        }
    }

    /// Take and clear the collected messages for one session.
    pub fn drain(&self, session_key: &str) -> Vec<String> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(session_key)
            .unwrap_or_default()
    }
}
