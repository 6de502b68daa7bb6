//! Transport adapters and the registry that wires them to the gateway.

pub mod telegram;
pub mod terminal;
pub mod traits;

pub use telegram::{TelegramChannel, TELEGRAM_CHANNEL};
pub use terminal::{TerminalChannel, TERMINAL_CHANNEL};
pub use traits::{reply_to_from_session_key, Channel, IncomingMessage, OutgoingMessage};

use crate::config::ChannelsConfig;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The adapters this process runs, keyed by channel name.
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    /// Build the registry from configuration.
    pub fn from_config(config: &ChannelsConfig) -> Self {
        let mut registry = Self::new();
        if let Some(terminal) = &config.terminal {
            registry.register(Arc::new(TerminalChannel::new(&terminal.bind)));
        }
        if let Some(telegram) = &config.telegram {
            registry.register(Arc::new(TelegramChannel::new(
                &telegram.bot_token,
                telegram.allowed_senders.clone(),
            )));
        }
        registry
    }

    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        self.channels
            .insert(channel.name().to_string(), channel);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.channels.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start every adapter's ingest loop, all feeding one ingress queue.
    pub fn start_all(&self, ingress: mpsc::Sender<IncomingMessage>) {
        for channel in self.channels.values() {
            let channel = channel.clone();
            let ingress = ingress.clone();
            tokio::spawn(async move {
                let name = channel.name().to_string();
                if let Err(e) = channel.start(ingress).await {
                    tracing::error!(channel = %name, error = %e, "channel ingest loop failed");
                }
            });
        }
    }

    pub async fn stop_all(&self) {
        for channel in self.channels.values() {
            if let Err(e) = channel.stop().await {
                tracing::warn!(channel = %channel.name(), error = %e, "channel stop failed");
            }
        }
    }
}
