use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    domain::{ChatId, MessageRef},
    messaging::types::IncomingCommand,
    Result,
};

/// Outbound half of the administrative channel.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef>;

    async fn send_image(&self, chat_id: ChatId, image: &Path, caption: &str)
        -> Result<MessageRef>;
}

/// The administrative channel as the Orchestrator drives it: outbound messages
/// plus a listener that forwards operator commands.
#[async_trait]
pub trait AdminChannel: MessagingPort {
    /// Register the fixed command set and begin listening.
    async fn start(&self, commands: mpsc::UnboundedSender<IncomingCommand>) -> Result<()>;

    /// Stop listening. Safe to call when not started.
    async fn stop(&self) -> Result<()>;
}
