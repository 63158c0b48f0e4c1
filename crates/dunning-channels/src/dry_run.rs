//! Dry-run transport — logs what would be sent.

use async_trait::async_trait;
use dunning_core::error::Result;
use dunning_core::traits::Transport;
use dunning_core::types::{OutgoingMessage, TypingEvent, mask_id};

/// Accepts every message without touching the network. Composing events are
/// logged at trace level so pacing can be inspected with `RUST_LOG`.
#[derive(Default)]
pub struct DryRunTransport {
    connected: bool,
}

impl DryRunTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for DryRunTransport {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        tracing::info!("🧪 Dry-run transport: nothing will be sent");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<()> {
        tracing::info!(
            recipient = %mask_id(&message.recipient_id),
            attachment = ?message.attachment,
            chars = message.content.chars().count(),
            "🧪 [dry-run] would send"
        );
        tracing::debug!("🧪 [dry-run] body: {}", message.content);
        Ok(())
    }

    fn supports_compose(&self) -> bool {
        true
    }

    async fn compose(&self, recipient_id: &str, event: &TypingEvent) -> Result<()> {
        tracing::trace!(recipient = %mask_id(recipient_id), ?event, "⌨️ compose");
        Ok(())
    }
}
