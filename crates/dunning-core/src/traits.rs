//! Collaborator traits driven by the dispatch engine.
//!
//! Implementations live in `dunning-channels`; tests use scripted doubles.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::types::{OutgoingMessage, TypingEvent};

/// A chat transport session.
///
/// The dispatch engine owns exactly one transport and never calls it from two
/// deliveries at once.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logs.
    fn name(&self) -> &str;

    /// Establish or re-establish the session.
    async fn connect(&mut self) -> Result<()>;

    /// Tear the session down.
    async fn disconnect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Send a message, with its attachment when present.
    async fn send(&self, message: &OutgoingMessage) -> Result<()>;

    /// Whether `compose` drives a real "typing…" indicator.
    fn supports_compose(&self) -> bool {
        false
    }

    /// Push one composing event to the recipient's chat.
    async fn compose(&self, _recipient_id: &str, _event: &TypingEvent) -> Result<()> {
        Ok(())
    }
}

/// Best-effort retrieval of a billing document.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch the document for a customer. `Ok(None)` means the portal has no
    /// document for this customer; errors are retrieval failures.
    async fn fetch(
        &self,
        customer_id: &str,
        protocol: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<PathBuf>>;
}
