//! Wire types shared between the dispatch engine and its collaborators.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// A rendered message ready for the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Recipient identifier (normalised phone number).
    pub recipient_id: String,
    /// Message body.
    pub content: String,
    /// Optional document to attach.
    pub attachment: Option<PathBuf>,
}

impl OutgoingMessage {
    pub fn text(recipient_id: &str, content: &str) -> Self {
        Self {
            recipient_id: recipient_id.to_string(),
            content: content.to_string(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, path: PathBuf) -> Self {
        self.attachment = Some(path);
        self
    }
}

/// One step of a simulated composing session.
///
/// `delay` is how long to wait *before* the event is pushed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TypingEvent {
    /// A character typed.
    Key { ch: char, delay: Duration },
    /// A pause with no keystroke.
    Pause { duration: Duration },
    /// Deletion of the previously typed character.
    Backspace { delay: Duration },
}

impl TypingEvent {
    /// Time to wait before realizing this event.
    pub fn wait(&self) -> Duration {
        match self {
            TypingEvent::Key { delay, .. } | TypingEvent::Backspace { delay } => *delay,
            TypingEvent::Pause { duration } => *duration,
        }
    }
}

/// Mask a recipient identifier for logs — keep first 2 and last 4 chars.
pub fn mask_id(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.len() <= 6 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 6), tail)
}
