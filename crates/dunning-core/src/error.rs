//! Error types for Dunning.

use thiserror::Error;

/// Crate-wide error.
#[derive(Debug, Error)]
pub enum DunningError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Transport disconnected: {0}")]
    Disconnected(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Recipient rejected by transport: {0}")]
    Rejected(String),

    #[error("Document retrieval failed: {0}")]
    Document(String),

    #[error("Illegal state transition: {0}")]
    State(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Transport session lost after {attempts} reconnect attempts")]
    SessionLost { attempts: u32 },
}

impl DunningError {
    /// Failures worth retrying: the next attempt may succeed unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DunningError::Timeout(_)
                | DunningError::Disconnected(_)
                | DunningError::Channel(_)
                | DunningError::Io(_)
        )
    }

    /// Failures tied to the recipient itself; retrying cannot help.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DunningError::InvalidRecipient(_) | DunningError::Rejected(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DunningError>;
