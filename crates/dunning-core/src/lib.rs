//! # Dunning Core
//!
//! Shared foundation for the dispatch workspace: the error type, the TOML
//! configuration, the collaborator traits the engine drives (`Transport`,
//! `DocumentFetcher`) and the clock used for every time-dependent decision.

pub mod clock;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DunningConfig;
pub use error::{DunningError, Result};
pub use traits::{DocumentFetcher, Transport};
pub use types::{OutgoingMessage, TypingEvent, mask_id};
