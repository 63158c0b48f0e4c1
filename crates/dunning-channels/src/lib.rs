//! # Dunning Channels
//! Concrete transports and document fetchers for the dispatch engine.

pub mod document;
pub mod dry_run;
pub mod whatsapp;

pub use document::PortalDocumentFetcher;
pub use dry_run::DryRunTransport;
pub use whatsapp::WhatsAppTransport;
