//! # Dunning Dispatch
//!
//! Outbound dispatch engine for collection reminders over a chat transport.
//! Sends one personalised message per debtor, paced to look human, within
//! hourly and daily caps, and resumable after a crash.
//!
//! ## Architecture
//! ```text
//! BatchOrchestrator (single loop per run)
//!   ├── RecipientStore   → next pending record (input order, then retries)
//!   ├── QuotaGovernor    → may_dispatch? else COOLDOWN for check_cooldown()
//!   ├── BehaviorSynthesizer
//!   │     ├── plan_typing(text) → lazy keystroke/pause/typo events
//!   │     └── plan_delay()      → message gap or batch pause
//!   ├── DeliveryExecutor (owns the Transport session)
//!   │     ├── DocumentFetcher (best-effort, bounded timeout)
//!   │     ├── compose(typing events), when supported
//!   │     └── send → Success | TransientFailure | PermanentFailure
//!   ├── RecipientStore   ← status update, retry scheduling
//!   ├── RunDb (SQLite)   ← write-through after every mutation
//!   └── watch::Sender<RunStatus> + on_progress → observers
//! ```

pub mod behavior;
pub mod executor;
pub mod ingest;
pub mod orchestrator;
pub mod persistence;
pub mod quota;
pub mod recipient;
pub mod run;
pub mod store;
pub mod template;

#[cfg(test)]
mod testing;

pub use behavior::{BehaviorSynthesizer, TypingPlan};
pub use executor::{DeliveryExecutor, DeliveryReport, Outcome, RetryPolicy, SessionCheck};
pub use ingest::{IngestReport, Rejection};
pub use orchestrator::{BatchOrchestrator, StopHandle};
pub use persistence::{RunDb, RunInfo, RunSnapshot};
pub use quota::{QuotaGovernor, QuotaSnapshot};
pub use recipient::{DeliveryStatus, Recipient};
pub use run::{RunPhase, RunStatus, RunSummary};
pub use store::{RecipientStore, StoreSnapshot};
pub use template::MessageTemplate;
