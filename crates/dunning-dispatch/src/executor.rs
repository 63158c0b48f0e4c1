//! Delivery executor — realizes one delivery against the transport.
//!
//! Owns the transport session exclusively. Document retrieval is an optional
//! step with its own timeout and failure channel: it can degrade a delivery
//! to text-only but never fails it.

use std::sync::Arc;
use std::time::Duration;

use dunning_core::clock::Clock;
use dunning_core::config::DunningConfig;
use dunning_core::error::{DunningError, Result};
use dunning_core::traits::{DocumentFetcher, Transport};
use dunning_core::types::{OutgoingMessage, mask_id};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::behavior::TypingPlan;
use crate::recipient::{Recipient, is_well_formed_id};

/// Classified result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Worth retrying (timeouts, dropped connections).
    TransientFailure { reason: String },
    /// Never retried. `invalid_recipient` separates a malformed or unknown
    /// number from a recipient the transport refused.
    PermanentFailure { reason: String, invalid_recipient: bool },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::TransientFailure { .. } => "transient_failure",
            Outcome::PermanentFailure { .. } => "permanent_failure",
        }
    }
}

/// Everything the orchestrator needs to know about an attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub outcome: Outcome,
    /// Whether the transport send primitive was invoked (counts against quota).
    pub dispatched: bool,
    pub attachment_included: bool,
    /// Degraded-delivery note, e.g. document retrieval failed.
    pub degraded: Option<String>,
    pub latency: Duration,
}

/// Bounded retry contract for transient failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    /// Wait after the Nth failed attempt is `backoff[N-1]`; the last entry
    /// repeats.
    pub backoff: Vec<Duration>,
}

impl RetryPolicy {
    pub fn from_secs(max_attempts: u32, backoff_secs: &[u64]) -> Self {
        Self {
            max_attempts,
            backoff: backoff_secs.iter().map(|s| Duration::from_secs(*s)).collect(),
        }
    }

    /// Whether a record with `attempts` failed attempts gets another one.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Wait before the attempt following failed attempt number `attempt`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let idx = (attempt.max(1) - 1) as usize;
        self.backoff
            .get(idx)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_secs(3, &[2, 8, 30])
    }
}

/// Reconnect policy for a dropped session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPolicy {
    pub reconnect_attempts: u32,
    pub backoff: Vec<Duration>,
}

impl SessionPolicy {
    fn backoff_for(&self, attempt: u32) -> Duration {
        let idx = (attempt.max(1) - 1) as usize;
        self.backoff
            .get(idx)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Result of bringing the session up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCheck {
    Ready,
    /// A stop was requested before the session came back.
    Stopped,
}

/// Sleep on `clock` for `duration`, returning early with `false` once `stop`
/// reads true. Returns `true` when the full duration elapsed.
pub(crate) async fn sleep_unless_stopped(
    clock: &dyn Clock,
    duration: Duration,
    stop: &mut watch::Receiver<bool>,
) -> bool {
    if *stop.borrow() {
        return false;
    }
    if duration.is_zero() {
        return true;
    }
    let stopped = async {
        loop {
            if *stop.borrow_and_update() {
                break;
            }
            if stop.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = clock.sleep(duration) => true,
        _ = stopped => false,
    }
}

/// Executes deliveries one at a time against an exclusively owned transport.
pub struct DeliveryExecutor {
    transport: Box<dyn Transport>,
    documents: Option<Box<dyn DocumentFetcher>>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    session: SessionPolicy,
    send_timeout: Duration,
    document_timeout: Duration,
}

impl DeliveryExecutor {
    pub fn new(transport: Box<dyn Transport>, clock: Arc<dyn Clock>, config: &DunningConfig) -> Self {
        Self {
            transport,
            documents: None,
            clock,
            retry: RetryPolicy::from_secs(config.retry.max_attempts, &config.retry.backoff_secs),
            session: SessionPolicy {
                reconnect_attempts: config.session.reconnect_attempts,
                backoff: config
                    .session
                    .reconnect_backoff_secs
                    .iter()
                    .map(|s| Duration::from_secs(*s))
                    .collect(),
            },
            send_timeout: Duration::from_secs(config.delivery.send_timeout_secs),
            document_timeout: Duration::from_secs(config.delivery.document_timeout_secs),
        }
    }

    /// Attach a document fetcher.
    pub fn with_documents(mut self, fetcher: Box<dyn DocumentFetcher>) -> Self {
        self.documents = Some(fetcher);
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Make sure the session is up, reconnecting up to the configured number
    /// of times. `SessionLost` is fatal for the run. `stop` is honoured
    /// before every connect and during every backoff.
    pub async fn ensure_session(&mut self, stop: &mut watch::Receiver<bool>) -> Result<SessionCheck> {
        if self.transport.is_connected() {
            return Ok(SessionCheck::Ready);
        }

        let attempts = self.session.reconnect_attempts;
        for attempt in 1..=attempts {
            if attempt > 1 {
                let wait = self.session.backoff_for(attempt - 1);
                tracing::debug!("🔌 Waiting {}s before reconnect attempt {}", wait.as_secs(), attempt);
                if !sleep_unless_stopped(self.clock.as_ref(), wait, stop).await {
                    return Ok(SessionCheck::Stopped);
                }
            }
            if *stop.borrow() {
                tracing::info!("🛑 Reconnect abandoned: stop requested");
                return Ok(SessionCheck::Stopped);
            }
            tracing::info!(
                "🔌 Connecting {} (attempt {}/{})",
                self.transport.name(),
                attempt,
                attempts
            );
            match self.transport.connect().await {
                Ok(()) if self.transport.is_connected() => {
                    tracing::info!("✅ {} session established", self.transport.name());
                    return Ok(SessionCheck::Ready);
                }
                Ok(()) => {
                    tracing::warn!("⚠️ {} still disconnected after connect", self.transport.name());
                }
                Err(e) => {
                    tracing::warn!("⚠️ {} connect failed: {}", self.transport.name(), e);
                }
            }
        }

        if *stop.borrow() {
            return Ok(SessionCheck::Stopped);
        }
        tracing::error!(
            "❌ {} session unrecoverable after {} attempts",
            self.transport.name(),
            attempts
        );
        Err(DunningError::SessionLost { attempts })
    }

    /// Tear the session down at the end of a run.
    pub async fn close(&mut self) -> Result<()> {
        if !self.transport.is_connected() {
            return Ok(());
        }
        self.transport.disconnect().await?;
        tracing::info!("🔌 {} session closed", self.transport.name());
        Ok(())
    }

    /// Deliver one message. Never returns an error: every failure is folded
    /// into the report's `Outcome`.
    pub async fn deliver(&mut self, record: &Recipient, plan: &TypingPlan) -> DeliveryReport {
        let started = Instant::now();
        let masked = mask_id(&record.id);

        if !is_well_formed_id(&record.id) {
            let report = DeliveryReport {
                outcome: Outcome::PermanentFailure {
                    reason: "malformed recipient identifier".into(),
                    invalid_recipient: true,
                },
                dispatched: false,
                attachment_included: false,
                degraded: None,
                latency: started.elapsed(),
            };
            log_delivery(&masked, record.attempts, &report);
            return report;
        }

        let (attachment, degraded) = self.retrieve_document(record, &masked).await;

        self.realize_typing(&record.id, plan).await;

        let mut message = OutgoingMessage::text(&record.id, plan.text());
        if let Some(path) = attachment.clone() {
            message = message.with_attachment(path);
        }

        let outcome = match tokio::time::timeout(self.send_timeout, self.transport.send(&message)).await {
            Ok(Ok(())) => Outcome::Success,
            Ok(Err(e)) => classify(e),
            Err(_) => Outcome::TransientFailure {
                reason: format!("send timed out after {}s", self.send_timeout.as_secs()),
            },
        };

        let report = DeliveryReport {
            outcome,
            dispatched: true,
            attachment_included: attachment.is_some(),
            degraded,
            latency: started.elapsed(),
        };
        log_delivery(&masked, record.attempts, &report);
        report
    }

    /// Best-effort document retrieval. Returns the attachment path, or the
    /// degraded-delivery note explaining its absence.
    async fn retrieve_document(
        &self,
        record: &Recipient,
        masked: &str,
    ) -> (Option<std::path::PathBuf>, Option<String>) {
        let Some(doc) = &record.document else {
            return (None, None);
        };
        let Some(fetcher) = &self.documents else {
            let note = "document retrieval not configured; sent text-only".to_string();
            tracing::warn!(recipient = %masked, "📄 {}", note);
            return (None, Some(note));
        };

        let fetch = fetcher.fetch(&doc.customer_id, doc.protocol.as_deref(), self.document_timeout);
        let note = match tokio::time::timeout(self.document_timeout, fetch).await {
            Ok(Ok(Some(path))) => {
                tracing::debug!(recipient = %masked, "📄 Document retrieved: {}", path.display());
                return (Some(path), None);
            }
            Ok(Ok(None)) => "no document available; sent text-only".to_string(),
            Ok(Err(e)) => format!("document retrieval failed ({e}); sent text-only"),
            Err(_) => format!(
                "document retrieval timed out after {}s; sent text-only",
                self.document_timeout.as_secs()
            ),
        };
        tracing::warn!(recipient = %masked, fetcher = fetcher.name(), "📄 Degraded delivery: {}", note);
        (None, Some(note))
    }

    /// Play the typing plan through the composing API, when the transport has one.
    async fn realize_typing(&self, recipient_id: &str, plan: &TypingPlan) {
        if !self.transport.supports_compose() {
            return;
        }
        for event in plan.events() {
            self.clock.sleep(event.wait()).await;
            if let Err(e) = self.transport.compose(recipient_id, &event).await {
                tracing::debug!("⌨️ Composing indicator unavailable: {}", e);
                break;
            }
        }
    }
}

fn classify(e: DunningError) -> Outcome {
    if e.is_permanent() {
        Outcome::PermanentFailure {
            invalid_recipient: matches!(e, DunningError::InvalidRecipient(_)),
            reason: e.to_string(),
        }
    } else {
        Outcome::TransientFailure { reason: e.to_string() }
    }
}

fn log_delivery(masked: &str, attempt: u32, report: &DeliveryReport) {
    let latency_ms = report.latency.as_millis() as u64;
    match &report.outcome {
        Outcome::Success => tracing::info!(
            recipient = %masked,
            outcome = report.outcome.label(),
            latency_ms,
            attempt,
            attachment = report.attachment_included,
            degraded = report.degraded.is_some(),
            "📤 Delivered"
        ),
        Outcome::TransientFailure { reason } | Outcome::PermanentFailure { reason, .. } => {
            tracing::warn!(
                recipient = %masked,
                outcome = report.outcome.label(),
                latency_ms,
                attempt,
                attachment = report.attachment_included,
                reason = %reason,
                "📤 Delivery failed"
            )
        }
    }
}
