//! Recipient store — input order, per-record status and the attempt log.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dunning_core::error::{DunningError, Result};
use serde::{Deserialize, Serialize};

use crate::recipient::{DeliveryStatus, Recipient};

/// Outcome category of a logged attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Started,
    Success,
    Failure,
    Skipped,
}

impl From<DeliveryStatus> for AttemptOutcome {
    fn from(status: DeliveryStatus) -> Self {
        match status {
            DeliveryStatus::Sent => AttemptOutcome::Success,
            DeliveryStatus::Failed => AttemptOutcome::Failure,
            DeliveryStatus::SkippedDuplicate | DeliveryStatus::SkippedInvalid => {
                AttemptOutcome::Skipped
            }
            DeliveryStatus::Pending | DeliveryStatus::InProgress => AttemptOutcome::Started,
        }
    }
}

/// Delivery details attached to a status update.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AttemptMeta {
    pub latency: Option<Duration>,
    pub attachment: bool,
}

/// One entry of the attempt log. Ephemeral — not authoritative state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub recipient_id: String,
    pub at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub outcome: AttemptOutcome,
    pub latency: Option<Duration>,
    pub attachment: bool,
}

/// Counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped_duplicate: usize,
    pub skipped_invalid: usize,
}

impl StoreSnapshot {
    pub fn from_records(records: &[Recipient]) -> Self {
        let mut snap = StoreSnapshot {
            total: records.len(),
            ..Default::default()
        };
        for r in records {
            match r.status {
                DeliveryStatus::Pending => snap.pending += 1,
                DeliveryStatus::InProgress => snap.in_progress += 1,
                DeliveryStatus::Sent => snap.sent += 1,
                DeliveryStatus::Failed => snap.failed += 1,
                DeliveryStatus::SkippedDuplicate => snap.skipped_duplicate += 1,
                DeliveryStatus::SkippedInvalid => snap.skipped_invalid += 1,
            }
        }
        snap
    }

    /// Sum of all status buckets; always equals `total`.
    pub fn accounted(&self) -> usize {
        self.pending
            + self.in_progress
            + self.sent
            + self.failed
            + self.skipped_duplicate
            + self.skipped_invalid
    }
}

/// Holds the recipient list of a run and enforces status transitions.
pub struct RecipientStore {
    records: Vec<Recipient>,
    /// id → position of the first (authoritative) occurrence.
    index: HashMap<String, usize>,
    max_attempts: u32,
    log: VecDeque<DeliveryAttempt>,
    log_capacity: usize,
}

impl RecipientStore {
    pub fn new(max_attempts: u32, log_capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            index: HashMap::new(),
            max_attempts,
            log: VecDeque::new(),
            log_capacity: log_capacity.max(1),
        }
    }

    /// Load the run's recipients. Repeated identifiers after the first are
    /// marked `SkippedDuplicate`. Returns the number of duplicates.
    pub fn load(&mut self, records: Vec<Recipient>, now: DateTime<Utc>) -> usize {
        self.records.clear();
        self.index.clear();
        let mut duplicates = 0;

        for mut record in records {
            let position = self.records.len();
            if self.index.contains_key(&record.id) {
                record.status = DeliveryStatus::SkippedDuplicate;
                record.last_error = Some("duplicate identifier".into());
                duplicates += 1;
                self.push_log(&record.id, DeliveryStatus::SkippedDuplicate, AttemptMeta::default(), now);
                tracing::info!(
                    recipient = %dunning_core::mask_id(&record.id),
                    "⏭️ Duplicate recipient skipped"
                );
            } else {
                self.index.insert(record.id.clone(), position);
            }
            self.records.push(record);
        }

        tracing::info!(
            "📋 Loaded {} recipients ({} duplicates)",
            self.records.len(),
            duplicates
        );
        duplicates
    }

    /// Rebuild a store from persisted records.
    ///
    /// Records caught `InProgress` by a crash are moved to `Failed` with reason
    /// `interrupted`, and stay retry-eligible while attempts remain.
    pub fn restore(
        records: Vec<Recipient>,
        max_attempts: u32,
        log_capacity: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let mut store = Self::new(max_attempts, log_capacity);
        for mut record in records {
            let position = store.records.len();
            if record.status == DeliveryStatus::InProgress {
                record.status = DeliveryStatus::Failed;
                record.last_error = Some("interrupted".into());
                record.next_retry_at = if record.attempts < max_attempts {
                    Some(now)
                } else {
                    None
                };
                tracing::warn!(
                    recipient = %dunning_core::mask_id(&record.id),
                    "⚠️ Recipient was in flight when the run stopped — marked interrupted"
                );
            }
            if record.status != DeliveryStatus::SkippedDuplicate {
                store.index.entry(record.id.clone()).or_insert(position);
            }
            store.records.push(record);
        }
        store
    }

    /// Next record to dispatch, in input order: pending records first, then
    /// failed records whose retry time has come.
    pub fn next_pending(&self, now: DateTime<Utc>) -> Option<&Recipient> {
        self.records
            .iter()
            .find(|r| r.status == DeliveryStatus::Pending)
            .or_else(|| self.records.iter().find(|r| self.retry_ready(r, now)))
    }

    /// Earliest retry time among failed records still waiting for one.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.records
            .iter()
            .filter(|r| self.retry_eligible(r))
            .filter_map(|r| r.next_retry_at)
            .min()
    }

    fn retry_eligible(&self, r: &Recipient) -> bool {
        r.status == DeliveryStatus::Failed
            && r.attempts < self.max_attempts
            && r.next_retry_at.is_some()
    }

    fn retry_ready(&self, r: &Recipient, now: DateTime<Utc>) -> bool {
        self.retry_eligible(r) && r.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Transition a record to `status`.
    pub fn mark(
        &mut self,
        id: &str,
        status: DeliveryStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.mark_attempt(id, status, error, AttemptMeta::default(), now)
    }

    /// Transition a record to `status`, logging delivery details.
    pub fn mark_attempt(
        &mut self,
        id: &str,
        status: DeliveryStatus,
        error: Option<String>,
        meta: AttemptMeta,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let position = self.position(id)?;
        let max_attempts = self.max_attempts;
        let record = &mut self.records[position];

        if !record.status.can_transition_to(status) {
            return Err(DunningError::State(format!(
                "{}: {} → {}",
                dunning_core::mask_id(id),
                record.status,
                status
            )));
        }
        if record.status == DeliveryStatus::Failed && record.attempts >= max_attempts {
            return Err(DunningError::State(format!(
                "{}: retries exhausted ({} of {})",
                dunning_core::mask_id(id),
                record.attempts,
                max_attempts
            )));
        }

        if status == DeliveryStatus::InProgress {
            record.attempts += 1;
            record.last_attempt_at = Some(now);
            record.next_retry_at = None;
        }
        if error.is_some() || status == DeliveryStatus::Sent {
            record.last_error = error;
        }
        record.status = status;

        self.push_log(id, status, meta, now);
        Ok(())
    }

    /// Allow a failed record to be retried at `at`.
    pub fn schedule_retry(&mut self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let position = self.position(id)?;
        let max_attempts = self.max_attempts;
        let record = &mut self.records[position];
        if record.status != DeliveryStatus::Failed || record.attempts >= max_attempts {
            return Err(DunningError::State(format!(
                "{}: cannot schedule retry from {} after {} attempts",
                dunning_core::mask_id(id),
                record.status,
                record.attempts
            )));
        }
        record.next_retry_at = Some(at);
        Ok(())
    }

    /// Replace the degraded-delivery note; `None` clears it.
    pub fn set_note(&mut self, id: &str, note: Option<&str>) -> Result<()> {
        let position = self.position(id)?;
        self.records[position].note = note.map(String::from);
        Ok(())
    }

    /// Counts per status.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot::from_records(&self.records)
    }

    pub fn get(&self, id: &str) -> Option<&Recipient> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    /// Input position of the authoritative record for `id`.
    pub fn position(&self, id: &str) -> Result<usize> {
        self.index.get(id).copied().ok_or_else(|| {
            DunningError::State(format!("unknown recipient {}", dunning_core::mask_id(id)))
        })
    }

    pub fn records(&self) -> &[Recipient] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Recent attempt log, oldest first.
    pub fn attempts(&self) -> impl Iterator<Item = &DeliveryAttempt> {
        self.log.iter()
    }

    fn push_log(&mut self, id: &str, status: DeliveryStatus, meta: AttemptMeta, now: DateTime<Utc>) {
        self.log.push_back(DeliveryAttempt {
            recipient_id: id.to_string(),
            at: now,
            status,
            outcome: status.into(),
            latency: meta.latency,
            attachment: meta.attachment,
        });
        // Ring buffer
        while self.log.len() > self.log_capacity {
            self.log.pop_front();
        }
    }
}
