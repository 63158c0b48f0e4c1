//! Recipient records — the unit of work of a dispatch run.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Delivery status of a recipient.
///
/// Status only moves forward; the single backwards edge is
/// `Failed → InProgress` when a retry is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    InProgress,
    Sent,
    Failed,
    SkippedDuplicate,
    SkippedInvalid,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::InProgress => "IN_PROGRESS",
            DeliveryStatus::Sent => "SENT",
            DeliveryStatus::Failed => "FAILED",
            DeliveryStatus::SkippedDuplicate => "SKIPPED_DUPLICATE",
            DeliveryStatus::SkippedInvalid => "SKIPPED_INVALID",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(DeliveryStatus::Pending),
            "IN_PROGRESS" => Some(DeliveryStatus::InProgress),
            "SENT" => Some(DeliveryStatus::Sent),
            "FAILED" => Some(DeliveryStatus::Failed),
            "SKIPPED_DUPLICATE" => Some(DeliveryStatus::SkippedDuplicate),
            "SKIPPED_INVALID" => Some(DeliveryStatus::SkippedInvalid),
            _ => None,
        }
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, SkippedDuplicate)
                | (InProgress, Sent)
                | (InProgress, Failed)
                | (InProgress, SkippedInvalid)
                | (Failed, InProgress)
        )
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, DeliveryStatus::SkippedDuplicate | DeliveryStatus::SkippedInvalid)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a billing document held by the portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub customer_id: String,
    pub protocol: Option<String>,
}

/// A debtor targeted by one outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    /// Stable key — normalised phone number.
    pub id: String,
    pub name: String,
    /// Amount due, in cents.
    pub amount_cents: u64,
    pub due_date: NaiveDate,
    pub document: Option<DocumentRef>,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Earliest time a failed record may be retried. `None` on a failed
    /// record means it is never retried.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Degraded-delivery note (e.g. sent without its document).
    pub note: Option<String>,
}

impl Recipient {
    pub fn new(id: &str, name: &str, amount_cents: u64, due_date: NaiveDate) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            amount_cents,
            due_date,
            document: None,
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            next_retry_at: None,
            note: None,
        }
    }

    pub fn with_document(mut self, customer_id: &str, protocol: Option<&str>) -> Self {
        self.document = Some(DocumentRef {
            customer_id: customer_id.to_string(),
            protocol: protocol.map(String::from),
        });
        self
    }
}

/// Strip separators from a phone number. Returns `None` when what remains is
/// not 10–15 digits.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let body = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if body
        .chars()
        .any(|c| !(c.is_ascii_digit() || matches!(c, ' ' | '-' | '(' | ')' | '.')))
    {
        return None;
    }
    let digits: String = body.chars().filter(|c| c.is_ascii_digit()).collect();
    if is_well_formed_id(&digits) {
        Some(digits)
    } else {
        None
    }
}

/// A sendable identifier: 10–15 ASCII digits.
pub fn is_well_formed_id(id: &str) -> bool {
    (10..=15).contains(&id.len()) && id.chars().all(|c| c.is_ascii_digit())
}
