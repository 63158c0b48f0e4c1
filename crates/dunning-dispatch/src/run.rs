//! Run-level state: phase, observable status and the final summary.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::quota::QuotaSnapshot;
use crate::recipient::{DeliveryStatus, Recipient};
use crate::store::StoreSnapshot;

/// Phase of a dispatch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunPhase {
    Idle,
    Running,
    Cooldown,
    Stopped,
    Error,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "IDLE",
            RunPhase::Running => "RUNNING",
            RunPhase::Cooldown => "COOLDOWN",
            RunPhase::Stopped => "STOPPED",
            RunPhase::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IDLE" => Some(RunPhase::Idle),
            "RUNNING" => Some(RunPhase::Running),
            "COOLDOWN" => Some(RunPhase::Cooldown),
            "STOPPED" => Some(RunPhase::Stopped),
            "ERROR" => Some(RunPhase::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Stopped | RunPhase::Error)
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view published to status observers after every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    pub phase: RunPhase,
    pub started_at: DateTime<Utc>,
    pub store: StoreSnapshot,
    pub quota: QuotaSnapshot,
}

/// A record that did not end in SENT, with its captured reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureLine {
    pub recipient_id: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub reason: String,
}

/// Final report of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub phase: RunPhase,
    pub counts: StoreSnapshot,
    pub elapsed: Duration,
    /// Why the run halted early (ERROR phase only).
    pub halt_reason: Option<String>,
    pub failures: Vec<FailureLine>,
    /// Records sent in degraded form, with the note.
    pub degraded: Vec<(String, String)>,
}

impl RunSummary {
    pub fn build(
        run_id: &str,
        phase: RunPhase,
        counts: StoreSnapshot,
        elapsed: Duration,
        halt_reason: Option<String>,
        records: &[Recipient],
    ) -> Self {
        let failures = records
            .iter()
            .filter(|r| r.status == DeliveryStatus::Failed || r.status.is_skipped())
            .map(|r| FailureLine {
                recipient_id: r.id.clone(),
                status: r.status,
                attempts: r.attempts,
                reason: r.last_error.clone().unwrap_or_else(|| "unknown".into()),
            })
            .collect();
        let degraded = records
            .iter()
            .filter(|r| r.status == DeliveryStatus::Sent)
            .filter_map(|r| r.note.as_ref().map(|n| (r.id.clone(), n.clone())))
            .collect();
        Self {
            run_id: run_id.to_string(),
            phase,
            counts,
            elapsed,
            halt_reason,
            failures,
            degraded,
        }
    }

    pub fn skipped(&self) -> usize {
        self.counts.skipped_duplicate + self.counts.skipped_invalid
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let line = "=".repeat(60);
        writeln!(f, "{line}")?;
        writeln!(f, "📊 Run {} — {}", self.run_id, self.phase)?;
        writeln!(f, "{line}")?;
        writeln!(f, "✅ Sent:     {}/{}", self.counts.sent, self.counts.total)?;
        writeln!(f, "❌ Failed:   {}", self.counts.failed)?;
        writeln!(
            f,
            "⏭️ Skipped:  {} (duplicate {}, invalid {})",
            self.skipped(),
            self.counts.skipped_duplicate,
            self.counts.skipped_invalid
        )?;
        writeln!(f, "⏳ Pending:  {}", self.counts.pending + self.counts.in_progress)?;
        writeln!(f, "⏱️ Elapsed:  {}s", self.elapsed.as_secs())?;
        if let Some(reason) = &self.halt_reason {
            writeln!(f, "🛑 Halted:   {reason}")?;
        }
        for failure in &self.failures {
            writeln!(
                f,
                "   {} {} ({} attempts): {}",
                dunning_core::mask_id(&failure.recipient_id),
                failure.status,
                failure.attempts,
                failure.reason
            )?;
        }
        for (id, note) in &self.degraded {
            writeln!(f, "   {} SENT (degraded): {}", dunning_core::mask_id(id), note)?;
        }
        write!(f, "{line}")
    }
}
