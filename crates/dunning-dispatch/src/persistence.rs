//! SQLite-backed run persistence.
//!
//! Every status mutation is written through, so a run killed at any point
//! can be resumed without re-sending anything already SENT.

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use dunning_core::error::{DunningError, Result};
use serde::{Deserialize, Serialize};

use crate::recipient::{DeliveryStatus, DocumentRef, Recipient};
use crate::run::RunPhase;

/// Full persisted state of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub run_id: String,
    pub phase: RunPhase,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub halt_reason: Option<String>,
    /// Dispatch timestamps still inside the quota windows.
    pub quota_sends: Vec<DateTime<Utc>>,
    /// Recipients in input order.
    pub records: Vec<Recipient>,
}

/// One line of `list_runs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub phase: RunPhase,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub remaining: usize,
}

/// Raw recipient row, converted outside the rusqlite closure.
struct RecipientRow {
    id: String,
    name: String,
    amount_cents: i64,
    due_date: String,
    customer_id: Option<String>,
    protocol: Option<String>,
    status: String,
    attempts: u32,
    last_attempt_at: Option<String>,
    last_error: Option<String>,
    next_retry_at: Option<String>,
    note: Option<String>,
}

/// Run database.
pub struct RunDb {
    conn: rusqlite::Connection,
}

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> DunningError + '_ {
    move |e| DunningError::Persistence(format!("{context}: {e}"))
}

impl RunDb {
    /// Open or create the run database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path).map_err(db_err("DB open"))?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                phase TEXT NOT NULL,
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                total INTEGER NOT NULL DEFAULT 0,
                halt_reason TEXT,
                quota_sends TEXT NOT NULL DEFAULT '[]'   -- JSON array of RFC3339
            );

            CREATE TABLE IF NOT EXISTS run_recipients (
                run_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                amount_cents INTEGER NOT NULL,
                due_date TEXT NOT NULL,               -- YYYY-MM-DD
                customer_id TEXT,
                protocol TEXT,
                status TEXT NOT NULL DEFAULT 'PENDING',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt_at TEXT,
                last_error TEXT,
                next_retry_at TEXT,
                note TEXT,
                PRIMARY KEY (run_id, position),
                FOREIGN KEY (run_id) REFERENCES runs(run_id) ON DELETE CASCADE
            );
         ",
            )
            .map_err(db_err("Migration"))
    }

    /// Write a whole run: header and every recipient.
    pub fn save(&mut self, snapshot: &RunSnapshot) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err("Begin"))?;
        tx.execute(
            "INSERT OR REPLACE INTO runs
             (run_id, phase, started_at, updated_at, total, halt_reason, quota_sends)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                snapshot.run_id,
                snapshot.phase.as_str(),
                snapshot.started_at.to_rfc3339(),
                snapshot.updated_at.to_rfc3339(),
                snapshot.records.len() as i64,
                snapshot.halt_reason,
                encode_sends(&snapshot.quota_sends)?,
            ],
        )
        .map_err(db_err("Save run"))?;
        for (position, record) in snapshot.records.iter().enumerate() {
            write_recipient(&tx, &snapshot.run_id, position, record)?;
        }
        tx.commit().map_err(db_err("Commit"))
    }

    /// Write one recipient together with the run header.
    pub fn checkpoint(
        &mut self,
        run_id: &str,
        phase: RunPhase,
        now: DateTime<Utc>,
        quota_sends: &[DateTime<Utc>],
        changed: Option<(usize, &Recipient)>,
    ) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err("Begin"))?;
        let updated = tx
            .execute(
                "UPDATE runs SET phase = ?2, updated_at = ?3, quota_sends = ?4 WHERE run_id = ?1",
                rusqlite::params![run_id, phase.as_str(), now.to_rfc3339(), encode_sends(quota_sends)?],
            )
            .map_err(db_err("Update run"))?;
        if updated == 0 {
            return Err(DunningError::Persistence(format!("unknown run {run_id}")));
        }
        if let Some((position, record)) = changed {
            write_recipient(&tx, run_id, position, record)?;
        }
        tx.commit().map_err(db_err("Commit"))
    }

    /// Record the final phase of a run.
    pub fn finish(
        &self,
        run_id: &str,
        phase: RunPhase,
        now: DateTime<Utc>,
        halt_reason: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET phase = ?2, updated_at = ?3, halt_reason = ?4 WHERE run_id = ?1",
                rusqlite::params![run_id, phase.as_str(), now.to_rfc3339(), halt_reason],
            )
            .map_err(db_err("Finish run"))?;
        Ok(())
    }

    /// Load a run, or `None` when it does not exist.
    pub fn load(&self, run_id: &str) -> Result<Option<RunSnapshot>> {
        let header = self
            .conn
            .query_row(
                "SELECT phase, started_at, updated_at, halt_reason, quota_sends FROM runs WHERE run_id = ?1",
                [run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            );
        let (phase, started_at, updated_at, halt_reason, sends) = match header {
            Ok(h) => h,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(db_err("Load run")(e)),
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, amount_cents, due_date, customer_id, protocol, status, attempts,
                        last_attempt_at, last_error, next_retry_at, note
                 FROM run_recipients WHERE run_id = ?1 ORDER BY position",
            )
            .map_err(db_err("Prepare"))?;
        let rows = stmt
            .query_map([run_id], |row| {
                Ok(RecipientRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    amount_cents: row.get(2)?,
                    due_date: row.get(3)?,
                    customer_id: row.get(4)?,
                    protocol: row.get(5)?,
                    status: row.get(6)?,
                    attempts: row.get(7)?,
                    last_attempt_at: row.get(8)?,
                    last_error: row.get(9)?,
                    next_retry_at: row.get(10)?,
                    note: row.get(11)?,
                })
            })
            .map_err(db_err("Load recipients"))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(into_recipient(row.map_err(db_err("Read recipient"))?)?);
        }

        Ok(Some(RunSnapshot {
            run_id: run_id.to_string(),
            phase: RunPhase::parse(&phase)
                .ok_or_else(|| DunningError::Persistence(format!("unknown phase {phase}")))?,
            started_at: parse_ts(&started_at)?,
            updated_at: parse_ts(&updated_at)?,
            halt_reason,
            quota_sends: decode_sends(&sends)?,
            records,
        }))
    }

    /// All runs, newest first.
    pub fn list_runs(&self) -> Result<Vec<RunInfo>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT r.run_id, r.phase, r.started_at, r.updated_at, r.total,
                    (SELECT COUNT(*) FROM run_recipients x WHERE x.run_id = r.run_id AND x.status = 'SENT'),
                    (SELECT COUNT(*) FROM run_recipients x WHERE x.run_id = r.run_id AND x.status = 'FAILED'),
                    (SELECT COUNT(*) FROM run_recipients x WHERE x.run_id = r.run_id
                        AND x.status IN ('PENDING', 'IN_PROGRESS'))
                 FROM runs r ORDER BY r.started_at DESC",
            )
            .map_err(db_err("Prepare"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })
            .map_err(db_err("List runs"))?;

        let mut runs = Vec::new();
        for row in rows {
            let (run_id, phase, started_at, updated_at, total, sent, failed, remaining) =
                row.map_err(db_err("Read run"))?;
            runs.push(RunInfo {
                phase: RunPhase::parse(&phase).unwrap_or(RunPhase::Error),
                run_id,
                started_at: parse_ts(&started_at)?,
                updated_at: parse_ts(&updated_at)?,
                total: total as usize,
                sent: sent as usize,
                failed: failed as usize,
                remaining: remaining as usize,
            });
        }
        Ok(runs)
    }
}

fn write_recipient(
    conn: &rusqlite::Connection,
    run_id: &str,
    position: usize,
    r: &Recipient,
) -> Result<()> {
    let (customer_id, protocol) = match &r.document {
        Some(doc) => (Some(doc.customer_id.as_str()), doc.protocol.as_deref()),
        None => (None, None),
    };
    conn.execute(
        "INSERT OR REPLACE INTO run_recipients
         (run_id, position, id, name, amount_cents, due_date, customer_id, protocol, status,
          attempts, last_attempt_at, last_error, next_retry_at, note)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        rusqlite::params![
            run_id,
            position as i64,
            r.id,
            r.name,
            r.amount_cents as i64,
            r.due_date.format("%Y-%m-%d").to_string(),
            customer_id,
            protocol,
            r.status.as_str(),
            r.attempts,
            r.last_attempt_at.map(|t| t.to_rfc3339()),
            r.last_error,
            r.next_retry_at.map(|t| t.to_rfc3339()),
            r.note,
        ],
    )
    .map_err(db_err("Save recipient"))?;
    Ok(())
}

fn into_recipient(row: RecipientRow) -> Result<Recipient> {
    let status = DeliveryStatus::parse(&row.status)
        .ok_or_else(|| DunningError::Persistence(format!("unknown status {}", row.status)))?;
    let due_date = NaiveDate::parse_from_str(&row.due_date, "%Y-%m-%d")
        .map_err(|e| DunningError::Persistence(format!("due_date {}: {e}", row.due_date)))?;
    Ok(Recipient {
        id: row.id,
        name: row.name,
        amount_cents: row.amount_cents.max(0) as u64,
        due_date,
        document: row.customer_id.map(|customer_id| DocumentRef {
            customer_id,
            protocol: row.protocol,
        }),
        status,
        attempts: row.attempts,
        last_attempt_at: row.last_attempt_at.as_deref().map(parse_ts).transpose()?,
        last_error: row.last_error,
        next_retry_at: row.next_retry_at.as_deref().map(parse_ts).transpose()?,
        note: row.note,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| DunningError::Persistence(format!("timestamp {s}: {e}")))
}

fn encode_sends(sends: &[DateTime<Utc>]) -> Result<String> {
    let raw: Vec<String> = sends.iter().map(|t| t.to_rfc3339()).collect();
    Ok(serde_json::to_string(&raw)?)
}

fn decode_sends(s: &str) -> Result<Vec<DateTime<Utc>>> {
    let raw: Vec<String> = serde_json::from_str(s)?;
    raw.iter().map(|t| parse_ts(t)).collect()
}
