//! Recipient ingestion — JSON rows to validated `Recipient`s.
//!
//! Bad rows are reported, not fatal. Duplicates pass through untouched; the
//! store marks them at load.

use std::path::Path;

use chrono::NaiveDate;
use dunning_core::error::Result;
use serde::{Deserialize, Serialize};

use crate::recipient::{Recipient, normalize_phone};

/// A JSON scalar that may arrive quoted or bare (`"5511..."` or `5511...`).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Number(serde_json::Number),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Text(s) => s.trim().to_string(),
            Scalar::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    phone: Option<Scalar>,
    name: Option<String>,
    amount: Option<Scalar>,
    due_date: Option<String>,
    customer_id: Option<Scalar>,
    protocol: Option<String>,
}

/// A row that did not make it into the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// 1-based position in the input array.
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub accepted: Vec<Recipient>,
    pub rejected: Vec<Rejection>,
}

/// Read a JSON array of recipient rows from disk.
pub fn load_json(path: &Path) -> Result<IngestReport> {
    let raw = std::fs::read_to_string(path)?;
    let report = parse_records(&raw)?;
    tracing::info!(
        "📥 {}: {} accepted, {} rejected",
        path.display(),
        report.accepted.len(),
        report.rejected.len()
    );
    for r in &report.rejected {
        tracing::warn!("📥 Row {} rejected: {}", r.row, r.reason);
    }
    Ok(report)
}

/// Parse a JSON array of recipient rows.
pub fn parse_records(raw: &str) -> Result<IngestReport> {
    let rows: Vec<serde_json::Value> = serde_json::from_str(raw)?;
    let mut report = IngestReport::default();

    for (i, value) in rows.into_iter().enumerate() {
        let row = i + 1;
        let parsed = serde_json::from_value::<RawRecord>(value)
            .map_err(|e| e.to_string())
            .and_then(validate);
        match parsed {
            Ok(recipient) => report.accepted.push(recipient),
            Err(reason) => report.rejected.push(Rejection { row, reason }),
        }
    }
    Ok(report)
}

fn validate(raw: RawRecord) -> std::result::Result<Recipient, String> {
    let phone = raw.phone.map(Scalar::into_string).ok_or("missing phone")?;
    let id = normalize_phone(&phone).ok_or_else(|| format!("malformed phone '{phone}'"))?;

    let name = raw
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or("missing name")?;

    let amount = raw.amount.ok_or("missing amount")?;
    let amount_cents = parse_amount_cents(&amount)?;

    let due = raw.due_date.ok_or("missing due_date")?;
    let due_date = parse_due_date(&due).ok_or_else(|| format!("unparseable due_date '{due}'"))?;

    let mut recipient = Recipient::new(&id, &name, amount_cents, due_date);
    if let Some(customer_id) = raw.customer_id.map(Scalar::into_string).filter(|c| !c.is_empty()) {
        let protocol = raw.protocol.as_deref().map(str::trim).filter(|p| !p.is_empty());
        recipient = recipient.with_document(&customer_id, protocol);
    }
    Ok(recipient)
}

/// Amounts arrive as numbers (`150.5`) or strings (`"1.234,56"`, `"150.50"`).
fn parse_amount_cents(amount: &Scalar) -> std::result::Result<u64, String> {
    let value = match amount {
        Scalar::Number(n) => n.as_f64(),
        Scalar::Text(s) => {
            let s = s.trim().trim_start_matches("R$").trim();
            let normalized = if s.contains(',') {
                s.replace('.', "").replace(',', ".")
            } else {
                s.to_string()
            };
            normalized.parse::<f64>().ok()
        }
    }
    .ok_or_else(|| "unparseable amount".to_string())?;

    if !value.is_finite() || value <= 0.0 {
        return Err(format!("amount must be positive, got {value}"));
    }
    Ok((value * 100.0).round() as u64)
}

fn parse_due_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%d/%m/%Y"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dunning_core::error::DunningError;

    #[test]
    fn test_parse_valid_rows() {
        let raw = r#"[
            {"phone": "+55 (11) 98765-4321", "name": "Maria", "amount": 150.0,
             "due_date": "2026-11-05", "customer_id": 991, "protocol": "PROT-1"},
            {"phone": 5521912345678, "name": "João", "amount": "1.234,56",
             "due_date": "10/12/2026"}
        ]"#;
        let report = parse_records(raw).unwrap();
        assert!(report.rejected.is_empty());
        assert_eq!(report.accepted.len(), 2);

        let maria = &report.accepted[0];
        assert_eq!(maria.id, "5511987654321");
        assert_eq!(maria.amount_cents, 15_000);
        let doc = maria.document.as_ref().unwrap();
        assert_eq!(doc.customer_id, "991");
        assert_eq!(doc.protocol.as_deref(), Some("PROT-1"));

        let joao = &report.accepted[1];
        assert_eq!(joao.amount_cents, 123_456);
        assert_eq!(joao.due_date, NaiveDate::from_ymd_opt(2026, 12, 10).unwrap());
        assert!(joao.document.is_none());
    }

    #[test]
    fn test_bad_rows_rejected_with_position() {
        let raw = r#"[
            {"phone": "123", "name": "A", "amount": 10, "due_date": "2026-01-01"},
            {"phone": "5511987654321", "name": "B", "amount": 0, "due_date": "2026-01-01"},
            {"phone": "5511987654322", "name": "C", "amount": 10, "due_date": "amanhã"},
            {"phone": "5511987654323", "amount": 10, "due_date": "2026-01-01"},
            "not an object",
            {"phone": "5511987654324", "name": "E", "amount": 10, "due_date": "2026-01-01"}
        ]"#;
        let report = parse_records(raw).unwrap();
        assert_eq!(report.accepted.len(), 1);
        let rows: Vec<usize> = report.rejected.iter().map(|r| r.row).collect();
        assert_eq!(rows, vec![1, 2, 3, 4, 5]);
        assert!(report.rejected[0].reason.contains("malformed phone"));
        assert!(report.rejected[1].reason.contains("positive"));
        assert!(report.rejected[3].reason.contains("name"));
    }

    #[test]
    fn test_duplicates_pass_through() {
        let raw = r#"[
            {"phone": "5511987654321", "name": "A", "amount": 10, "due_date": "2026-01-01"},
            {"phone": "+5511987654321", "name": "A", "amount": 10, "due_date": "2026-01-01"}
        ]"#;
        assert_eq!(parse_records(raw).unwrap().accepted.len(), 2);
    }

    #[test]
    fn test_not_an_array() {
        assert!(matches!(parse_records("{}"), Err(DunningError::Json(_))));
    }

    #[test]
    fn test_load_json_file() {
        let dir = std::env::temp_dir().join("dunning-ingest-test");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("recipients.json");
        std::fs::write(
            &path,
            r#"[{"phone": "5511987654321", "name": "A", "amount": 10, "due_date": "2026-01-01"}]"#,
        )
        .unwrap();
        let report = load_json(&path).unwrap();
        assert_eq!(report.accepted.len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }
}
