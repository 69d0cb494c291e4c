//! Change log and sync status records
//!
//! `change_log` is append-only: every successful mutation adds one entry on
//! each store it reached, and the sync engine copies entries across so both
//! logs converge. `sync_status` is the audit trail of sync runs and the home
//! of the per-table watermark.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DuosyncError, Result};
use crate::value::{now, Record, Row, Value};

/// Kind of mutation recorded in the change log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    /// Tiebreak rank when timestamps cannot order two changes: DELETE > UPDATE > INSERT
    pub fn severity(&self) -> u8 {
        match self {
            Operation::Insert => 1,
            Operation::Update => 2,
            Operation::Delete => 3,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = DuosyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Operation::Insert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(DuosyncError::invalid_value(
                "change_log.operation",
                format!("unknown operation '{}'", other),
            )),
        }
    }
}

/// Field values captured with a change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeDetails {
    Insert { new: Record },
    Update { old: Record, new: Record },
    Delete { old: Record },
}

impl ChangeDetails {
    pub fn operation(&self) -> Operation {
        match self {
            ChangeDetails::Insert { .. } => Operation::Insert,
            ChangeDetails::Update { .. } => Operation::Update,
            ChangeDetails::Delete { .. } => Operation::Delete,
        }
    }

    /// Full row state after the change, or `None` when the row is gone.
    ///
    /// Updates capture the complete prior row, so `old` overlaid with `new`
    /// is the complete row afterwards.
    pub fn resulting_row(&self) -> Option<Record> {
        match self {
            ChangeDetails::Insert { new } => Some(new.clone()),
            ChangeDetails::Update { old, new } => {
                let mut row = old.clone();
                row.extend(new.iter().map(|(k, v)| (k.clone(), v.clone())));
                Some(row)
            }
            ChangeDetails::Delete { .. } => None,
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| DuosyncError::json("change details", e))
    }
}

/// One row of `change_log`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeLogEntry {
    /// Identical on both stores; used to recognise replicated changes
    pub change_id: String,
    pub table_name: String,
    pub operation: Operation,
    pub record_id: String,
    pub changed_at: DateTime<Utc>,
    pub user_id: Option<String>,
    pub details: Option<ChangeDetails>,
}

pub(crate) const CHANGE_LOG_COLUMNS: &str =
    "change_id, table_name, operation, record_id, changed_at, user_id, details";

impl ChangeLogEntry {
    pub fn new(
        table_name: impl Into<String>,
        record_id: impl Into<String>,
        details: ChangeDetails,
        user_id: Option<&str>,
    ) -> Self {
        Self {
            change_id: Uuid::new_v4().to_string(),
            table_name: table_name.into(),
            operation: details.operation(),
            record_id: record_id.into(),
            changed_at: now(),
            user_id: user_id.map(str::to_string),
            details: Some(details),
        }
    }

    /// Insert statement; duplicates by `change_id` are skipped so copying
    /// an entry twice is harmless.
    pub fn insert_sql() -> String {
        format!(
            "INSERT INTO change_log ({}) VALUES (?, ?, ?, ?, ?, ?, ?) ON CONFLICT (change_id) DO NOTHING",
            CHANGE_LOG_COLUMNS
        )
    }

    pub fn insert_params(&self) -> Result<Vec<Value>> {
        let details = match &self.details {
            Some(details) => Value::Json(details.to_json()?),
            None => Value::Null,
        };
        Ok(vec![
            Value::from(self.change_id.as_str()),
            Value::from(self.table_name.as_str()),
            Value::from(self.operation.as_str()),
            Value::from(self.record_id.as_str()),
            Value::Timestamp(self.changed_at),
            Value::from(self.user_id.clone()),
            details,
        ])
    }

    /// Decode a row selected with [`CHANGE_LOG_COLUMNS`] from either store
    pub fn from_row(row: &Row) -> Result<Self> {
        let changed_at = row
            .get("changed_at")
            .and_then(Value::as_timestamp)
            .ok_or_else(|| DuosyncError::invalid_value("change_log.changed_at", "missing or unparseable"))?;

        let details = match json_column(row, "details")? {
            Some(json) => Some(
                serde_json::from_value(json)
                    .map_err(|e| DuosyncError::json("change_log.details", e))?,
            ),
            None => None,
        };

        Ok(Self {
            change_id: row.text("change_id")?,
            table_name: row.text("table_name")?,
            operation: row.text("operation")?.parse()?,
            record_id: row.text("record_id")?,
            changed_at,
            user_id: row.get("user_id").and_then(Value::to_key),
            details,
        })
    }
}

/// Outcome recorded in `sync_status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Completed,
    Failed,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Conflict => "conflict",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = DuosyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            "conflict" => Ok(SyncStatus::Conflict),
            other => Err(DuosyncError::invalid_value(
                "sync_status.status",
                format!("unknown status '{}'", other),
            )),
        }
    }
}

/// One row of `sync_status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatusEntry {
    pub status: SyncStatus,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

pub(crate) const SYNC_STATUS_COLUMNS: &str = "status, message, details, created_at";

impl SyncStatusEntry {
    pub fn new(status: SyncStatus, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            status,
            message: message.into(),
            details: Some(details),
            created_at: now(),
        }
    }

    pub fn insert_sql() -> String {
        format!(
            "INSERT INTO sync_status ({}) VALUES (?, ?, ?, ?)",
            SYNC_STATUS_COLUMNS
        )
    }

    pub fn insert_params(&self) -> Vec<Value> {
        vec![
            Value::from(self.status.as_str()),
            Value::from(self.message.as_str()),
            Value::from(self.details.clone()),
            Value::Timestamp(self.created_at),
        ]
    }

    pub fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            status: row.text("status")?.parse()?,
            message: row.get("message").and_then(Value::to_key).unwrap_or_default(),
            details: json_column(row, "details")?,
            created_at: row
                .get("created_at")
                .and_then(Value::as_timestamp)
                .ok_or_else(|| DuosyncError::invalid_value("sync_status.created_at", "missing or unparseable"))?,
        })
    }
}

/// JSON columns arrive as text from SQLite and as JSON from Postgres
fn json_column(row: &Row, column: &str) -> Result<Option<serde_json::Value>> {
    match row.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Json(json)) => Ok(Some(json.clone())),
        Some(Value::Text(text)) => serde_json::from_str(text)
            .map(Some)
            .map_err(|e| DuosyncError::json(column, e)),
        Some(other) => Err(DuosyncError::invalid_value(
            column,
            format!("expected JSON, got {}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_details_are_tagged_by_kind() {
        let details = ChangeDetails::Update {
            old: record(&[("id", "a".into()), ("value", 1.into())]),
            new: record(&[("value", 2.into())]),
        };

        let json = details.to_json().unwrap();
        assert_eq!(json["kind"], "update");
        assert_eq!(json["old"]["value"], 1);
        assert_eq!(json["new"]["value"], 2);
    }

    #[test]
    fn test_resulting_row_overlays_update() {
        let details = ChangeDetails::Update {
            old: record(&[("id", "a".into()), ("name", "x".into()), ("value", 1.into())]),
            new: record(&[("value", 2.into())]),
        };
        let row = details.resulting_row().unwrap();

        assert_eq!(row["name"], Value::from("x"));
        assert_eq!(row["value"], Value::Int(2));
        assert!(ChangeDetails::Delete { old: row }.resulting_row().is_none());
    }

    #[test]
    fn test_entry_from_sqlite_row() {
        let row = Row::new(
            CHANGE_LOG_COLUMNS.split(", ").map(String::from).collect(),
            vec![
                "c-1".into(),
                "test_table".into(),
                "DELETE".into(),
                "r-1".into(),
                "2024-05-01T10:00:00.000001Z".into(),
                Value::Null,
                json!({"kind": "delete", "old": {"id": "r-1"}}).to_string().into(),
            ],
        );

        let entry = ChangeLogEntry::from_row(&row).unwrap();
        assert_eq!(entry.operation, Operation::Delete);
        assert_eq!(entry.user_id, None);
        assert!(matches!(entry.details, Some(ChangeDetails::Delete { .. })));
        assert_eq!(entry.changed_at.timestamp_subsec_micros(), 1);
    }

    #[test]
    fn test_severity_order() {
        assert!(Operation::Delete.severity() > Operation::Update.severity());
        assert!(Operation::Update.severity() > Operation::Insert.severity());
        assert_eq!("update".parse::<Operation>().unwrap(), Operation::Update);
        assert!("UPSERT".parse::<Operation>().is_err());
    }
}
