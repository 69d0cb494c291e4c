//! Record-level CRUD with change capture
//!
//! Every mutation runs in one [`WriteTransaction`]: the statement and its
//! change-log entry commit together or not at all. Records are identified by
//! a TEXT `id` column; inserts without an id get a UUID so both stores agree
//! on it.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::Backend;
use crate::changelog::{ChangeDetails, ChangeLogEntry, CHANGE_LOG_COLUMNS};
use crate::error::{DuosyncError, Result};
use crate::manager::{DatabaseManager, WriteTransaction};
use crate::value::{Record, Value};

/// Identifier column of every replicated table
pub const ID_COLUMN: &str = "id";

/// Plain SQL identifier; anything else is rejected before interpolation
static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("invalid identifier regex"));

pub fn validate_identifier(name: &str) -> Result<&str> {
    if IDENTIFIER_RE.is_match(name) {
        Ok(name)
    } else {
        Err(DuosyncError::InvalidIdentifier(name.to_string()))
    }
}

/// Who is acting and where writes go
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    /// Recorded in the change log
    pub user_id: Option<String>,
    /// Skip the cloud replica
    pub local_only: bool,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }
}

/// Condition on one column
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(Value),
    In(Vec<Value>),
    IsNull,
}

impl From<Value> for Filter {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Filter::IsNull,
            other => Filter::Eq(other),
        }
    }
}

impl From<Vec<Value>> for Filter {
    fn from(values: Vec<Value>) -> Self {
        Filter::In(values)
    }
}

impl From<&str> for Filter {
    fn from(value: &str) -> Self {
        Filter::Eq(Value::from(value))
    }
}

impl From<i64> for Filter {
    fn from(value: i64) -> Self {
        Filter::Eq(Value::Int(value))
    }
}

/// Column → condition, combined with AND
pub type Conditions = BTreeMap<String, Filter>;

/// Render `WHERE ...` for `conditions`; empty conditions render nothing.
pub fn build_where(conditions: &Conditions) -> Result<(String, Vec<Value>)> {
    if conditions.is_empty() {
        return Ok((String::new(), Vec::new()));
    }

    let mut clauses = Vec::with_capacity(conditions.len());
    let mut params = Vec::new();

    for (column, filter) in conditions {
        let column = validate_identifier(column)?;
        match filter {
            Filter::IsNull | Filter::Eq(Value::Null) => clauses.push(format!("{} IS NULL", column)),
            Filter::Eq(value) => {
                clauses.push(format!("{} = ?", column));
                params.push(value.clone());
            }
            Filter::In(values) if values.is_empty() => clauses.push("1 = 0".to_string()),
            Filter::In(values) => {
                let marks = vec!["?"; values.len()].join(", ");
                clauses.push(format!("{} IN ({})", column, marks));
                params.extend(values.iter().cloned());
            }
        }
    }

    Ok((format!(" WHERE {}", clauses.join(" AND ")), params))
}

/// Validate `col [ASC|DESC], ...` and return it normalised
pub fn build_order_by(order_by: &str) -> Result<String> {
    let mut terms = Vec::new();
    for term in order_by.split(',') {
        let mut words = term.split_whitespace();
        let column = words
            .next()
            .ok_or_else(|| DuosyncError::InvalidIdentifier(order_by.to_string()))?;
        validate_identifier(column)?;

        let direction = match words.next().map(str::to_ascii_uppercase).as_deref() {
            None => None,
            Some("ASC") => Some("ASC"),
            Some("DESC") => Some("DESC"),
            Some(_) => return Err(DuosyncError::InvalidIdentifier(term.trim().to_string())),
        };
        if words.next().is_some() {
            return Err(DuosyncError::InvalidIdentifier(term.trim().to_string()));
        }

        terms.push(match direction {
            Some(dir) => format!("{} {}", column, dir),
            None => column.to_string(),
        });
    }
    Ok(terms.join(", "))
}

fn insert_statement(table: &str, fields: &Record) -> Result<(String, Vec<Value>)> {
    let columns = fields
        .keys()
        .map(|c| validate_identifier(c))
        .collect::<Result<Vec<_>>>()?;
    let marks = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
        table,
        columns.join(", "),
        marks
    );
    Ok((sql, fields.values().cloned().collect()))
}

/// Declared column types of a table, by column name
pub(crate) type ColumnTypes = BTreeMap<String, String>;

/// Column types of `table` on a Postgres store; empty elsewhere.
///
/// Replayed rows carry whatever the other store decoded, e.g. timestamps and
/// JSON as text and booleans as integers, so each value is cast to its column.
pub(crate) async fn column_types(tx: &mut WriteTransaction<'_>, table: &str) -> Result<ColumnTypes> {
    if tx.backend() != Some(Backend::Postgres) {
        return Ok(ColumnTypes::new());
    }
    let rows = tx
        .read(
            "SELECT a.attname::text AS column_name, format_type(a.atttypid, a.atttypmod) AS column_type \
             FROM pg_attribute a \
             WHERE a.attrelid = to_regclass(?) AND a.attnum > 0 AND NOT a.attisdropped",
            &[Value::from(validate_identifier(table)?)],
        )
        .await?;
    rows.iter()
        .map(|row| Ok::<_, DuosyncError>((row.text("column_name")?, row.text("column_type")?)))
        .collect()
}

/// Insert-or-replace of a full row keyed by `id`.
///
/// Columns named in `types` get `CAST(? AS <type>)` with the value bound as text.
pub(crate) fn upsert_statement(
    table: &str,
    row: &Record,
    types: &ColumnTypes,
) -> Result<(String, Vec<Value>)> {
    validate_identifier(table)?;
    if row.get(ID_COLUMN).map_or(true, Value::is_null) {
        return Err(DuosyncError::invalid_value(table, "row has no id"));
    }

    let columns = row
        .keys()
        .map(|c| validate_identifier(c))
        .collect::<Result<Vec<_>>>()?;
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| **c != ID_COLUMN)
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();
    let on_conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    let mut placeholders = Vec::with_capacity(columns.len());
    let mut params = Vec::with_capacity(columns.len());
    for (column, value) in row {
        match types.get(column) {
            Some(ty) => {
                placeholders.push(format!("CAST(? AS {})", ty));
                params.push(value.to_key().map_or(Value::Null, Value::Text));
            }
            None => {
                placeholders.push("?".to_string());
                params.push(value.clone());
            }
        }
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        table,
        columns.join(", "),
        placeholders.join(", "),
        ID_COLUMN,
        on_conflict
    );
    Ok((sql, params))
}

pub(crate) fn delete_statement(table: &str) -> Result<String> {
    Ok(format!(
        "DELETE FROM {} WHERE {} = ?",
        validate_identifier(table)?,
        ID_COLUMN
    ))
}

async fn fetch_current(tx: &mut WriteTransaction<'_>, table: &str, record_id: &str) -> Result<Record> {
    let sql = format!("SELECT * FROM {} WHERE {} = ?", table, ID_COLUMN);
    tx.read(&sql, &[Value::from(record_id)])
        .await?
        .into_iter()
        .next()
        .map(|row| row.into_record())
        .ok_or_else(|| DuosyncError::not_found(table, record_id))
}

async fn append_change(tx: &mut WriteTransaction<'_>, entry: &ChangeLogEntry) -> Result<()> {
    tx.execute(&ChangeLogEntry::insert_sql(), &entry.insert_params()?)
        .await?;
    Ok(())
}

async fn insert_one(
    tx: &mut WriteTransaction<'_>,
    ctx: &OperationContext,
    table: &str,
    mut fields: Record,
) -> Result<String> {
    if fields.get(ID_COLUMN).map_or(true, Value::is_null) {
        fields.insert(ID_COLUMN.to_string(), Value::Text(Uuid::new_v4().to_string()));
    }

    let (sql, params) = insert_statement(table, &fields)?;
    let inserted = tx
        .fetch_all(&sql, &params)
        .await?
        .into_iter()
        .next()
        .map(|row| row.into_record())
        .ok_or_else(|| DuosyncError::invalid_value(table, "insert returned no row"))?;

    let record_id = inserted
        .get(ID_COLUMN)
        .and_then(Value::to_key)
        .ok_or_else(|| DuosyncError::invalid_value(table, "insert returned no id"))?;

    let entry = ChangeLogEntry::new(
        table,
        &record_id,
        ChangeDetails::Insert { new: inserted },
        ctx.user_id.as_deref(),
    );
    append_change(tx, &entry).await?;
    Ok(record_id)
}

/// Commit on success, roll back and wrap the error otherwise
async fn finish<T>(tx: WriteTransaction<'_>, result: Result<T>, context: String) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback failed after {}", context);
            }
            match err {
                DuosyncError::NotFound { .. }
                | DuosyncError::InvalidIdentifier(_)
                | DuosyncError::InvalidValue { .. } => Err(err),
                other => Err(DuosyncError::transaction_failed(context, other)),
            }
        }
    }
}

/// Insert one record and return its id
pub async fn insert_record(
    db: &DatabaseManager,
    ctx: &OperationContext,
    table: &str,
    fields: Record,
) -> Result<String> {
    validate_identifier(table)?;
    let mut tx = db.begin_write(ctx.local_only).await?;
    let result = insert_one(&mut tx, ctx, table, fields).await;
    let record_id = finish(tx, result, format!("insert into {}", table)).await?;

    debug!(table, record_id = %record_id, "inserted record");
    Ok(record_id)
}

/// Insert every record in one transaction; all or nothing
pub async fn bulk_insert(
    db: &DatabaseManager,
    ctx: &OperationContext,
    table: &str,
    records: Vec<Record>,
) -> Result<Vec<String>> {
    validate_identifier(table)?;
    if records.is_empty() {
        return Ok(Vec::new());
    }

    let count = records.len();
    let mut tx = db.begin_write(ctx.local_only).await?;
    let result = async {
        let mut ids = Vec::with_capacity(count);
        for record in records {
            ids.push(insert_one(&mut tx, ctx, table, record).await?);
        }
        Ok::<_, DuosyncError>(ids)
    }
    .await;
    let ids = finish(tx, result, format!("bulk insert into {}", table)).await?;

    debug!(table, count, "bulk inserted records");
    Ok(ids)
}

pub async fn update_record(
    db: &DatabaseManager,
    ctx: &OperationContext,
    table: &str,
    record_id: &str,
    mut fields: Record,
) -> Result<()> {
    validate_identifier(table)?;
    if let Some(id) = fields.remove(ID_COLUMN) {
        if id.to_key().as_deref() != Some(record_id) {
            return Err(DuosyncError::invalid_value(table, "the id column cannot be changed"));
        }
    }
    if fields.is_empty() {
        return Err(DuosyncError::invalid_value(table, "update has no fields"));
    }
    let assignments = fields
        .keys()
        .map(|c| validate_identifier(c).map(|c| format!("{} = ?", c)))
        .collect::<Result<Vec<_>>>()?;

    let mut tx = db.begin_write(ctx.local_only).await?;
    let result = async {
        let old = fetch_current(&mut tx, table, record_id).await?;

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            table,
            assignments.join(", "),
            ID_COLUMN
        );
        let mut params: Vec<Value> = fields.values().cloned().collect();
        params.push(Value::from(record_id));
        tx.execute(&sql, &params).await?;

        let entry = ChangeLogEntry::new(
            table,
            record_id,
            ChangeDetails::Update { old, new: fields },
            ctx.user_id.as_deref(),
        );
        append_change(&mut tx, &entry).await
    }
    .await;
    finish(tx, result, format!("update {}", table)).await?;

    debug!(table, record_id, "updated record");
    Ok(())
}

pub async fn delete_record(
    db: &DatabaseManager,
    ctx: &OperationContext,
    table: &str,
    record_id: &str,
) -> Result<()> {
    validate_identifier(table)?;

    let mut tx = db.begin_write(ctx.local_only).await?;
    let result = async {
        let old = fetch_current(&mut tx, table, record_id).await?;
        tx.execute(&delete_statement(table)?, &[Value::from(record_id)])
            .await?;

        let entry = ChangeLogEntry::new(
            table,
            record_id,
            ChangeDetails::Delete { old },
            ctx.user_id.as_deref(),
        );
        append_change(&mut tx, &entry).await
    }
    .await;
    finish(tx, result, format!("delete from {}", table)).await?;

    debug!(table, record_id, "deleted record");
    Ok(())
}

pub async fn get_record(db: &DatabaseManager, table: &str, record_id: &str) -> Result<Option<Record>> {
    let sql = format!(
        "SELECT * FROM {} WHERE {} = ? LIMIT 1",
        validate_identifier(table)?,
        ID_COLUMN
    );
    let rows = db
        .execute_query(&sql, &[Value::from(record_id)], false, false)
        .await?;
    Ok(rows.into_iter().next().map(|row| row.into_record()))
}

pub async fn query_records(
    db: &DatabaseManager,
    table: &str,
    conditions: &Conditions,
    order_by: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<Record>> {
    let (where_clause, params) = build_where(conditions)?;
    let mut sql = format!("SELECT * FROM {}{}", validate_identifier(table)?, where_clause);
    if let Some(order_by) = order_by {
        sql.push_str(" ORDER BY ");
        sql.push_str(&build_order_by(order_by)?);
    }
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    let rows = db.execute_query(&sql, &params, false, false).await?;
    Ok(rows.into_iter().map(|row| row.into_record()).collect())
}

/// Change history of one record on the local store, oldest first
pub async fn get_change_log(
    db: &DatabaseManager,
    table: &str,
    record_id: &str,
) -> Result<Vec<ChangeLogEntry>> {
    let sql = format!(
        "SELECT {} FROM change_log WHERE table_name = ? AND record_id = ? ORDER BY changed_at, id",
        CHANGE_LOG_COLUMNS
    );
    let rows = db
        .execute_query(
            &sql,
            &[Value::from(validate_identifier(table)?), Value::from(record_id)],
            false,
            false,
        )
        .await?;
    rows.iter().map(ChangeLogEntry::from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("test_table").is_ok());
        assert!(validate_identifier("_x9").is_ok());
        assert!(validate_identifier("9lives").is_err());
        assert!(validate_identifier("t; DROP TABLE x").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_where_clause_null_in_and_eq() {
        let mut conditions = Conditions::new();
        conditions.insert("name".into(), "Test".into());
        conditions.insert("deleted_at".into(), Filter::from(Value::Null));
        conditions.insert("status".into(), Filter::from(vec![Value::from("a"), Value::from("b")]));

        let (sql, params) = build_where(&conditions).unwrap();
        assert_eq!(sql, " WHERE deleted_at IS NULL AND name = ? AND status IN (?, ?)");
        assert_eq!(params, vec![Value::from("Test"), Value::from("a"), Value::from("b")]);
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let mut conditions = Conditions::new();
        conditions.insert("id".into(), Filter::In(Vec::new()));
        let (sql, params) = build_where(&conditions).unwrap();
        assert_eq!(sql, " WHERE 1 = 0");
        assert!(params.is_empty());
    }

    #[test]
    fn test_order_by_validation() {
        assert_eq!(build_order_by("name desc, id").unwrap(), "name DESC, id");
        assert!(build_order_by("name; DROP").is_err());
        assert!(build_order_by("name sideways").is_err());
        assert!(build_order_by("").is_err());
    }

    #[test]
    fn test_upsert_statement() {
        let mut row = Record::new();
        row.insert("id".into(), "r1".into());
        row.insert("value".into(), 42.into());

        let (sql, params) = upsert_statement("t", &row, &ColumnTypes::new()).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO t (id, value) VALUES (?, ?) ON CONFLICT (id) DO UPDATE SET value = excluded.value"
        );
        assert_eq!(params.len(), 2);

        row.remove("id");
        assert!(upsert_statement("t", &row, &ColumnTypes::new()).is_err());
    }

    #[test]
    fn test_upsert_statement_casts_typed_columns() {
        let when = chrono::DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let mut row = Record::new();
        row.insert("id".into(), "r1".into());
        row.insert("active".into(), 1.into());
        row.insert("seen_at".into(), Value::Timestamp(when));
        row.insert("note".into(), Value::Null);

        let mut types = ColumnTypes::new();
        types.insert("active".into(), "boolean".into());
        types.insert("seen_at".into(), "timestamp with time zone".into());
        types.insert("note".into(), "jsonb".into());

        let (sql, params) = upsert_statement("t", &row, &types).unwrap();
        assert!(sql.starts_with(
            "INSERT INTO t (active, id, note, seen_at) VALUES (CAST(? AS boolean), ?, CAST(? AS jsonb), CAST(? AS timestamp with time zone))"
        ));
        assert_eq!(
            params,
            vec![
                Value::from("1"),
                Value::from("r1"),
                Value::Null,
                Value::Text(crate::value::format_timestamp(&when)),
            ]
        );
    }
}
