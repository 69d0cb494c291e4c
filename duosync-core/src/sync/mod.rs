//! Change-log driven reconciliation between the local store and the cloud
//!
//! # Per-table run
//!
//! 1. Read the watermark: the newest `completed` sync status for the table.
//! 2. Collect change-log entries at or after it from both stores.
//! 3. Drop entries present on both sides (same `change_id`).
//! 4. Records touched on both sides are conflicts; the policy picks a winner.
//! 5. Copy missing log entries onto the side that lacks them, so the next
//!    run sees both logs as equal, and bring each affected record to the
//!    newest state either log holds for it (the winner's, for conflicts).
//! 6. Record the outcome and the new watermark in `sync_status`.
//!
//! Unresolved conflicts hold the watermark at their earliest change, so they
//! are examined again on every run until someone resolves them.

pub mod conflict;
pub mod worker;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::changelog::{
    ChangeLogEntry, Operation, SyncStatus, SyncStatusEntry, CHANGE_LOG_COLUMNS, SYNC_STATUS_COLUMNS,
};
use crate::config::SyncConfig;
use crate::error::{DuosyncError, Result};
use crate::manager::{DatabaseManager, Target, WriteTransaction};
use crate::operations::{
    column_types, delete_statement, upsert_statement, validate_identifier, ColumnTypes, ID_COLUMN,
};
use crate::value::{format_timestamp, parse_timestamp, Value};

pub use conflict::{
    detect_conflicts, resolve_conflicts, Conflict, ConflictPolicy, ConflictPolicyKind, LastWriteWins,
    Manual, PreferLocal, PreferRemote, Resolution, ResolvedConflict,
};
pub use worker::SyncWorker;

/// Detailed outcome of one table's sync
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub table: String,
    pub since: Option<DateTime<Utc>>,
    pub watermark: Option<DateTime<Utc>>,
    /// Changes replayed onto the cloud
    pub pushed: usize,
    /// Changes replayed onto the local store
    pub pulled: usize,
    pub conflicts: usize,
    pub unresolved: usize,
}

impl SyncReport {
    pub fn applied(&self) -> usize {
        self.pushed + self.pulled
    }
}

/// Per-table summary returned by [`SyncEngine::sync_all_tables`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableSyncResult {
    pub applied: usize,
    pub conflicts: usize,
    pub error: Option<String>,
}

impl From<&SyncReport> for TableSyncResult {
    fn from(report: &SyncReport) -> Self {
        Self {
            applied: report.applied(),
            conflicts: report.conflicts,
            error: None,
        }
    }
}

/// A change bound for one store; `replay` is false when only the log entry
/// is copied (the losing side of a resolved conflict).
struct Pending {
    entry: ChangeLogEntry,
    replay: bool,
}

/// Newest entry per record, ties going to the later one in `entries`
fn latest_by_record<'a>(
    entries: impl IntoIterator<Item = &'a ChangeLogEntry>,
) -> HashMap<String, ChangeLogEntry> {
    let mut latest: HashMap<String, ChangeLogEntry> = HashMap::new();
    for entry in entries {
        match latest.get(&entry.record_id) {
            Some(seen) if seen.changed_at > entry.changed_at => {}
            _ => {
                latest.insert(entry.record_id.clone(), entry.clone());
            }
        }
    }
    latest
}

/// The state to leave each replayed record in, in first-seen order.
/// `chosen` overrides `latest` for conflicted records.
fn replay_states(
    pending: &[Pending],
    latest: &HashMap<String, ChangeLogEntry>,
    chosen: &HashMap<String, ChangeLogEntry>,
) -> Vec<ChangeLogEntry> {
    let mut seen = HashSet::new();
    let mut states = Vec::new();
    for item in pending.iter().filter(|p| p.replay) {
        let record_id = &item.entry.record_id;
        if !seen.insert(record_id.clone()) {
            continue;
        }
        let state = chosen
            .get(record_id)
            .or_else(|| latest.get(record_id))
            .unwrap_or(&item.entry);
        states.push(state.clone());
    }
    states
}

pub struct SyncEngine {
    db: Arc<DatabaseManager>,
    policy: Arc<dyn ConflictPolicy>,
    tracked_tables: Vec<String>,
}

impl SyncEngine {
    pub fn new(db: Arc<DatabaseManager>, policy: Arc<dyn ConflictPolicy>) -> Self {
        Self {
            db,
            policy,
            tracked_tables: Vec::new(),
        }
    }

    pub fn from_config(db: Arc<DatabaseManager>, config: &SyncConfig) -> Self {
        let policy = config.conflict_policy.build(config.clock_skew_tolerance());
        Self::new(db, policy).with_tracked_tables(config.tracked_tables.clone())
    }

    pub fn with_tracked_tables(mut self, tables: Vec<String>) -> Self {
        self.tracked_tables = tables;
        self
    }

    pub fn manager(&self) -> &DatabaseManager {
        &self.db
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Configured tables, or every table seen in the local change log
    pub async fn tracked_tables(&self) -> Result<Vec<String>> {
        if !self.tracked_tables.is_empty() {
            return Ok(self.tracked_tables.clone());
        }
        let rows = self
            .db
            .execute_query(
                "SELECT DISTINCT table_name FROM change_log ORDER BY table_name",
                &[],
                false,
                false,
            )
            .await?;
        rows.iter().map(|row| row.text("table_name")).collect()
    }

    /// Watermark of the last completed sync of `table`
    pub async fn last_sync(&self, table: &str) -> Result<Option<DateTime<Utc>>> {
        let table_of = match self.db.primary().backend() {
            Backend::Sqlite => "json_extract(details, '$.table')",
            Backend::Postgres => "details->>'table'",
        };
        let sql = format!(
            "SELECT {} FROM sync_status WHERE status = ? AND {} = ? ORDER BY id DESC LIMIT 1",
            SYNC_STATUS_COLUMNS, table_of
        );
        let rows = self
            .db
            .execute_query(
                &sql,
                &[Value::from(SyncStatus::Completed.as_str()), Value::from(table)],
                false,
                false,
            )
            .await?;

        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let entry = SyncStatusEntry::from_row(row)?;
        match entry
            .details
            .as_ref()
            .and_then(|d| d.get("watermark"))
            .and_then(|w| w.as_str())
        {
            Some(ts) => parse_timestamp(ts).map(Some),
            None => Ok(None),
        }
    }

    /// Change-log entries for `table` on one store at or after `since`, oldest first
    pub async fn get_changes_since(
        &self,
        target: Target,
        table: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChangeLogEntry>> {
        let mut sql = format!(
            "SELECT {} FROM change_log WHERE table_name = ?",
            CHANGE_LOG_COLUMNS
        );
        let mut params = vec![Value::from(table)];
        if let Some(since) = since {
            sql.push_str(" AND changed_at >= ?");
            params.push(Value::Timestamp(since));
        }
        sql.push_str(" ORDER BY changed_at, id");

        let rows = self.db.fetch_on(target, &sql, &params).await?;
        rows.iter().map(ChangeLogEntry::from_row).collect()
    }

    pub fn detect_conflicts(
        &self,
        table: &str,
        local: &[ChangeLogEntry],
        remote: &[ChangeLogEntry],
    ) -> Vec<Conflict> {
        detect_conflicts(table, local, remote)
    }

    pub fn resolve_conflicts(&self, conflicts: Vec<Conflict>) -> Vec<ResolvedConflict> {
        resolve_conflicts(self.policy.as_ref(), conflicts)
    }

    /// Replay `changes` onto one store and copy their log entries there,
    /// in one transaction. Returns the number of changes applied.
    pub async fn apply_changes(
        &self,
        target: Target,
        table: &str,
        changes: &[ChangeLogEntry],
    ) -> Result<usize> {
        validate_identifier(table)?;
        let pending: Vec<Pending> = changes
            .iter()
            .cloned()
            .map(|entry| Pending { entry, replay: true })
            .collect();

        let states = replay_states(&pending, &latest_by_record(changes), &HashMap::new());

        let mut tx = self.db.begin_on(target).await?;
        match apply_pending(&mut tx, table, &pending, &states).await {
            Ok(applied) => {
                tx.commit().await?;
                Ok(applied)
            }
            Err(e) => {
                rollback_quietly(tx).await;
                Err(DuosyncError::transaction_failed(
                    format!("apply {} changes to {}", table, target),
                    e,
                ))
            }
        }
    }

    /// Reconcile one table
    pub async fn sync_table(&self, table: &str) -> Result<SyncReport> {
        validate_identifier(table)?;
        if !self.db.has_secondary() {
            return Err(DuosyncError::cloud_unavailable("no cloud URL configured"));
        }

        let since = self.last_sync(table).await?;
        let local = self.get_changes_since(Target::Primary, table, since).await?;
        let remote = self.get_changes_since(Target::Secondary, table, since).await?;

        let local_ids: HashSet<&str> = local.iter().map(|e| e.change_id.as_str()).collect();
        let remote_ids: HashSet<&str> = remote.iter().map(|e| e.change_id.as_str()).collect();
        let local_only: Vec<ChangeLogEntry> = local
            .iter()
            .filter(|e| !remote_ids.contains(e.change_id.as_str()))
            .cloned()
            .collect();
        let remote_only: Vec<ChangeLogEntry> = remote
            .iter()
            .filter(|e| !local_ids.contains(e.change_id.as_str()))
            .cloned()
            .collect();

        debug!(
            table,
            local = local.len(),
            remote = remote.len(),
            local_only = local_only.len(),
            remote_only = remote_only.len(),
            "collected changes"
        );

        let conflicts = self.detect_conflicts(table, &local_only, &remote_only);
        let conflicted: HashSet<String> = conflicts.iter().map(|c| c.record_id.clone()).collect();
        let resolved = self.resolve_conflicts(conflicts);

        let mut to_cloud: Vec<Pending> = local_only
            .into_iter()
            .filter(|e| !conflicted.contains(&e.record_id))
            .map(|entry| Pending { entry, replay: true })
            .collect();
        let mut to_local: Vec<Pending> = remote_only
            .into_iter()
            .filter(|e| !conflicted.contains(&e.record_id))
            .map(|entry| Pending { entry, replay: true })
            .collect();

        let mut unresolved = Vec::new();
        let mut winners_by_record = HashMap::new();
        for item in &resolved {
            let winner_id = item.winner().map(|w| w.change_id.clone());
            if let Some(winner) = item.winner() {
                winners_by_record.insert(item.conflict.record_id.clone(), winner.clone());
            }
            let (winners, losers, winners_dest, losers_dest) = match item.resolution {
                Resolution::KeepLocal => (
                    &item.conflict.local,
                    &item.conflict.remote,
                    &mut to_cloud,
                    &mut to_local,
                ),
                Resolution::KeepRemote => (
                    &item.conflict.remote,
                    &item.conflict.local,
                    &mut to_local,
                    &mut to_cloud,
                ),
                Resolution::Unresolved { ref reason } => {
                    warn!(table, record_id = %item.conflict.record_id, reason = %reason, "unresolved conflict");
                    unresolved.push(item);
                    continue;
                }
            };
            debug!(table, record_id = %item.conflict.record_id, resolution = ?item.resolution, "resolved conflict");

            for entry in winners {
                winners_dest.push(Pending {
                    replay: Some(&entry.change_id) == winner_id.as_ref(),
                    entry: entry.clone(),
                });
            }
            for entry in losers {
                losers_dest.push(Pending {
                    entry: entry.clone(),
                    replay: false,
                });
            }
        }
        to_cloud.sort_by_key(|p| p.entry.changed_at);
        to_local.sort_by_key(|p| p.entry.changed_at);

        let latest = latest_by_record(local.iter().chain(remote.iter()));
        let cloud_states = replay_states(&to_cloud, &latest, &winners_by_record);
        let local_states = replay_states(&to_local, &latest, &winners_by_record);

        let earliest_unresolved = unresolved
            .iter()
            .flat_map(|item| item.conflict.local.iter().chain(item.conflict.remote.iter()))
            .map(|e| e.changed_at)
            .min();
        let newest_seen = local.iter().chain(remote.iter()).map(|e| e.changed_at).max();
        let watermark = earliest_unresolved.or(newest_seen).or(since);

        let mut report = SyncReport {
            table: table.to_string(),
            since,
            watermark,
            pushed: 0,
            pulled: 0,
            conflicts: resolved.len(),
            unresolved: unresolved.len(),
        };

        let mut cloud_tx = self.db.begin_on(Target::Secondary).await?;
        report.pushed = match apply_pending(&mut cloud_tx, table, &to_cloud, &cloud_states).await {
            Ok(n) => n,
            Err(e) => {
                rollback_quietly(cloud_tx).await;
                return Err(DuosyncError::transaction_failed(format!("sync {} to cloud", table), e));
            }
        };

        let mut local_tx = match self.db.begin_on(Target::Primary).await {
            Ok(tx) => tx,
            Err(e) => {
                rollback_quietly(cloud_tx).await;
                return Err(e);
            }
        };
        let local_result = async {
            let pulled = apply_pending(&mut local_tx, table, &to_local, &local_states).await?;

            for item in &unresolved {
                let reason = match &item.resolution {
                    Resolution::Unresolved { reason } => reason.as_str(),
                    _ => "",
                };
                let status = SyncStatusEntry::new(
                    SyncStatus::Conflict,
                    format!("{}: unresolved conflict on record {}", table, item.conflict.record_id),
                    json!({
                        "table": table,
                        "record_id": item.conflict.record_id,
                        "policy": self.policy.name(),
                        "reason": reason,
                        "local": item.conflict.local,
                        "remote": item.conflict.remote,
                    }),
                );
                local_tx
                    .execute(&SyncStatusEntry::insert_sql(), &status.insert_params())
                    .await?;
            }

            let watermark_text = watermark.map(|w| format_timestamp(&w));
            let completed = SyncStatusEntry::new(
                SyncStatus::Completed,
                format!(
                    "{}: applied {}, conflicts {}",
                    table,
                    report.pushed + pulled,
                    report.conflicts
                ),
                json!({
                    "table": table,
                    "applied": report.pushed + pulled,
                    "pushed": report.pushed,
                    "pulled": pulled,
                    "conflicts": report.conflicts,
                    "unresolved": report.unresolved,
                    "watermark": watermark_text,
                }),
            );
            local_tx
                .execute(&SyncStatusEntry::insert_sql(), &completed.insert_params())
                .await?;
            Ok::<_, DuosyncError>(pulled)
        }
        .await;

        report.pulled = match local_result {
            Ok(n) => n,
            Err(e) => {
                rollback_quietly(local_tx).await;
                rollback_quietly(cloud_tx).await;
                return Err(DuosyncError::transaction_failed(format!("sync {} to local", table), e));
            }
        };

        if let Err(e) = cloud_tx.commit().await {
            rollback_quietly(local_tx).await;
            return Err(e);
        }
        local_tx.commit().await?;

        info!(
            table,
            pushed = report.pushed,
            pulled = report.pulled,
            conflicts = report.conflicts,
            unresolved = report.unresolved,
            "table synced"
        );
        Ok(report)
    }

    /// Sync every tracked table; one table's failure never stops the others.
    pub async fn sync_all_tables(&self) -> Result<BTreeMap<String, TableSyncResult>> {
        if !self.db.has_secondary() {
            return Err(DuosyncError::cloud_unavailable("no cloud URL configured"));
        }

        let mut results = BTreeMap::new();
        for table in self.tracked_tables().await? {
            let result = match self.sync_table(&table).await {
                Ok(report) => TableSyncResult::from(&report),
                Err(e) => {
                    error!(table = %table, error = %e, "table sync failed");
                    self.record_failure(&table, &e).await;
                    TableSyncResult {
                        error: Some(e.to_string()),
                        ..Default::default()
                    }
                }
            };
            results.insert(table, result);
        }
        Ok(results)
    }

    async fn record_failure(&self, table: &str, err: &DuosyncError) {
        let status = SyncStatusEntry::new(
            SyncStatus::Failed,
            format!("{}: {}", table, err),
            json!({ "table": table, "error": err.to_string() }),
        );
        if let Err(e) = self
            .db
            .execute_query(&SyncStatusEntry::insert_sql(), &status.insert_params(), true, true)
            .await
        {
            warn!(table, error = %e, "could not record sync failure");
        }
    }

    /// Sync status entries, newest first
    pub async fn recent_status(&self, limit: usize) -> Result<Vec<SyncStatusEntry>> {
        let sql = format!(
            "SELECT {} FROM sync_status ORDER BY id DESC LIMIT {}",
            SYNC_STATUS_COLUMNS, limit
        );
        let rows = self.db.execute_query(&sql, &[], false, false).await?;
        rows.iter().map(SyncStatusEntry::from_row).collect()
    }
}

/// Copy every pending log entry, then bring each record in `states` to the
/// state after that entry. Returns the number of changes applied.
async fn apply_pending(
    tx: &mut WriteTransaction<'_>,
    table: &str,
    pending: &[Pending],
    states: &[ChangeLogEntry],
) -> Result<usize> {
    for item in pending {
        tx.execute(&ChangeLogEntry::insert_sql(), &item.entry.insert_params()?)
            .await?;
    }

    let types = if states.is_empty() {
        ColumnTypes::new()
    } else {
        column_types(tx, table).await?
    };
    for entry in states {
        replay_change(tx, table, entry, &types).await?;
    }
    Ok(pending.iter().filter(|p| p.replay).count())
}

async fn replay_change(
    tx: &mut WriteTransaction<'_>,
    table: &str,
    entry: &ChangeLogEntry,
    types: &ColumnTypes,
) -> Result<()> {
    match entry.operation {
        Operation::Delete => {
            tx.execute(&delete_statement(table)?, &[Value::from(entry.record_id.as_str())])
                .await?;
        }
        Operation::Insert | Operation::Update => {
            let Some(mut row) = entry.details.as_ref().and_then(|d| d.resulting_row()) else {
                warn!(table, change_id = %entry.change_id, "change has no row details; log entry copied only");
                return Ok(());
            };
            row.entry(ID_COLUMN.to_string())
                .or_insert_with(|| Value::from(entry.record_id.as_str()));
            let (sql, params) = upsert_statement(table, &row, types)?;
            tx.execute(&sql, &params).await?;
        }
    }
    debug!(table, record_id = %entry.record_id, operation = %entry.operation, target_store = %tx.target(), "replayed change");
    Ok(())
}

async fn rollback_quietly(tx: WriteTransaction<'_>) {
    let target = tx.target();
    if let Err(e) = tx.rollback().await {
        warn!(target_store = %target, error = %e, "rollback failed");
    }
}
