//! Bookkeeping tables shared by both stores
//!
//! Application tables are owned by the caller; only `change_log` and
//! `sync_status` are created here. Every statement is idempotent.

use crate::backend::Backend;

const SQLITE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS change_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    change_id TEXT NOT NULL UNIQUE,
    table_name TEXT NOT NULL,
    operation TEXT NOT NULL CHECK (operation IN ('INSERT', 'UPDATE', 'DELETE')),
    record_id TEXT NOT NULL,
    changed_at TEXT NOT NULL,
    user_id TEXT,
    details TEXT
);

CREATE INDEX IF NOT EXISTS idx_change_log_table_time ON change_log (table_name, changed_at);
CREATE INDEX IF NOT EXISTS idx_change_log_record ON change_log (table_name, record_id);

CREATE TABLE IF NOT EXISTS sync_status (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    status TEXT NOT NULL,
    message TEXT,
    details TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_sync_status_status ON sync_status (status, id);
"#;

const POSTGRES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS change_log (
    id BIGSERIAL PRIMARY KEY,
    change_id TEXT NOT NULL UNIQUE,
    table_name TEXT NOT NULL,
    operation TEXT NOT NULL CHECK (operation IN ('INSERT', 'UPDATE', 'DELETE')),
    record_id TEXT NOT NULL,
    changed_at TIMESTAMPTZ NOT NULL,
    user_id TEXT,
    details JSONB
);

CREATE INDEX IF NOT EXISTS idx_change_log_table_time ON change_log (table_name, changed_at);
CREATE INDEX IF NOT EXISTS idx_change_log_record ON change_log (table_name, record_id);

CREATE TABLE IF NOT EXISTS sync_status (
    id BIGSERIAL PRIMARY KEY,
    status TEXT NOT NULL,
    message TEXT,
    details JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_sync_status_status ON sync_status (status, id);
"#;

/// DDL script for the bookkeeping tables in the given dialect
pub fn bookkeeping_schema(backend: Backend) -> &'static str {
    match backend {
        Backend::Sqlite => SQLITE_SCHEMA,
        Backend::Postgres => POSTGRES_SCHEMA,
    }
}
