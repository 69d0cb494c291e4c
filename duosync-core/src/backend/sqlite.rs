//! Local store: an embedded SQLite file

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous,
};
use sqlx::{Column, ConnectOptions, Connection, Executor, Row as _, Sqlite, TypeInfo, ValueRef};
use tracing::debug;

use super::{count_placeholders, Backend, Connector, DbConnection};
use crate::value::{format_timestamp, Row, Value};

/// Opens connections to one SQLite database file
pub struct SqliteConnector {
    path: PathBuf,
    endpoint: String,
    options: SqliteConnectOptions,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5)) // concurrent readers while a writer holds the lock
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        Self {
            endpoint: format!("sqlite://{}", path.display()),
            path,
            options,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    async fn connect(&self) -> Result<Box<dyn DbConnection>, sqlx::Error> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let conn = self.options.connect().await?;
        debug!(endpoint = %self.endpoint, "opened sqlite connection");
        Ok(Box::new(SqliteConnection { conn }))
    }
}

/// One open SQLite connection
pub struct SqliteConnection {
    conn: sqlx::SqliteConnection,
}

fn build_query<'q>(
    sql: &'q str,
    params: &[Value],
) -> Result<Query<'q, Sqlite, SqliteArguments<'q>>, sqlx::Error> {
    let expected = count_placeholders(sql);
    if expected != params.len() {
        return Err(sqlx::Error::Protocol(format!(
            "statement expects {} parameter(s) but {} were supplied",
            expected,
            params.len()
        )));
    }

    let mut query = sqlx::query(sql);
    for value in params {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Int(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::Text(s) => query.bind(s.clone()),
            Value::Json(j) => query.bind(j.to_string()),
            Value::Timestamp(ts) => query.bind(format_timestamp(ts)),
        };
    }
    Ok(query)
}

fn decode_row(row: &SqliteRow) -> Result<Row, sqlx::Error> {
    let columns: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let mut values = Vec::with_capacity(columns.len());

    for idx in 0..columns.len() {
        // Storage class of the value itself, not the declared column type
        let type_name = {
            let raw = row.try_get_raw(idx)?;
            if raw.is_null() {
                values.push(Value::Null);
                continue;
            }
            raw.type_info().name().to_ascii_uppercase()
        };

        let value = match type_name.as_str() {
            "INTEGER" | "INT" | "BIGINT" | "INT8" => Value::Int(row.try_get::<i64, _>(idx)?),
            "BOOLEAN" | "BOOL" => Value::Bool(row.try_get::<bool, _>(idx)?),
            "REAL" | "FLOAT" | "DOUBLE" => Value::Float(row.try_get::<f64, _>(idx)?),
            "BLOB" => {
                let bytes = row.try_get::<Vec<u8>, _>(idx)?;
                Value::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
            _ => Value::Text(row.try_get::<String, _>(idx)?),
        };
        values.push(value);
    }

    Ok(Row::new(columns, values))
}

#[async_trait]
impl DbConnection for SqliteConnection {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, sqlx::Error> {
        let result = build_query(sql, params)?.execute(&mut self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, sqlx::Error> {
        let rows = build_query(sql, params)?.fetch_all(&mut self.conn).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute_script(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        self.conn.execute(sql).await?;
        Ok(())
    }

    async fn begin(&mut self) -> Result<(), sqlx::Error> {
        // IMMEDIATE takes the write lock up front instead of failing mid-transaction
        self.conn.execute("BEGIN IMMEDIATE").await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), sqlx::Error> {
        self.conn.execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        self.conn.execute("ROLLBACK").await?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), sqlx::Error> {
        self.conn.ping().await
    }

    async fn close(self: Box<Self>) -> Result<(), sqlx::Error> {
        self.conn.close().await
    }
}
