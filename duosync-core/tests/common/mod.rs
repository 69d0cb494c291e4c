//! Shared fixtures: two SQLite files stand in for the local store and the
//! cloud replica, wired through the same `Connector` seam production uses.

#![allow(dead_code)]

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use duosync_core::{
    Backend, ConnectionPool, Connector, DatabaseManager, DbConnection, Record, RetryPolicy,
    SqliteConnector, Target, Value,
};
use tempfile::TempDir;

pub const TEST_TABLE_DDL: &str =
    "CREATE TABLE IF NOT EXISTS test_table (id TEXT PRIMARY KEY, name TEXT, value INTEGER)";

/// Counts physical opens of an inner connector
pub struct CountingConnector {
    inner: SqliteConnector,
    opened: AtomicUsize,
}

impl CountingConnector {
    pub fn new(path: &Path) -> Self {
        Self {
            inner: SqliteConnector::new(path),
            opened: AtomicUsize::new(0),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for CountingConnector {
    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    fn backend(&self) -> Backend {
        self.inner.backend()
    }

    async fn connect(&self) -> Result<Box<dyn DbConnection>, sqlx::Error> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.inner.connect().await
    }
}

/// Fails the first `failures` attempts, then delegates
pub struct FlakyConnector {
    inner: Option<SqliteConnector>,
    failures: usize,
    attempts: AtomicUsize,
}

impl FlakyConnector {
    pub fn new(path: &Path, failures: usize) -> Self {
        Self {
            inner: Some(SqliteConnector::new(path)),
            failures,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Never connects
    pub fn unreachable() -> Self {
        Self {
            inner: None,
            failures: usize::MAX,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FlakyConnector {
    fn endpoint(&self) -> &str {
        "postgres://cloud.invalid/app"
    }

    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    async fn connect(&self) -> Result<Box<dyn DbConnection>, sqlx::Error> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        match &self.inner {
            Some(inner) if attempt >= self.failures => inner.connect().await,
            _ => Err(sqlx::Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "cloud unreachable",
            ))),
        }
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub db: Arc<DatabaseManager>,
    pub local: Arc<CountingConnector>,
}

impl Harness {
    /// Local store plus a reachable cloud replica, both with `test_table`
    pub async fn dual() -> Self {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(CountingConnector::new(&dir.path().join("local.db")));
        let cloud = Arc::new(SqliteConnector::new(dir.path().join("cloud.db")));

        let db = DatabaseManager::from_pools(
            ConnectionPool::new("local", local.clone(), 5, RetryPolicy::none()),
            Some(ConnectionPool::new("cloud", cloud, 5, RetryPolicy::none())),
        );
        let harness = Self {
            dir,
            db: Arc::new(db),
            local,
        };
        harness.prepare(Target::Primary).await;
        harness.prepare(Target::Secondary).await;
        harness
    }

    /// Local store with a cloud replica that never answers
    pub async fn unreachable_cloud() -> Self {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(CountingConnector::new(&dir.path().join("local.db")));
        let cloud = Arc::new(FlakyConnector::unreachable());

        let db = DatabaseManager::from_pools(
            ConnectionPool::new("local", local.clone(), 5, RetryPolicy::none()),
            Some(ConnectionPool::new("cloud", cloud, 5, RetryPolicy::none())),
        );
        db.init_schema().await.unwrap();
        db.execute_on(Target::Primary, TEST_TABLE_DDL, &[]).await.unwrap();
        Self {
            dir,
            db: Arc::new(db),
            local,
        }
    }

    async fn prepare(&self, target: Target) {
        if target == Target::Primary {
            self.db.init_schema().await.unwrap();
        }
        self.db.execute_on(target, TEST_TABLE_DDL, &[]).await.unwrap();
    }

    /// A second manager whose local store is this harness's cloud file:
    /// another device writing straight to the replica.
    pub fn cloud_device(&self) -> DatabaseManager {
        let cloud = Arc::new(SqliteConnector::new(self.dir.path().join("cloud.db")));
        DatabaseManager::from_pools(
            ConnectionPool::new("cloud-device", cloud, 3, RetryPolicy::none()),
            None,
        )
    }

    pub async fn count(&self, target: Target, sql: &str, params: &[Value]) -> i64 {
        let rows = self.db.fetch_on(target, sql, params).await.unwrap();
        rows[0].get_index(0).and_then(Value::as_i64).unwrap()
    }

    pub async fn change_count(&self, target: Target, record_id: &str) -> i64 {
        self.count(
            target,
            "SELECT COUNT(*) FROM change_log WHERE record_id = ?",
            &[Value::from(record_id)],
        )
        .await
    }
}

pub fn record(pairs: &[(&str, Value)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
