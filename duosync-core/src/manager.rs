//! Routing between the local store and the cloud replica
//!
//! The local store is the system of record: reads hit it alone, writes must
//! succeed there. The cloud replica receives the same writes on a
//! best-effort basis; its failures are logged and never reach the caller.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::backend::{Backend, PostgresConnector, SqliteConnector};
use crate::config::DuosyncConfig;
use crate::error::{DuosyncError, Result};
use crate::pool::{ConnectionPool, PoolStats, PooledConnection};
use crate::schema::bookkeeping_schema;
use crate::value::{Row, Value};

/// Which store a statement is aimed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// Local store
    Primary,
    /// Cloud replica
    Secondary,
}

impl Target {
    pub fn other(&self) -> Target {
        match self {
            Target::Primary => Target::Secondary,
            Target::Secondary => Target::Primary,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Primary => f.write_str("local"),
            Target::Secondary => f.write_str("cloud"),
        }
    }
}

/// Reachability of one store
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub backend: String,
    pub reachable: bool,
    pub error: Option<String>,
    pub pool: PoolStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub local: EndpointHealth,
    pub cloud: Option<EndpointHealth>,
}

/// Owns the local and cloud pools and routes every statement
pub struct DatabaseManager {
    primary: ConnectionPool,
    secondary: Option<ConnectionPool>,
    /// Serialises local writes in arrival order
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl DatabaseManager {
    /// Build pools from configuration. No connection is opened until first use.
    pub fn new(config: &DuosyncConfig) -> Result<Self> {
        config.validate()?;

        let local = Arc::new(SqliteConnector::new(&config.local.path));
        let primary = ConnectionPool::new("local", local, config.local.pool_size, config.retry);

        let secondary = match &config.cloud.url {
            Some(url) => {
                let cloud = Arc::new(PostgresConnector::new(url, config.cloud.token.as_deref())?);
                Some(ConnectionPool::new("cloud", cloud, config.cloud.pool_size, config.retry))
            }
            None => {
                info!("No cloud URL configured; running local-only");
                None
            }
        };

        Ok(Self::from_pools(primary, secondary))
    }

    pub fn from_pools(primary: ConnectionPool, secondary: Option<ConnectionPool>) -> Self {
        Self {
            primary,
            secondary,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn primary(&self) -> &ConnectionPool {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&ConnectionPool> {
        self.secondary.as_ref()
    }

    pub fn has_secondary(&self) -> bool {
        self.secondary.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn pool(&self, target: Target) -> Result<&ConnectionPool> {
        match target {
            Target::Primary => Ok(&self.primary),
            Target::Secondary => self
                .secondary
                .as_ref()
                .ok_or_else(|| DuosyncError::cloud_unavailable("no cloud URL configured")),
        }
    }

    /// Run one statement.
    ///
    /// Reads go to the local store only. Writes go to the local store, whose
    /// rows are returned, and then to the cloud replica unless `local_only`.
    pub async fn execute_query(
        &self,
        sql: &str,
        params: &[Value],
        for_write: bool,
        local_only: bool,
    ) -> Result<Vec<Row>> {
        if !for_write {
            let mut conn = self.primary.get_connection().await?;
            return Ok(conn.fetch_all(sql, params).await?);
        }

        let rows = {
            let _ordered = self.write_lock.lock().await;
            let mut conn = self.primary.get_connection().await?;
            conn.fetch_all(sql, params).await?
        };

        if !local_only {
            if let Err(e) = self.replicate(sql, params).await {
                warn!(error = %e, "cloud replication failed; local write kept");
            }
        }

        Ok(rows)
    }

    /// Mirror one write onto the cloud replica
    async fn replicate(&self, sql: &str, params: &[Value]) -> Result<()> {
        let Some(pool) = &self.secondary else {
            return Ok(());
        };
        let mut conn = pool.get_connection().await?;
        let affected = conn.execute(sql, params).await?;
        debug!(affected, "replicated write to cloud");
        Ok(())
    }

    /// Read from the cloud replica
    pub async fn fetch_secondary(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut conn = self.pool(Target::Secondary)?.get_connection().await?;
        Ok(conn.fetch_all(sql, params).await?)
    }

    /// Read from exactly one store
    pub async fn fetch_on(&self, target: Target, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut conn = self.pool(target)?.get_connection().await?;
        Ok(conn.fetch_all(sql, params).await?)
    }

    /// Write to exactly one store; failures are returned, never swallowed.
    pub async fn execute_on(&self, target: Target, sql: &str, params: &[Value]) -> Result<u64> {
        let pool = self.pool(target)?;
        let _ordered = match target {
            Target::Primary => Some(self.write_lock.lock().await),
            Target::Secondary => None,
        };
        let mut conn = pool.get_connection().await?;
        Ok(conn.execute(sql, params).await?)
    }

    /// Open a write transaction on the local store, mirrored to the cloud
    /// unless `local_only`.
    pub async fn begin_write(&self, local_only: bool) -> Result<WriteTransaction<'_>> {
        let lock = self.write_lock.lock().await;
        let mut main = self.primary.get_connection().await?;
        main.begin().await?;

        let mirror = if local_only {
            None
        } else {
            self.open_mirror().await
        };

        Ok(WriteTransaction {
            target: Target::Primary,
            main: Some(main),
            mirror,
            _lock: Some(lock),
        })
    }

    /// Open a transaction on exactly one store. Failures on that store are fatal.
    pub async fn begin_on(&self, target: Target) -> Result<WriteTransaction<'_>> {
        if target == Target::Primary {
            return self.begin_write(true).await;
        }

        let mut main = self.pool(target)?.get_connection().await?;
        main.begin().await?;
        Ok(WriteTransaction {
            target,
            main: Some(main),
            mirror: None,
            _lock: None,
        })
    }

    async fn open_mirror(&self) -> Option<PooledConnection> {
        let pool = self.secondary.as_ref()?;
        let mut conn = match pool.get_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "cloud unavailable; transaction continues local-only");
                return None;
            }
        };
        match conn.begin().await {
            Ok(()) => Some(conn),
            Err(e) => {
                warn!(error = %e, "cloud BEGIN failed; transaction continues local-only");
                conn.discard().await;
                None
            }
        }
    }

    /// Create the bookkeeping tables locally, and on the cloud when reachable
    pub async fn init_schema(&self) -> Result<()> {
        {
            let mut conn = self.primary.get_connection().await?;
            conn.execute_script(bookkeeping_schema(self.primary.backend())).await?;
        }
        info!(endpoint = %self.primary.endpoint(), "local schema ready");

        if let Some(pool) = &self.secondary {
            let result = async {
                let mut conn = pool.get_connection().await?;
                conn.execute_script(bookkeeping_schema(pool.backend())).await?;
                Ok::<_, DuosyncError>(())
            }
            .await;
            match result {
                Ok(()) => info!(endpoint = %pool.endpoint(), "cloud schema ready"),
                Err(e) => warn!(endpoint = %pool.endpoint(), error = %e, "cloud schema not created"),
            }
        }
        Ok(())
    }

    pub async fn health(&self) -> HealthReport {
        let cloud = match &self.secondary {
            Some(pool) => Some(probe(pool).await),
            None => None,
        };
        HealthReport {
            local: probe(&self.primary).await,
            cloud,
        }
    }

    /// Wait for in-flight writes, then close both pools. Idempotent.
    pub async fn close(&self) {
        let _quiesced = self.write_lock.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.primary.close_all().await;
        if let Some(pool) = &self.secondary {
            pool.close_all().await;
        }
        info!("database manager closed");
    }
}

async fn probe(pool: &ConnectionPool) -> EndpointHealth {
    let result = async {
        let mut conn = pool.get_connection().await?;
        conn.ping().await?;
        Ok::<_, DuosyncError>(())
    }
    .await;

    EndpointHealth {
        endpoint: pool.endpoint().to_string(),
        backend: pool.backend().to_string(),
        reachable: result.is_ok(),
        error: result.err().map(|e| e.to_string()),
        pool: pool.stats(),
    }
}

impl fmt::Debug for DatabaseManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseManager")
            .field("primary", &self.primary)
            .field("secondary", &self.secondary)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A transaction on one store, optionally mirrored to the other.
///
/// Statements run on the main connection first; its failures are returned.
/// The first mirror failure, or a row count that differs from the main
/// store's, rolls the mirror back and detaches it for the rest of the
/// transaction. Dropping without `commit`/`rollback` throws both
/// connections away, which discards the open transactions.
pub struct WriteTransaction<'a> {
    target: Target,
    main: Option<PooledConnection>,
    mirror: Option<PooledConnection>,
    _lock: Option<MutexGuard<'a, ()>>,
}

impl WriteTransaction<'_> {
    pub fn target(&self) -> Target {
        self.target
    }

    pub fn backend(&self) -> Option<Backend> {
        self.main.as_ref().map(|conn| conn.backend())
    }

    /// Whether the mirror is still attached
    pub fn is_mirrored(&self) -> bool {
        self.mirror.is_some()
    }

    fn main(&mut self) -> Result<&mut PooledConnection> {
        self.main
            .as_mut()
            .ok_or_else(|| DuosyncError::invalid_value("transaction", "already finished"))
    }

    /// Read inside the transaction, main store only
    pub async fn read(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        Ok(self.main()?.fetch_all(sql, params).await?)
    }

    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let affected = self.main()?.execute(sql, params).await?;
        self.mirror_statement(sql, params, affected).await;
        Ok(affected)
    }

    /// Run a statement that returns rows (e.g. `RETURNING`); rows come from the main store
    pub async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let rows = self.main()?.fetch_all(sql, params).await?;
        self.mirror_statement(sql, params, rows.len() as u64).await;
        Ok(rows)
    }

    /// Repeat a statement on the mirror. A mirror that errors, or touches a
    /// different number of rows than the main store, has diverged: it is
    /// detached so the change stays local-only and sync pushes it later.
    async fn mirror_statement(&mut self, sql: &str, params: &[Value], expected: u64) {
        let Some(conn) = self.mirror.as_mut() else {
            return;
        };
        match conn.execute(sql, params).await {
            Ok(affected) if affected == expected => {}
            Ok(affected) => {
                warn!(
                    expected,
                    affected, "cloud row count differs; detaching cloud from transaction"
                );
                self.detach_mirror().await;
            }
            Err(e) => {
                warn!(error = %e, "cloud write failed; detaching cloud from transaction");
                self.detach_mirror().await;
            }
        }
    }

    async fn detach_mirror(&mut self) {
        if let Some(mut conn) = self.mirror.take() {
            if conn.rollback().await.is_err() {
                conn.discard().await;
            }
        }
    }

    /// Commit main, then mirror. A mirror commit failure is logged only.
    pub async fn commit(mut self) -> Result<()> {
        let mut main = self
            .main
            .take()
            .ok_or_else(|| DuosyncError::invalid_value("transaction", "already finished"))?;

        if let Err(e) = main.commit().await {
            if main.rollback().await.is_err() {
                main.discard().await;
            }
            self.detach_mirror().await;
            return Err(DuosyncError::transaction_failed(
                format!("{} commit", self.target),
                e.into(),
            ));
        }
        drop(main);

        if let Some(mut mirror) = self.mirror.take() {
            if let Err(e) = mirror.commit().await {
                warn!(error = %e, "cloud commit failed; local commit kept");
                mirror.discard().await;
            }
        }
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        self.detach_mirror().await;
        if let Some(mut main) = self.main.take() {
            if let Err(e) = main.rollback().await {
                main.discard().await;
                return Err(e.into());
            }
        }
        Ok(())
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.main.take() {
            debug!(target_store = %self.target, "transaction dropped unfinished; invalidating connection");
            conn.invalidate();
        }
        if let Some(conn) = self.mirror.take() {
            conn.invalidate();
        }
    }
}
