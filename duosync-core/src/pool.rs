//! Bounded connection pool for one endpoint
//!
//! Unlike `sqlx::Pool`, acquisition never waits: when every connection is
//! checked out and the pool is at `pool_size`, [`ConnectionPool::get_connection`]
//! fails with `PoolExhausted` so callers can apply their own backoff.
//!
//! Connections open lazily, are reused most-recently-released first, and are
//! returned automatically when the [`PooledConnection`] guard drops.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, warn};

use crate::backend::{Backend, Connector, DbConnection};
use crate::error::{DuosyncError, Result};
use crate::retry::{retry_with_backoff, RetryPolicy};

const CONN_TAKEN: &str = "(bug) connection already taken from PooledConnection";

/// Stable identity of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
}

#[derive(Default)]
struct PoolState {
    /// Every live connection and whether it is checked out
    in_use: HashMap<ConnectionId, bool>,
    /// Idle handles, most recently released last
    idle: Vec<(ConnectionId, Box<dyn DbConnection>)>,
    /// Capacity reserved by connections still being opened
    opening: usize,
    closed: bool,
}

struct PoolInner {
    name: String,
    size: usize,
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    next_id: AtomicU64,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, id: ConnectionId, conn: Box<dyn DbConnection>) {
        let mut state = self.lock();
        if state.closed || !state.in_use.contains_key(&id) {
            // Pool was closed while this connection was out; dropping it closes it.
            debug!(pool = %self.name, %id, "dropping connection released after close");
            return;
        }
        state.in_use.insert(id, false);
        state.idle.push((id, conn));
        debug!(pool = %self.name, %id, "connection released");
    }

    fn forget(&self, id: ConnectionId) {
        self.lock().in_use.remove(&id);
    }
}

/// Releases reserved capacity if opening fails or the caller is cancelled
struct OpeningSlot<'a> {
    inner: &'a PoolInner,
}

impl Drop for OpeningSlot<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        state.opening = state.opening.saturating_sub(1);
    }
}

/// Bounded pool of connections to one endpoint
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        name: impl Into<String>,
        connector: Arc<dyn Connector>,
        pool_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                size: pool_size.max(1),
                connector,
                retry,
                next_id: AtomicU64::new(1),
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn endpoint(&self) -> &str {
        self.inner.connector.endpoint()
    }

    pub fn backend(&self) -> Backend {
        self.inner.connector.backend()
    }

    /// Check out an idle connection, or open one if below `pool_size`.
    ///
    /// # Errors
    ///
    /// - `PoolExhausted` when every connection is in use and the pool is full
    /// - `PoolClosed` after [`close_all`](Self::close_all)
    /// - `ConnectionFailed` when opening a new connection fails after retries
    pub async fn get_connection(&self) -> Result<PooledConnection> {
        let slot = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(DuosyncError::pool_closed(&self.inner.name));
            }

            if let Some((id, conn)) = state.idle.pop() {
                state.in_use.insert(id, true);
                debug!(pool = %self.inner.name, %id, "reusing idle connection");
                return Ok(PooledConnection::new(self.inner.clone(), id, conn));
            }

            if state.in_use.len() + state.opening >= self.inner.size {
                return Err(DuosyncError::pool_exhausted(&self.inner.name, self.inner.size));
            }

            state.opening += 1;
            OpeningSlot { inner: &self.inner }
        };

        let connector = &self.inner.connector;
        let opened = retry_with_backoff(&self.inner.retry, &self.inner.name, || connector.connect())
            .await
            .map_err(|e| {
                DuosyncError::connection_failed(connector.endpoint(), e.attempts, e.last_error)
            })?;

        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(DuosyncError::pool_closed(&self.inner.name));
            }
            state.in_use.insert(id, true);
        }
        drop(slot);

        debug!(pool = %self.inner.name, %id, endpoint = %connector.endpoint(), "opened new connection");
        Ok(PooledConnection::new(self.inner.clone(), id, opened))
    }

    /// Return a connection to the pool. Equivalent to dropping the guard.
    pub fn release_connection(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Close every idle connection and stop tracking checked-out ones.
    ///
    /// Connections still checked out are closed when their guard drops.
    /// Idempotent; the pool refuses new checkouts afterwards.
    pub async fn close_all(&self) {
        let idle = {
            let mut state = self.inner.lock();
            state.closed = true;
            state.in_use.clear();
            std::mem::take(&mut state.idle)
        };

        let count = idle.len();
        for (id, conn) in idle {
            if let Err(e) = conn.close().await {
                warn!(pool = %self.inner.name, %id, error = %e, "error closing connection");
            }
        }
        if count > 0 {
            debug!(pool = %self.inner.name, count, "closed pool connections");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        let in_use = state.in_use.values().filter(|busy| **busy).count();
        PoolStats {
            size: self.inner.size,
            open: state.in_use.len(),
            idle: state.idle.len(),
            in_use,
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.name)
            .field("endpoint", &self.endpoint())
            .field("stats", &self.stats())
            .finish()
    }
}

/// A checked-out connection; returns to its pool on drop
pub struct PooledConnection {
    id: ConnectionId,
    conn: Option<Box<dyn DbConnection>>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, id: ConnectionId, conn: Box<dyn DbConnection>) -> Self {
        Self {
            id,
            conn: Some(conn),
            pool,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    /// Drop the connection without returning it; the driver closes the socket
    /// and the server discards any open transaction.
    pub fn invalidate(mut self) {
        self.pool.forget(self.id);
        self.conn.take();
        debug!(pool = %self.pool.name, id = %self.id, "connection invalidated");
    }

    /// Remove a connection in an unknown state from the pool and close it.
    pub async fn discard(mut self) {
        self.pool.forget(self.id);
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                debug!(pool = %self.pool.name, id = %self.id, error = %e, "error closing discarded connection");
            }
        }
    }
}

impl Deref for PooledConnection {
    type Target = dyn DbConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_deref().expect(CONN_TAKEN)
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().expect(CONN_TAKEN)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(self.id, conn);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("pool", &self.pool.name)
            .finish()
    }
}
