//! Structured error types for duosync-core.
//!
//! Uses `thiserror` so library consumers get typed, composable errors.
//! The CLI wraps these in `anyhow` for context.

use std::io;
use thiserror::Error;

/// Main error type for duosync-core operations
#[derive(Error, Debug)]
pub enum DuosyncError {
    /// Pool has no idle connection and is at capacity
    #[error("connection pool '{pool}' exhausted: all {size} connections in use")]
    PoolExhausted { pool: String, size: usize },

    /// Pool was closed with `close_all`
    #[error("connection pool '{pool}' is closed")]
    PoolClosed { pool: String },

    /// Connection establishment failed after the retry budget
    #[error("failed to connect to {endpoint} after {attempts} attempt(s): {source}")]
    ConnectionFailed {
        endpoint: String,
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    /// A transaction failed and was rolled back
    #[error("transaction rolled back during {context}: {source}")]
    TransactionFailed {
        context: String,
        #[source]
        source: Box<DuosyncError>,
    },

    /// Query execution failed (never retried)
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// Record or table row missing
    #[error("{table} record '{id}' not found")]
    NotFound { table: String, id: String },

    /// Table or column name rejected before interpolation
    #[error("invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),

    /// Value could not be decoded or converted
    #[error("invalid value for {context}: {reason}")]
    InvalidValue { context: String, reason: String },

    /// JSON parsing or serialization failed
    #[error("JSON error at {context}: {source}")]
    Json {
        context: String,
        source: serde_json::Error,
    },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// An operation needed the cloud replica but none is configured
    #[error("cloud replica unavailable: {reason}")]
    CloudUnavailable { reason: String },

    /// I/O operation failed
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// Result type alias for duosync-core operations
pub type Result<T> = std::result::Result<T, DuosyncError>;

impl DuosyncError {
    pub fn pool_exhausted(pool: impl Into<String>, size: usize) -> Self {
        Self::PoolExhausted {
            pool: pool.into(),
            size,
        }
    }

    pub fn pool_closed(pool: impl Into<String>) -> Self {
        Self::PoolClosed { pool: pool.into() }
    }

    pub fn connection_failed(endpoint: impl Into<String>, attempts: u32, source: sqlx::Error) -> Self {
        Self::ConnectionFailed {
            endpoint: endpoint.into(),
            attempts,
            source,
        }
    }

    /// Wrap an error that caused a rollback. Already-wrapped errors pass through.
    pub fn transaction_failed(context: impl Into<String>, source: DuosyncError) -> Self {
        match source {
            err @ Self::TransactionFailed { .. } => err,
            other => Self::TransactionFailed {
                context: context.into(),
                source: Box::new(other),
            },
        }
    }

    pub fn not_found(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            table: table.into(),
            id: id.into(),
        }
    }

    pub fn invalid_value(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            context: context.into(),
            reason: reason.into(),
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub fn cloud_unavailable(reason: impl Into<String>) -> Self {
        Self::CloudUnavailable {
            reason: reason.into(),
        }
    }

    /// True for the "database connection error" family: failed connects and rolled-back transactions.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::TransactionFailed { .. }
        )
    }

    /// The innermost error for rolled-back transactions, `self` otherwise.
    pub fn root_cause(&self) -> &DuosyncError {
        match self {
            Self::TransactionFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
