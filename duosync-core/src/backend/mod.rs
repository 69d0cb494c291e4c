//! Physical connections to one database endpoint
//!
//! # Design Principles
//!
//! - One trait pair per seam: [`Connector`] opens, [`DbConnection`] talks
//! - Application SQL uses `?` placeholders on every backend
//! - Rows decode dynamically into [`Value`]s, no compile-time schema
//! - Transactions are explicit statements so a pooled connection can carry one

pub mod postgres;
pub mod sqlite;

use std::fmt;

use async_trait::async_trait;

use crate::value::{Row, Value};

pub use postgres::{PostgresConnection, PostgresConnector};
pub use sqlite::{SqliteConnection, SqliteConnector};

/// SQL dialect of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Sqlite,
    Postgres,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Sqlite => write!(f, "sqlite"),
            Backend::Postgres => write!(f, "postgres"),
        }
    }
}

/// An open, exclusively owned connection
#[async_trait]
pub trait DbConnection: Send {
    fn backend(&self) -> Backend;

    /// Run a statement and return the number of affected rows
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, sqlx::Error>;

    /// Run a query and decode every returned row
    async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, sqlx::Error>;

    /// Run a multi-statement script without parameters
    async fn execute_script(&mut self, sql: &str) -> Result<(), sqlx::Error>;

    async fn begin(&mut self) -> Result<(), sqlx::Error>;

    async fn commit(&mut self) -> Result<(), sqlx::Error>;

    async fn rollback(&mut self) -> Result<(), sqlx::Error>;

    async fn ping(&mut self) -> Result<(), sqlx::Error>;

    async fn close(self: Box<Self>) -> Result<(), sqlx::Error>;
}

/// Opens physical connections to one endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human-readable endpoint without credentials
    fn endpoint(&self) -> &str;

    fn backend(&self) -> Backend;

    async fn connect(&self) -> Result<Box<dyn DbConnection>, sqlx::Error>;
}

/// Count `?` placeholders outside string literals, quoted identifiers and comments.
pub fn count_placeholders(sql: &str) -> usize {
    placeholder_positions(sql).len()
}

/// Byte offsets of every bare `?` in `sql`.
pub fn placeholder_positions(sql: &str) -> Vec<usize> {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Code,
        SingleQuote,
        DoubleQuote,
        LineComment,
        BlockComment,
    }

    let mut state = State::Code;
    let mut positions = Vec::new();
    let mut chars = sql.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        let next = chars.peek().map(|&(_, n)| n);
        state = match (state, c) {
            (State::Code, '?') => {
                positions.push(pos);
                State::Code
            }
            (State::Code, '\'') => State::SingleQuote,
            (State::Code, '"') => State::DoubleQuote,
            (State::Code, '-') if next == Some('-') => State::LineComment,
            (State::Code, '/') if next == Some('*') => {
                chars.next();
                State::BlockComment
            }
            (State::SingleQuote, '\'') => State::Code,
            (State::DoubleQuote, '"') => State::Code,
            (State::LineComment, '\n') => State::Code,
            (State::BlockComment, '*') if next == Some('/') => {
                chars.next();
                State::Code
            }
            (current, _) => current,
        };
    }

    positions
}
