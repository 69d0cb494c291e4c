pub mod backend;
pub mod changelog;
pub mod config;
pub mod error;
pub mod manager;
pub mod operations;
pub mod pool;
pub mod retry;
pub mod schema;
pub mod sync;
pub mod value;

pub use backend::{Backend, Connector, DbConnection, PostgresConnector, SqliteConnector};
pub use changelog::{ChangeDetails, ChangeLogEntry, Operation, SyncStatus, SyncStatusEntry};
pub use config::{load_dotenv, DuosyncConfig};
pub use error::{DuosyncError, Result};
pub use manager::{DatabaseManager, HealthReport, Target, WriteTransaction};
pub use operations::{
    bulk_insert, delete_record, get_change_log, get_record, insert_record, query_records,
    update_record, Conditions, Filter, OperationContext,
};
pub use pool::{ConnectionId, ConnectionPool, PoolStats, PooledConnection};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use sync::{ConflictPolicy, ConflictPolicyKind, SyncEngine, SyncReport, SyncWorker, TableSyncResult};
pub use value::{Record, Row, Value};
