//! Engine error taxonomy.
//!
//! Classification prefers the SQLite result code carried by the error and
//! only falls back to message matching for errors that have none.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Message fragments that identify a transaction conflict when no result
/// code is available.
const CONFLICT_MARKERS: &[&str] = &["transaction conflict", "conflict on", "write-write conflict"];

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Server is shutting down")]
    ShutdownInProgress,

    #[error("Database connection not initialized")]
    ConnectionNotInitialized,

    #[error("Executor is shut down")]
    PoolClosed,

    #[error("Worker queue full")]
    QueueFull,

    #[error("Worker dropped the query before completing it")]
    WorkerLost,

    #[error("Query was cancelled")]
    Cancelled,

    #[error("Query id already in flight: {0}")]
    DuplicateQueryId(String),

    #[error("{source} (gave up after {attempts} conflict retries)")]
    ConflictRetriesExhausted {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("{0}")]
    Database(#[from] rusqlite::Error),

    #[error("Arrow encoding failed: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Duplicate column name in JSON result: {0}")]
    DuplicateColumn(String),

    #[error("Result cache error: {0}")]
    Cache(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// True when the database reported that the running statement was
    /// interrupted.
    pub fn is_interrupt(&self) -> bool {
        match self {
            EngineError::Cancelled => true,
            EngineError::Database(e) => is_interrupt(e),
            _ => false,
        }
    }

    /// True for transient conflicts that are worth retrying.
    pub fn is_conflict(&self) -> bool {
        match self {
            EngineError::Database(e) => is_conflict(e),
            _ => false,
        }
    }
}

impl From<rocksdb::Error> for EngineError {
    fn from(e: rocksdb::Error) -> Self {
        EngineError::Cache(e.to_string())
    }
}

pub fn is_interrupt(err: &rusqlite::Error) -> bool {
    match err.sqlite_error_code() {
        Some(code) => code == ErrorCode::OperationInterrupted,
        None => err.to_string().to_lowercase().contains("interrupt"),
    }
}

pub fn is_conflict(err: &rusqlite::Error) -> bool {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => true,
        Some(_) => false,
        None => {
            let msg = err.to_string().to_lowercase();
            CONFLICT_MARKERS.iter().any(|marker| msg.contains(marker))
        }
    }
}
