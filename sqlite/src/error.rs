//! Error types for the persistence core.
//!
//! [`StoreError`] covers the whole failure taxonomy: connection, schema,
//! transaction, statement and integrity failures, plus configuration and
//! file-level I/O. Every variant maps to an integer code through
//! [`StoreError::code`] so the store can report the most recent failure
//! out-of-band.

use std::path::PathBuf;

use rusqlite::ffi;
use thiserror::Error;

/// Code reported when an operation is attempted before `initialize`.
pub const NOT_OPEN_CODE: i32 = -1;

/// Illegal transaction transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// `begin` while a transaction is already active. Transactions do not nest.
    #[error("a transaction is already active")]
    AlreadyActive,

    /// `commit` or `rollback` with no active transaction.
    #[error("no active transaction")]
    NotActive,
}

/// Errors that can occur during persistence operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database file could not be opened or configured.
    #[error("failed to open database '{}': {source}", path.display())]
    Connection {
        /// Path that was being opened.
        path: PathBuf,
        /// Underlying engine error.
        #[source]
        source: rusqlite::Error,
    },

    /// An operation was attempted with no open connection.
    #[error("database not initialized")]
    NotOpen,

    /// A table in the bootstrap sequence could not be created.
    #[error("failed to create table {table}: {source}")]
    Schema {
        /// Table whose DDL failed.
        table: &'static str,
        /// Underlying engine error.
        #[source]
        source: rusqlite::Error,
    },

    /// Illegal begin/commit/rollback.
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// Prepare, bind or step failure.
    #[error("statement error: {0}")]
    Statement(#[from] rusqlite::Error),

    /// `PRAGMA integrity_check` reported something other than `ok`.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// File-level failure during backup or restore.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed or written.
    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),

    /// Schema version lifecycle failure.
    #[error("migration error: {0}")]
    Migration(String),
}

impl StoreError {
    /// Returns the integer code reported by `last_error_code`.
    ///
    /// Engine failures carry the SQLite extended result code; the remaining
    /// variants map onto the closest SQLite primary code.
    pub fn code(&self) -> i32 {
        match self {
            Self::NotOpen => NOT_OPEN_CODE,
            Self::Connection { source, .. }
            | Self::Schema { source, .. }
            | Self::Statement(source) => engine_code(source),
            Self::Transaction(_) => ffi::SQLITE_MISUSE,
            Self::Integrity(_) => ffi::SQLITE_CORRUPT,
            Self::Io(_) => ffi::SQLITE_IOERR,
            Self::Config(_) | Self::Migration(_) => ffi::SQLITE_ERROR,
        }
    }
}

fn engine_code(err: &rusqlite::Error) -> i32 {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => failure.extended_code,
        _ => ffi::SQLITE_ERROR,
    }
}

/// Convenience alias for results with [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_open_code() {
        assert_eq!(StoreError::NotOpen.code(), -1);
        assert_eq!(StoreError::NotOpen.to_string(), "database not initialized");
    }

    #[test]
    fn test_engine_error_carries_extended_code() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT NOT NULL)")
            .unwrap();
        let err = conn
            .execute("INSERT INTO t (v) VALUES (NULL)", [])
            .unwrap_err();
        let err = StoreError::from(err);
        assert_eq!(err.code(), ffi::SQLITE_CONSTRAINT_NOTNULL);
    }

    #[test]
    fn test_transaction_misuse_code() {
        let err = StoreError::from(TransactionError::NotActive);
        assert_eq!(err.code(), ffi::SQLITE_MISUSE);
        assert_eq!(err.to_string(), "transaction error: no active transaction");
    }
}
