//! SQLite persistence core for the questlog task manager.
//!
//! One embedded database file holds tasks, projects, challenges, reminders,
//! achievements, user statistics, settings and pomodoro sessions. This crate
//! owns the single connection to it and serializes access from any number
//! of threads.
//!
//! # Architecture
//!
//! - **`store`**: [`Store`], the facade every caller goes through
//! - **`connection`**: open with pragmas, backup, vacuum, integrity check
//! - **`cache`**: prepared statements keyed by exact SQL text
//! - **`transaction`**: non-nesting begin/commit/rollback state machine
//! - **`executor`**: statement execution, row callbacks and row iterators
//! - **`schema`**: idempotent bootstrap of the eight tables
//! - **`migration`**: schema versions tracked in `PRAGMA user_version`
//! - **`stats`**: lock-free query counters
//!
//! # Quick start
//!
//! ```no_run
//! use questlog_sqlite::{Store, StoreConfig, params};
//!
//! let store = Store::open(StoreConfig::with_path("task_manager.db")).unwrap();
//! assert!(store.table_exists("tasks").unwrap());
//!
//! store
//!     .execute_params("INSERT INTO tasks (title, priority) VALUES (?, ?)", params!["Plan sprint", 2])
//!     .unwrap();
//!
//! let mut titles = Vec::new();
//! store
//!     .execute_query("SELECT title FROM tasks ORDER BY id", |row| {
//!         titles.extend(row.text(0));
//!         titles.len() < 10
//!     })
//!     .unwrap();
//!
//! println!("success rate: {:.1}%", store.success_rate());
//! ```
//!
//! # Transactions
//!
//! [`Store::with_transaction`] holds the store lock for the whole unit and
//! rolls back on error or panic. The separate `begin_transaction` /
//! `commit_transaction` / `rollback_transaction` calls remain for callers
//! that drive a transaction across several calls.

mod cache;
mod config;
mod connection;
mod error;
mod executor;
mod migration;
mod schema;
mod stats;
mod store;
mod transaction;
mod value;

pub use cache::PreparedStatement;
pub use config::{DEFAULT_DATABASE_PATH, JournalMode, PragmaConfig, StoreConfig, Synchronous};
pub use connection::BackupReport;
pub use error::{NOT_OPEN_CODE, Result, StoreError, TransactionError};
pub use executor::RowIter;
pub use migration::{
    AppliedMigration, MigrationReport, MigrationStatus, MigrationStep, Migrator, default_steps,
};
pub use schema::{TABLE_NAMES, generate_drop_sql, generate_schema_sql};
pub use stats::StatsSnapshot;
pub use store::{Store, TransactionScope};
pub use transaction::TransactionState;
pub use value::{Param, Record, RowView};

/// Re-exported so callers can read [`Record`] values without depending on
/// rusqlite directly.
pub use rusqlite::types::Value;
