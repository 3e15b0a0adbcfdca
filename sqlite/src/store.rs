//! Thread-safe facade over the single database connection.
//!
//! A [`Store`] serializes every operation behind one mutex that guards the
//! connection, the statement cache, the transaction state, the recorded
//! error and the integrity write-block. Query counters live outside the
//! lock so they can be read without waiting on a running statement.
//!
//! Share a store between threads with `Arc<Store>`. Dropping the last
//! handle rolls back any open transaction, finalizes cached statements and
//! closes the connection.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{info, warn};

use crate::cache::{PreparedStatement, StatementCache};
use crate::config::StoreConfig;
use crate::connection::{BackupReport, ConnectionHandle};
use crate::error::{Result, StoreError, TransactionError};
use crate::executor::{QueryExecutor, RowIter};
use crate::migration::{MigrationReport, MigrationStatus, Migrator};
use crate::schema;
use crate::stats::{QueryStats, StatsSnapshot};
use crate::transaction::{TransactionController, TransactionState};
use crate::value::{Param, Record, RowView};

fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("store mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

#[derive(Debug, Clone)]
struct LastError {
    code: i32,
    message: String,
}

struct Inner {
    handle: Option<ConnectionHandle>,
    path: PathBuf,
    cache: StatementCache,
    tx: TransactionController,
    last_error: Option<LastError>,
    /// Integrity report that currently blocks writes.
    write_block: Option<String>,
}

impl Inner {
    fn handle(&self) -> Result<&ConnectionHandle> {
        self.handle.as_ref().ok_or(StoreError::NotOpen)
    }

    /// Splits the state into an executor and the transaction controller.
    fn parts<'a>(
        &'a mut self,
        stats: &'a QueryStats,
    ) -> Result<(QueryExecutor<'a>, &'a mut TransactionController)> {
        let conn = self.handle.as_ref().ok_or(StoreError::NotOpen)?.connection();
        self.tx.sync(conn);
        let exec = QueryExecutor::new(conn, &mut self.cache, stats)
            .with_write_block(self.write_block.as_deref());
        Ok((exec, &mut self.tx))
    }

    fn check_writable(&self) -> Result<()> {
        match &self.write_block {
            Some(report) => Err(StoreError::Integrity(report.clone())),
            None => Ok(()),
        }
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        self.last_error = result.as_ref().err().map(|e| LastError {
            code: e.code(),
            message: e.to_string(),
        });
        result
    }

    /// Opens `self.path` and installs the handle.
    fn reopen(&mut self, config: &StoreConfig) -> Result<&Connection> {
        let handle = ConnectionHandle::open(&self.path, config)?;
        Ok(self.handle.insert(handle).connection())
    }

    /// Rolls back, finalizes cached statements and closes the connection.
    fn shutdown(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.tx.force_rollback(handle.connection());
        self.cache.clear(handle.connection());
        handle.close()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "failed to close database on drop");
        }
    }
}

/// Creates the tables and brings the schema to the latest version.
fn bootstrap(conn: &Connection) -> Result<()> {
    schema::create_tables(conn)?;
    Migrator::new(conn).up(None)?;
    Ok(())
}

/// Sibling file a backup is staged in before it replaces the database.
fn staging_path(path: &Path) -> PathBuf {
    let mut staged = path.as_os_str().to_owned();
    staged.push("-restore");
    PathBuf::from(staged)
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Side files SQLite keeps next to a database in WAL mode.
fn side_files(path: &Path) -> [PathBuf; 2] {
    let mut wal = path.as_os_str().to_owned();
    wal.push("-wal");
    let mut shm = path.as_os_str().to_owned();
    shm.push("-shm");
    [PathBuf::from(wal), PathBuf::from(shm)]
}

/// Single-connection persistence facade.
///
/// Every fallible operation returns a [`Result`] and also records its
/// outcome: a failure is kept for [`last_error_message`](Self::last_error_message)
/// and [`last_error_code`](Self::last_error_code), a success clears it.
///
/// Before [`initialize`](Self::initialize) every operation fails with
/// [`StoreError::NotOpen`] and no query counter moves.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use questlog_sqlite::{Store, StoreConfig, params};
///
/// let store = Arc::new(Store::open(StoreConfig::with_path("task_manager.db")).unwrap());
///
/// store
///     .execute_params("INSERT INTO tasks (title, priority) VALUES (?, ?)", params!["Write report", 2])
///     .unwrap();
///
/// let open = store
///     .query("SELECT id, title FROM tasks WHERE completed = ?", params![false])
///     .unwrap();
/// println!("{} open tasks", open.len());
/// ```
pub struct Store {
    inner: Mutex<Inner>,
    stats: QueryStats,
    config: StoreConfig,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl Store {
    /// Creates a store that is not connected yet.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                handle: None,
                path: config.path.clone(),
                cache: StatementCache::with_capacity(config.statement_cache_capacity),
                tx: TransactionController::new(),
                last_error: None,
                write_block: None,
            }),
            stats: QueryStats::new(),
            config,
        }
    }

    /// Creates a store and initializes it at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let store = Self::new(config);
        let path = store.config.path.clone();
        store.initialize(path)?;
        Ok(store)
    }

    /// Creates a store attached to the existing database at the configured
    /// path, leaving its schema as it is.
    pub fn open_existing(config: StoreConfig) -> Result<Self> {
        let store = Self::new(config);
        let path = store.config.path.clone();
        store.initialize_existing(path)?;
        Ok(store)
    }

    /// Configuration the store was created with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        acquire_lock(&self.inner)
    }

    /// Runs `f` under the lock and records its outcome.
    fn locked<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        let mut inner = self.lock();
        let result = f(&mut inner);
        inner.track(result)
    }

    // ---- lifecycle -------------------------------------------------------

    /// Opens the database at `path`, applies the pragmas and bootstraps the
    /// schema. A previously open connection is closed first.
    ///
    /// If bootstrapping fails the connection stays open and the schema
    /// error is returned.
    pub fn initialize(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.locked(|inner| {
            if let Err(e) = inner.shutdown() {
                warn!(error = %e, "previous connection did not close cleanly");
            }
            inner.path = path.to_path_buf();
            bootstrap(inner.reopen(&self.config)?)
        })
    }

    /// Opens the database at `path` with the configured pragmas but without
    /// creating tables or applying migrations.
    ///
    /// For inspection and maintenance of a file whose schema must not be
    /// touched. Fails with [`StoreError::Io`] (`NotFound`) instead of
    /// creating a missing file; the previous connection is then kept.
    pub fn initialize_existing(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.locked(|inner| {
            if !path.is_file() {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("database file not found: {}", path.display()),
                )));
            }
            if let Err(e) = inner.shutdown() {
                warn!(error = %e, "previous connection did not close cleanly");
            }
            inner.path = path.to_path_buf();
            inner.reopen(&self.config)?;
            Ok(())
        })
    }

    /// Rolls back any open transaction, finalizes cached statements and
    /// closes the connection. Closing a closed store is a no-op.
    pub fn close(&self) -> Result<()> {
        self.locked(Inner::shutdown)
    }

    /// Returns `true` while a connection is open.
    pub fn is_open(&self) -> bool {
        self.lock().handle.is_some()
    }

    /// Path of the open database, or the configured one if none is open.
    pub fn database_path(&self) -> PathBuf {
        let inner = self.lock();
        match &inner.handle {
            Some(handle) => handle.path().to_path_buf(),
            None => inner.path.clone(),
        }
    }

    /// Rowid of the most recent successful insert.
    pub fn last_insert_id(&self) -> Result<i64> {
        self.locked(|inner| Ok(inner.handle()?.last_insert_rowid()))
    }

    // ---- statements ------------------------------------------------------

    /// Runs statements with no parameters and no result rows.
    pub fn execute(&self, sql: &str) -> Result<()> {
        self.locked(|inner| {
            inner.handle()?;
            inner.check_writable()?;
            let (mut exec, _) = inner.parts(&self.stats)?;
            exec.execute(sql)
        })
    }

    /// Runs one statement with typed positional parameters.
    pub fn execute_params(&self, sql: &str, params: &[Param]) -> Result<()> {
        self.locked(|inner| {
            inner.handle()?;
            inner.check_writable()?;
            let (mut exec, _) = inner.parts(&self.stats)?;
            exec.execute_params(sql, params)
        })
    }

    /// Runs one statement with every parameter bound as text.
    ///
    /// Integers and reals are coerced through text and stored according to
    /// column affinity. Prefer [`execute_params`](Self::execute_params).
    pub fn execute_parameterized<S: AsRef<str>>(&self, sql: &str, params: &[S]) -> Result<()> {
        self.locked(|inner| {
            inner.handle()?;
            inner.check_writable()?;
            let (mut exec, _) = inner.parts(&self.stats)?;
            exec.execute_text(sql, params)
        })
    }

    /// Streams rows into `callback` until it returns `false` or rows run
    /// out. Returns the number of rows handed to the callback.
    ///
    /// The callback runs with the store locked and must not call back into
    /// the store.
    pub fn execute_query<F>(&self, sql: &str, callback: F) -> Result<usize>
    where
        F: FnMut(&RowView<'_, '_>) -> bool,
    {
        self.locked(|inner| {
            let (mut exec, _) = inner.parts(&self.stats)?;
            exec.for_each_row(sql, callback)
        })
    }

    /// Runs a query and collects every row.
    pub fn query(&self, sql: &str, params: &[Param]) -> Result<Vec<Record>> {
        self.locked(|inner| {
            let (mut exec, _) = inner.parts(&self.stats)?;
            exec.query(sql, params)
        })
    }

    /// Runs a query and hands `f` an iterator over its rows. Rows that `f`
    /// does not pull are never read.
    ///
    /// `f` runs with the store locked and must not call back into the store.
    pub fn query_with<R, F>(&self, sql: &str, params: &[Param], f: F) -> Result<R>
    where
        F: FnOnce(&mut RowIter<'_>) -> R,
    {
        self.locked(|inner| {
            let (mut exec, _) = inner.parts(&self.stats)?;
            exec.query_with(sql, params, f)
        })
    }

    // ---- statement cache -------------------------------------------------

    /// Returns the cached statement for `sql`, preparing it on first use.
    pub fn prepare(&self, sql: &str) -> Result<Arc<PreparedStatement>> {
        self.locked(|inner| {
            let (mut exec, _) = inner.parts(&self.stats)?;
            exec.prepare(sql)
        })
    }

    /// Finalizes and forgets the cached statement for `sql`.
    ///
    /// Returns `false` if nothing was cached under that text.
    pub fn release_statement(&self, sql: &str) -> bool {
        let mut inner = self.lock();
        let inner = &mut *inner;
        match &inner.handle {
            Some(handle) => inner.cache.release(handle.connection(), sql),
            None => false,
        }
    }

    /// Finalizes every cached statement.
    pub fn clear_statement_cache(&self) {
        let mut inner = self.lock();
        let inner = &mut *inner;
        if let Some(handle) = &inner.handle {
            inner.cache.clear(handle.connection());
        }
    }

    /// The cached statement for `sql`, without preparing it.
    pub fn cached_statement(&self, sql: &str) -> Option<Arc<PreparedStatement>> {
        self.lock().cache.get(sql)
    }

    /// Number of cached statements.
    pub fn cached_statement_count(&self) -> usize {
        self.lock().cache.len()
    }

    // ---- transactions ----------------------------------------------------

    /// Starts a transaction. Transactions do not nest.
    ///
    /// Other threads may interleave statements between `begin` and
    /// `commit`; use [`with_transaction`](Self::with_transaction) to hold
    /// the lock for the whole unit.
    pub fn begin_transaction(&self) -> Result<()> {
        self.locked(|inner| {
            inner.handle()?;
            inner.check_writable()?;
            let (mut exec, tx) = inner.parts(&self.stats)?;
            tx.begin(&mut exec)
        })
    }

    /// Commits the open transaction.
    pub fn commit_transaction(&self) -> Result<()> {
        self.locked(|inner| {
            let (mut exec, tx) = inner.parts(&self.stats)?;
            tx.commit(&mut exec)
        })
    }

    /// Rolls back the open transaction.
    pub fn rollback_transaction(&self) -> Result<()> {
        self.locked(|inner| {
            let (mut exec, tx) = inner.parts(&self.stats)?;
            tx.rollback(&mut exec)
        })
    }

    /// Current transaction state.
    pub fn transaction_state(&self) -> TransactionState {
        let mut inner = self.lock();
        let inner = &mut *inner;
        if let Some(handle) = &inner.handle {
            inner.tx.sync(handle.connection());
        }
        inner.tx.state()
    }

    /// Returns `true` while a transaction is open.
    pub fn is_in_transaction(&self) -> bool {
        self.transaction_state() == TransactionState::Active
    }

    /// Runs `f` inside a transaction while holding the store lock.
    ///
    /// Commits when `f` returns `Ok`; rolls back when it returns `Err`, when
    /// the commit fails, or when `f` panics. `f` must use the scope it is
    /// given: calling back into the store would deadlock.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use questlog_sqlite::{Store, StoreConfig, params};
    ///
    /// let store = Store::open(StoreConfig::default()).unwrap();
    /// let project_id = store
    ///     .with_transaction(|tx| {
    ///         tx.execute_params("INSERT INTO projects (name) VALUES (?)", params!["Garden"])?;
    ///         let id = tx.last_insert_id();
    ///         tx.execute_params("INSERT INTO tasks (title, project_id) VALUES (?, ?)", params!["Dig", id])?;
    ///         Ok(id)
    ///     })
    ///     .unwrap();
    /// # let _ = project_id;
    /// ```
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut TransactionScope<'_, '_>) -> Result<T>,
    {
        self.locked(|inner| {
            inner.handle()?;
            inner.check_writable()?;
            let (mut exec, tx) = inner.parts(&self.stats)?;
            tx.begin(&mut exec)?;

            let mut guard = RollbackGuard { exec, tx };
            let value = f(&mut TransactionScope {
                exec: &mut guard.exec,
            })?;
            guard.tx.commit(&mut guard.exec)?;
            Ok(value)
        })
    }

    // ---- schema ----------------------------------------------------------

    /// Creates any missing table and applies pending migrations.
    pub fn create_tables(&self) -> Result<()> {
        self.locked(|inner| bootstrap(inner.handle()?.connection()))
    }

    /// Drops every table and resets the schema version to 0.
    pub fn drop_tables(&self) -> Result<()> {
        self.locked(|inner| {
            inner.check_writable()?;
            Migrator::new(inner.handle()?.connection()).down()
        })
    }

    /// Returns `true` if a table called `name` exists.
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        self.locked(|inner| schema::table_exists(inner.handle()?.connection(), name))
    }

    /// Names of all user tables, sorted.
    pub fn table_names(&self) -> Result<Vec<String>> {
        self.locked(|inner| schema::table_names(inner.handle()?.connection()))
    }

    // ---- errors ----------------------------------------------------------

    /// Message of the most recent failure, if the last operation failed.
    pub fn last_error_message(&self) -> Option<String> {
        self.lock().last_error.as_ref().map(|e| e.message.clone())
    }

    /// Code of the most recent failure; 0 (`SQLITE_OK`) when the last
    /// operation succeeded.
    pub fn last_error_code(&self) -> i32 {
        self.lock().last_error.as_ref().map_or(0, |e| e.code)
    }

    /// Returns `true` if the last operation failed.
    pub fn has_error(&self) -> bool {
        self.lock().last_error.is_some()
    }

    // ---- statistics ------------------------------------------------------

    /// Statements attempted since the last reset.
    pub fn total_query_count(&self) -> u64 {
        self.stats.total()
    }

    /// Statements that failed since the last reset.
    pub fn failed_query_count(&self) -> u64 {
        self.stats.failed()
    }

    /// Percentage of successful statements, 100 when nothing ran.
    pub fn success_rate(&self) -> f64 {
        self.stats.success_rate()
    }

    /// Zeroes the counters. Transactions and cached statements are untouched.
    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    /// Consistent view of all counters.
    pub fn statistics(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    // ---- maintenance -----------------------------------------------------

    /// Copies the database file to `dest`.
    ///
    /// Refused while a transaction is open, since uncommitted changes would
    /// not be in the copy.
    pub fn backup_database(&self, dest: impl AsRef<Path>) -> Result<BackupReport> {
        let dest = dest.as_ref();
        self.locked(|inner| {
            let handle = inner.handle.as_ref().ok_or(StoreError::NotOpen)?;
            inner.tx.sync(handle.connection());
            if inner.tx.is_active() {
                return Err(TransactionError::AlreadyActive.into());
            }
            handle.backup_to(dest)
        })
    }

    /// Replaces the database file with the backup at `src` and reopens it.
    ///
    /// The backup is copied next to the database first and renamed over it
    /// once the copy is complete. If the copy or the swap fails, the current
    /// database stays in place and open. Any open transaction is rolled
    /// back. A successful restore lifts the integrity write-block.
    pub fn restore_database(&self, src: impl AsRef<Path>) -> Result<()> {
        let src = src.as_ref();
        self.locked(|inner| {
            inner.handle()?;
            if !src.is_file() {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("backup file not found: {}", src.display()),
                )));
            }

            let path = inner.path.clone();
            let staged = staging_path(&path);
            if let Err(e) = fs::copy(src, &staged) {
                if let Err(cleanup) = remove_if_present(&staged) {
                    warn!(path = %staged.display(), error = %cleanup, "could not remove staged backup");
                }
                return Err(e.into());
            }

            if let Err(e) = inner.shutdown() {
                warn!(error = %e, "database did not close cleanly before restore");
            }
            let swapped = side_files(&path)
                .iter()
                .try_for_each(|side| remove_if_present(side))
                .and_then(|()| fs::rename(&staged, &path));
            if let Err(e) = swapped {
                warn!(error = %e, "restore failed; reopening the current database");
                if let Err(cleanup) = remove_if_present(&staged) {
                    warn!(path = %staged.display(), error = %cleanup, "could not remove staged backup");
                }
                inner.reopen(&self.config)?;
                return Err(e.into());
            }

            bootstrap(inner.reopen(&self.config)?)?;
            inner.write_block = None;
            info!(from = %src.display(), to = %path.display(), "database restored");
            Ok(())
        })
    }

    /// Rebuilds the database file, reclaiming free pages.
    pub fn vacuum_database(&self) -> Result<()> {
        self.locked(|inner| {
            let handle = inner.handle()?;
            inner.check_writable()?;
            handle.vacuum()
        })
    }

    /// Runs the engine's consistency check.
    ///
    /// A failed check blocks writes (`execute`, `execute_params`,
    /// `execute_parameterized`, transactions, `drop_tables`, vacuum,
    /// migrations, and any non-read-only statement sent through the query
    /// methods) until a later check passes or a backup is restored. Reads
    /// stay available.
    pub fn check_integrity(&self) -> Result<()> {
        self.locked(|inner| {
            let result = inner.handle()?.integrity_check();
            match &result {
                Ok(()) => {
                    if inner.write_block.take().is_some() {
                        info!("integrity restored; writes unblocked");
                    }
                }
                Err(StoreError::Integrity(report)) => {
                    warn!(report = %report, "integrity check failed; writes blocked");
                    inner.write_block = Some(report.clone());
                }
                Err(_) => {}
            }
            result
        })
    }

    // ---- migrations ------------------------------------------------------

    /// Schema version recorded in the database.
    pub fn schema_version(&self) -> Result<u32> {
        self.locked(|inner| Migrator::new(inner.handle()?.connection()).current_version())
    }

    /// Applies pending migrations up to `target` (default: latest).
    pub fn migrate(&self, target: Option<u32>) -> Result<MigrationReport> {
        self.locked(|inner| {
            inner.check_writable()?;
            Migrator::new(inner.handle()?.connection()).up(target)
        })
    }

    /// Version and row counts of the main tables.
    pub fn migration_status(&self) -> Result<MigrationStatus> {
        self.locked(|inner| Migrator::new(inner.handle()?.connection()).status())
    }
}

/// Rolls back on drop unless the transaction was committed.
struct RollbackGuard<'a> {
    exec: QueryExecutor<'a>,
    tx: &'a mut TransactionController,
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        if !self.tx.is_active() {
            return;
        }
        if let Err(e) = self.tx.rollback(&mut self.exec) {
            warn!(error = %e, "rollback failed; forcing");
            self.tx.force_rollback(self.exec.connection());
        }
    }
}

/// Statement access inside [`Store::with_transaction`].
pub struct TransactionScope<'s, 'a> {
    exec: &'s mut QueryExecutor<'a>,
}

impl TransactionScope<'_, '_> {
    /// See [`Store::execute`].
    pub fn execute(&mut self, sql: &str) -> Result<()> {
        self.exec.execute(sql)
    }

    /// See [`Store::execute_params`].
    pub fn execute_params(&mut self, sql: &str, params: &[Param]) -> Result<()> {
        self.exec.execute_params(sql, params)
    }

    /// See [`Store::execute_parameterized`].
    pub fn execute_parameterized<S: AsRef<str>>(&mut self, sql: &str, params: &[S]) -> Result<()> {
        self.exec.execute_text(sql, params)
    }

    /// See [`Store::query`].
    pub fn query(&mut self, sql: &str, params: &[Param]) -> Result<Vec<Record>> {
        self.exec.query(sql, params)
    }

    /// See [`Store::query_with`].
    pub fn query_with<R, F>(&mut self, sql: &str, params: &[Param], f: F) -> Result<R>
    where
        F: FnOnce(&mut RowIter<'_>) -> R,
    {
        self.exec.query_with(sql, params, f)
    }

    /// Rowid of the most recent successful insert.
    pub fn last_insert_id(&self) -> i64 {
        self.exec.connection().last_insert_rowid()
    }
}
