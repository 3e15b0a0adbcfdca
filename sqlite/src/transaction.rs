//! Transaction state machine.
//!
//! Transactions do not nest: `begin` while active is refused rather than
//! folded into the outer transaction. Statements run through the
//! [`QueryExecutor`], so `BEGIN`/`COMMIT`/`ROLLBACK` count as queries.

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::{Result, TransactionError};
use crate::executor::QueryExecutor;

/// Whether a transaction is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionState {
    /// No transaction; statements autocommit.
    #[default]
    Idle,
    /// A transaction is open and awaiting commit or rollback.
    Active,
}

/// Tracks the transaction state and issues the matching statements.
#[derive(Debug, Default)]
pub struct TransactionController {
    state: TransactionState,
}

impl TransactionController {
    /// Creates an idle controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Returns `true` while a transaction is open.
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Idle → Active.
    ///
    /// # Errors
    ///
    /// [`TransactionError::AlreadyActive`] if a transaction is open (the
    /// state is left unchanged), or the engine error from `BEGIN`.
    pub fn begin(&mut self, exec: &mut QueryExecutor<'_>) -> Result<()> {
        if self.is_active() {
            warn!("begin refused: a transaction is already active");
            return Err(TransactionError::AlreadyActive.into());
        }
        exec.execute("BEGIN TRANSACTION")?;
        self.state = TransactionState::Active;
        debug!("transaction started");
        Ok(())
    }

    /// Active → Idle, keeping the changes.
    ///
    /// # Errors
    ///
    /// [`TransactionError::NotActive`] if nothing is open, or the engine
    /// error from `COMMIT` (the transaction then stays active).
    pub fn commit(&mut self, exec: &mut QueryExecutor<'_>) -> Result<()> {
        if !self.is_active() {
            warn!("commit refused: no active transaction");
            return Err(TransactionError::NotActive.into());
        }
        exec.execute("COMMIT TRANSACTION")?;
        self.state = TransactionState::Idle;
        debug!("transaction committed");
        Ok(())
    }

    /// Active → Idle, discarding the changes.
    ///
    /// # Errors
    ///
    /// [`TransactionError::NotActive`] if nothing is open, or the engine
    /// error from `ROLLBACK`.
    pub fn rollback(&mut self, exec: &mut QueryExecutor<'_>) -> Result<()> {
        if !self.is_active() {
            warn!("rollback refused: no active transaction");
            return Err(TransactionError::NotActive.into());
        }
        let result = exec.execute("ROLLBACK TRANSACTION");
        // Back in autocommit means the transaction is gone, whatever ROLLBACK reported.
        if result.is_ok() || exec.connection().is_autocommit() {
            self.state = TransactionState::Idle;
        }
        result?;
        debug!("transaction rolled back");
        Ok(())
    }

    /// Follows the engine's view of the transaction.
    ///
    /// Drops back to Idle after a raw `COMMIT` or an automatic rollback on
    /// `SQLITE_FULL`, and becomes Active after a raw `BEGIN`.
    pub(crate) fn sync(&mut self, conn: &Connection) {
        match (self.state, conn.is_autocommit()) {
            (TransactionState::Active, true) => {
                debug!("transaction ended by the engine");
                self.state = TransactionState::Idle;
            }
            (TransactionState::Idle, false) => {
                debug!("transaction opened outside the controller");
                self.state = TransactionState::Active;
            }
            _ => {}
        }
    }

    /// Rollback that cannot be refused, used on teardown and unwinding.
    ///
    /// Also covers a transaction opened with a raw `BEGIN` that the
    /// controller never saw.
    pub(crate) fn force_rollback(&mut self, conn: &Connection) {
        let open = self.is_active() || !conn.is_autocommit();
        self.state = TransactionState::Idle;
        if !open {
            return;
        }
        match conn.execute_batch("ROLLBACK TRANSACTION") {
            Ok(()) => debug!("open transaction rolled back on teardown"),
            Err(e) => warn!(error = %e, "forced rollback failed"),
        }
    }
}

/// Runs `f` inside a savepoint, releasing it on success and rolling it back
/// on error.
///
/// Works both inside an open transaction and in autocommit mode, where the
/// savepoint behaves like `BEGIN DEFERRED`.
pub(crate) fn with_savepoint<T>(
    conn: &Connection,
    name: &str,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    conn.execute_batch(&format!("SAVEPOINT {name}"))?;
    match f() {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE {name}"))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(e) = conn.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}")) {
                warn!(savepoint = name, error = %e, "savepoint rollback failed");
            }
            Err(err)
        }
    }
}
