//! Owned SQLite connection plus file-level maintenance.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{PragmaConfig, StoreConfig};
use crate::error::{Result, StoreError};

/// Result of a file backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupReport {
    /// Destination file.
    pub path: PathBuf,
    /// Size of the copy in bytes.
    pub bytes: u64,
    /// Lowercase hex SHA-256 of the copy.
    pub sha256: String,
}

/// Exclusive owner of one open database connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    conn: Connection,
    path: PathBuf,
}

impl ConnectionHandle {
    /// Opens (or creates) the database at `path` and applies the configured
    /// pragmas.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the file cannot be opened or a
    /// pragma is rejected.
    pub fn open(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let wrap = |source: rusqlite::Error| StoreError::Connection {
            path: path.clone(),
            source,
        };

        let conn = Connection::open(&path).map_err(wrap)?;
        configure(&conn, &config.pragmas).map_err(wrap)?;
        conn.set_prepared_statement_cache_capacity(config.statement_cache_capacity);

        info!(path = %path.display(), "database opened");
        Ok(Self { conn, path })
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Path the connection was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rowid of the most recent successful insert on this connection.
    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    /// Copies the database file to `dest`.
    ///
    /// The WAL is checkpointed first so the copy is self-contained. Must not
    /// be called while a transaction is open.
    pub fn backup_to(&self, dest: impl AsRef<Path>) -> Result<BackupReport> {
        let dest = dest.as_ref();
        // Returns a (busy, log, checkpointed) row, so it cannot go through execute_batch.
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;

        let bytes = fs::copy(&self.path, dest)?;
        let mut hasher = Sha256::new();
        io::copy(&mut File::open(dest)?, &mut hasher)?;
        let sha256 = format!("{:x}", hasher.finalize());

        info!(dest = %dest.display(), bytes, "database backed up");
        Ok(BackupReport {
            path: dest.to_path_buf(),
            bytes,
            sha256,
        })
    }

    /// Rebuilds the database file, reclaiming free pages.
    pub fn vacuum(&self) -> Result<()> {
        self.conn.execute_batch("VACUUM")?;
        debug!("vacuum complete");
        Ok(())
    }

    /// Runs `PRAGMA integrity_check`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Integrity`] with the reported problems unless
    /// the check yields exactly `ok`.
    pub fn integrity_check(&self) -> Result<()> {
        let mut stmt = self.conn.prepare("PRAGMA integrity_check")?;
        let lines = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if lines.len() == 1 && lines[0] == "ok" {
            return Ok(());
        }
        let report = if lines.is_empty() {
            "no result".to_string()
        } else {
            lines.join("; ")
        };
        Err(StoreError::Integrity(report))
    }

    /// Closes the connection, surfacing the engine's close error.
    pub fn close(self) -> Result<()> {
        let path = self.path;
        match self.conn.close() {
            Ok(()) => {
                info!(path = %path.display(), "database closed");
                Ok(())
            }
            Err((_conn, e)) => {
                warn!(path = %path.display(), error = %e, "database close failed");
                Err(StoreError::Connection { path, source: e })
            }
        }
    }
}

fn configure(conn: &Connection, pragmas: &PragmaConfig) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", pragmas.foreign_keys)?;
    // journal_mode answers with the mode actually in effect; in-memory
    // databases report "memory" whatever was asked for.
    let mode: String = conn.pragma_update_and_check(
        None,
        "journal_mode",
        pragmas.journal_mode.as_sql(),
        |row| row.get(0),
    )?;
    conn.pragma_update(None, "synchronous", pragmas.synchronous.as_sql())?;
    conn.pragma_update(None, "cache_size", pragmas.cache_size)?;
    conn.busy_timeout(Duration::from_millis(pragmas.busy_timeout_ms))?;
    debug!(journal_mode = %mode, "pragmas applied");
    Ok(())
}
