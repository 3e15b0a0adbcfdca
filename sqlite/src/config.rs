//! Store configuration.
//!
//! Defines the YAML-serializable configuration for the database path, the
//! pragmas applied on every open, and the compiled-statement cache size.
//! Every field has a default, so a partial file (or none at all) is valid.
//!
//! # Example YAML
//!
//! ```yaml
//! path: task_manager.db
//! statement_cache_capacity: 64
//! pragmas:
//!   foreign_keys: true
//!   journal_mode: WAL
//!   synchronous: NORMAL
//!   cache_size: -64000
//!   busy_timeout_ms: 5000
//! ```

use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Database file used when no path is configured.
pub const DEFAULT_DATABASE_PATH: &str = "task_manager.db";

/// SQLite journal modes accepted by `PRAGMA journal_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JournalMode {
    /// Rollback journal deleted at the end of each transaction.
    Delete,
    /// Rollback journal truncated instead of deleted.
    Truncate,
    /// Rollback journal header zeroed instead of deleted.
    Persist,
    /// Rollback journal kept in memory.
    Memory,
    /// Write-ahead log.
    Wal,
    /// No journal; transactions cannot be rolled back reliably.
    Off,
}

impl JournalMode {
    /// Returns the keyword used in the pragma statement.
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Delete => "DELETE",
            Self::Truncate => "TRUNCATE",
            Self::Persist => "PERSIST",
            Self::Memory => "MEMORY",
            Self::Wal => "WAL",
            Self::Off => "OFF",
        }
    }
}

/// SQLite durability levels accepted by `PRAGMA synchronous`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Synchronous {
    /// Hand writes to the OS without syncing.
    Off,
    /// Sync at critical moments only; safe with WAL.
    Normal,
    /// Sync after every transaction.
    Full,
    /// Like `Full`, and also sync the directory after unlinking a journal.
    Extra,
}

impl Synchronous {
    /// Returns the keyword used in the pragma statement.
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Normal => "NORMAL",
            Self::Full => "FULL",
            Self::Extra => "EXTRA",
        }
    }
}

/// Pragmas applied to every connection right after it is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PragmaConfig {
    /// Enforce foreign key constraints.
    pub foreign_keys: bool,
    /// Journal mode.
    pub journal_mode: JournalMode,
    /// Durability level.
    pub synchronous: Synchronous,
    /// Page cache hint. Negative values are KiB, positive values are pages.
    pub cache_size: i64,
    /// How long a statement waits on a locked database before failing.
    pub busy_timeout_ms: u64,
}

impl Default for PragmaConfig {
    fn default() -> Self {
        Self {
            foreign_keys: true,
            journal_mode: JournalMode::Wal,
            synchronous: Synchronous::Normal,
            cache_size: -64_000,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Top-level store configuration.
///
/// # Examples
///
/// ```
/// use questlog_sqlite::{JournalMode, StoreConfig};
///
/// let config: StoreConfig = serde_yaml::from_str("path: quests.db").unwrap();
/// assert_eq!(config.path.to_str(), Some("quests.db"));
/// assert_eq!(config.pragmas.journal_mode, JournalMode::Wal);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file opened by [`Store::open`](crate::Store::open).
    pub path: PathBuf,
    /// Pragmas applied on open.
    pub pragmas: PragmaConfig,
    /// Number of compiled statements kept per connection.
    pub statement_cache_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DATABASE_PATH),
            pragmas: PragmaConfig::default(),
            statement_cache_capacity: 64,
        }
    }
}

impl StoreConfig {
    /// Returns the default configuration pointed at `path`.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`Io`](crate::StoreError::Io) if the file cannot be read, or
    /// [`Config`](crate::StoreError::Config) if parsing fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);
        let config = serde_yaml::from_reader(reader)?;
        Ok(config)
    }

    /// Saves the configuration as YAML.
    ///
    /// # Errors
    ///
    /// Returns [`Io`](crate::StoreError::Io) if the file cannot be written,
    /// or [`Config`](crate::StoreError::Config) if serialization fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let writer = BufWriter::new(file);
        serde_yaml::to_writer(writer, self)?;
        Ok(())
    }
}
