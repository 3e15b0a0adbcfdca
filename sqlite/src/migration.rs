//! Schema version lifecycle.
//!
//! The version lives in `PRAGMA user_version`, which a fresh database
//! reports as 0. [`Migrator`] applies the ordered [`MigrationStep`]s above
//! the current version, each inside its own savepoint together with the
//! version bump, so a failing step leaves the database at the previous
//! version.
//!
//! # Example
//!
//! ```no_run
//! use questlog_sqlite::Migrator;
//! use rusqlite::Connection;
//!
//! let conn = Connection::open("task_manager.db").unwrap();
//! let migrator = Migrator::new(&conn);
//!
//! let report = migrator.up(None).unwrap();
//! println!("schema at v{}", report.to);
//!
//! let status = migrator.status().unwrap();
//! assert!(status.tables_exist);
//! ```

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use tracing::info;

use crate::error::{Result, StoreError};
use crate::schema::{self, TABLE_NAMES};
use crate::transaction::with_savepoint;

/// One forward schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStep {
    /// Version the database is at after this step.
    pub version: u32,
    /// Human readable summary.
    pub description: String,
    /// Statements to run.
    pub sql: String,
}

impl MigrationStep {
    /// Creates a step.
    pub fn new(version: u32, description: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            version,
            description: description.into(),
            sql: sql.into(),
        }
    }
}

/// The built-in steps, oldest first.
pub fn default_steps() -> Vec<MigrationStep> {
    vec![
        MigrationStep::new(1, "baseline schema", schema::generate_schema_sql()),
        MigrationStep::new(
            2,
            "index completion history and due reminders",
            "CREATE INDEX IF NOT EXISTS idx_tasks_completed_date ON tasks(completed_date);\n\
             CREATE INDEX IF NOT EXISTS idx_reminders_due ON reminders(enabled, trigger_time);\n",
        ),
    ]
}

/// A step that was applied by [`Migrator::up`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    /// Version reached.
    pub version: u32,
    /// Step summary.
    pub description: String,
    /// RFC 3339 timestamp of when the step committed.
    pub applied_at: String,
}

/// Outcome of [`Migrator::up`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Version before the run.
    pub from: u32,
    /// Version after the run.
    pub to: u32,
    /// Steps applied, in order. Empty when already up to date.
    pub applied: Vec<AppliedMigration>,
}

/// Snapshot of the schema state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    /// Whether every bootstrapped table exists.
    pub tables_exist: bool,
    /// Version recorded in the database.
    pub schema_version: u32,
    /// Newest version this build knows about.
    pub latest_version: u32,
    /// Rows in `tasks`.
    pub task_count: u64,
    /// Rows in `projects`.
    pub project_count: u64,
    /// Rows in `reminders`.
    pub reminder_count: u64,
    /// Rows in `achievements`.
    pub achievement_count: u64,
}

impl MigrationStatus {
    /// Returns `true` if no step is pending.
    pub fn is_current(&self) -> bool {
        self.schema_version == self.latest_version
    }
}

/// Applies and reverts schema versions on a borrowed connection.
pub struct Migrator<'c> {
    conn: &'c Connection,
    steps: Vec<MigrationStep>,
}

impl<'c> Migrator<'c> {
    /// Creates a migrator with the built-in steps.
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            steps: default_steps(),
        }
    }

    /// Creates a migrator with custom steps.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Migration`] unless the versions run 1, 2, 3…
    /// without gaps.
    pub fn with_steps(conn: &'c Connection, steps: Vec<MigrationStep>) -> Result<Self> {
        for (idx, step) in steps.iter().enumerate() {
            let expected = idx as u32 + 1;
            if step.version != expected {
                return Err(StoreError::Migration(format!(
                    "step '{}' has version {}, expected {expected}",
                    step.description, step.version
                )));
            }
        }
        Ok(Self { conn, steps })
    }

    /// Version recorded in the database.
    pub fn current_version(&self) -> Result<u32> {
        let version: u32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;
        Ok(version)
    }

    /// Newest version known to this migrator.
    pub fn latest_version(&self) -> u32 {
        self.steps.last().map_or(0, |step| step.version)
    }

    /// Applies every pending step up to `target` (default: latest).
    ///
    /// A target at or below the current version is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Migration`] if `target` is unknown, if the
    /// database is newer than this build, or if a step fails. Steps applied
    /// before the failing one stay applied.
    pub fn up(&self, target: Option<u32>) -> Result<MigrationReport> {
        let latest = self.latest_version();
        let target = target.unwrap_or(latest);
        if target > latest {
            return Err(StoreError::Migration(format!(
                "unknown target version {target}; latest is {latest}"
            )));
        }

        let from = self.current_version()?;
        if from > latest {
            return Err(StoreError::Migration(format!(
                "database schema version {from} is newer than supported version {latest}"
            )));
        }

        let mut applied = Vec::new();
        for step in self
            .steps
            .iter()
            .filter(|s| s.version > from && s.version <= target)
        {
            with_savepoint(self.conn, "questlog_migrate", || {
                self.conn.execute_batch(&step.sql).map_err(|e| {
                    StoreError::Migration(format!(
                        "step {} ({}) failed: {e}",
                        step.version, step.description
                    ))
                })?;
                self.set_version(step.version)
            })?;
            info!(version = step.version, description = %step.description, "migration applied");
            applied.push(AppliedMigration {
                version: step.version,
                description: step.description.clone(),
                applied_at: Utc::now().to_rfc3339(),
            });
        }

        Ok(MigrationReport {
            from,
            to: applied.last().map_or(from, |a| a.version),
            applied,
        })
    }

    /// Drops every table and resets the version to 0.
    ///
    /// Safe on a database that was never migrated.
    pub fn down(&self) -> Result<()> {
        with_savepoint(self.conn, "questlog_down", || {
            schema::drop_tables(self.conn)?;
            self.set_version(0)
        })?;
        info!("schema reset to version 0");
        Ok(())
    }

    /// Reports the version and row counts of the main tables.
    pub fn status(&self) -> Result<MigrationStatus> {
        let mut tables_exist = true;
        for table in TABLE_NAMES {
            if !schema::table_exists(self.conn, table)? {
                tables_exist = false;
                break;
            }
        }

        let mut status = MigrationStatus {
            tables_exist,
            schema_version: self.current_version()?,
            latest_version: self.latest_version(),
            task_count: 0,
            project_count: 0,
            reminder_count: 0,
            achievement_count: 0,
        };
        if tables_exist {
            status.task_count = self.count_rows("tasks")?;
            status.project_count = self.count_rows("projects")?;
            status.reminder_count = self.count_rows("reminders")?;
            status.achievement_count = self.count_rows("achievements")?;
        }
        Ok(status)
    }

    fn set_version(&self, version: u32) -> Result<()> {
        self.conn.pragma_update(None, "user_version", version)?;
        Ok(())
    }

    fn count_rows(&self, table: &str) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
