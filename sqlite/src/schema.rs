//! Table definitions and bootstrap.
//!
//! The schema consists of 8 tables, each created with
//! `CREATE TABLE IF NOT EXISTS` together with its indexes:
//!
//! - `tasks`: to-do items, optionally attached to a project
//! - `projects`: task groups with progress tracking
//! - `challenges`: daily/weekly/monthly goals with XP rewards
//! - `reminders`: scheduled notifications, optionally tied to a task
//! - `achievements`: unlockable badges
//! - `user_stats`: streaks, XP and level
//! - `user_settings`: pomodoro durations and UI preferences
//! - `pomodoro_sessions`: focus sessions, optionally tied to a task
//!
//! Bootstrapping is idempotent by construction of the DDL. It runs inside a
//! savepoint, so a failing table leaves none of the others behind.

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::transaction::with_savepoint;

/// Names of the bootstrapped tables, in creation order.
pub const TABLE_NAMES: [&str; 8] = [
    "tasks",
    "projects",
    "challenges",
    "reminders",
    "achievements",
    "user_stats",
    "user_settings",
    "pomodoro_sessions",
];

const TASKS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_date TEXT NOT NULL DEFAULT (datetime('now')),
    updated_date TEXT NOT NULL DEFAULT (datetime('now')),
    title TEXT NOT NULL,
    description TEXT,
    priority INTEGER NOT NULL DEFAULT 1 CHECK (priority IN (0, 1, 2)),
    due_date TEXT,
    completed INTEGER NOT NULL DEFAULT 0,
    tags TEXT,
    project_id INTEGER,
    pomodoro_count INTEGER NOT NULL DEFAULT 0,
    estimated_pomodoros INTEGER NOT NULL DEFAULT 0,
    completed_date TEXT,
    reminder_time TEXT,
    deleted INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_completed ON tasks(completed);
CREATE INDEX IF NOT EXISTS idx_tasks_priority ON tasks(priority);
CREATE INDEX IF NOT EXISTS idx_tasks_due_date ON tasks(due_date);
CREATE INDEX IF NOT EXISTS idx_tasks_project_id ON tasks(project_id);
CREATE INDEX IF NOT EXISTS idx_tasks_created_date ON tasks(created_date);
CREATE INDEX IF NOT EXISTS idx_tasks_deleted ON tasks(deleted);
"#;

const PROJECTS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_date TEXT NOT NULL DEFAULT (datetime('now')),
    updated_date TEXT NOT NULL DEFAULT (datetime('now')),
    name TEXT NOT NULL,
    description TEXT,
    color_label TEXT DEFAULT '#3498db',
    progress REAL NOT NULL DEFAULT 0.0 CHECK (progress >= 0.0 AND progress <= 1.0),
    total_tasks INTEGER NOT NULL DEFAULT 0,
    completed_tasks INTEGER NOT NULL DEFAULT 0,
    target_date TEXT,
    archived INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_projects_archived ON projects(archived);
CREATE INDEX IF NOT EXISTS idx_projects_target_date ON projects(target_date);
"#;

const CHALLENGES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS challenges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_date TEXT NOT NULL DEFAULT (datetime('now')),
    updated_date TEXT NOT NULL DEFAULT (datetime('now')),
    title TEXT NOT NULL,
    description TEXT,
    type TEXT NOT NULL CHECK (type IN ('daily', 'weekly', 'monthly')),
    criteria TEXT,
    target_value INTEGER NOT NULL DEFAULT 0,
    current_value INTEGER NOT NULL DEFAULT 0,
    reward_xp INTEGER NOT NULL DEFAULT 0,
    completed INTEGER NOT NULL DEFAULT 0,
    claimed INTEGER NOT NULL DEFAULT 0,
    expiry_date TEXT,
    category TEXT CHECK (category IN ('task', 'pomodoro', 'project'))
);

CREATE INDEX IF NOT EXISTS idx_challenges_type ON challenges(type);
CREATE INDEX IF NOT EXISTS idx_challenges_completed ON challenges(completed);
CREATE INDEX IF NOT EXISTS idx_challenges_category ON challenges(category);
"#;

const REMINDERS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS reminders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_date TEXT NOT NULL DEFAULT (datetime('now')),
    updated_date TEXT NOT NULL DEFAULT (datetime('now')),
    title TEXT NOT NULL,
    message TEXT,
    trigger_time TEXT NOT NULL,
    recurrence TEXT NOT NULL DEFAULT 'once' CHECK (recurrence IN ('once', 'daily', 'weekly', 'monthly')),
    triggered INTEGER NOT NULL DEFAULT 0,
    task_id INTEGER,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_triggered TEXT,
    FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_reminders_trigger_time ON reminders(trigger_time);
CREATE INDEX IF NOT EXISTS idx_reminders_enabled ON reminders(enabled);
CREATE INDEX IF NOT EXISTS idx_reminders_task_id ON reminders(task_id);
"#;

const ACHIEVEMENTS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS achievements (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_date TEXT NOT NULL DEFAULT (datetime('now')),
    updated_date TEXT NOT NULL DEFAULT (datetime('now')),
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    icon TEXT,
    unlock_condition TEXT,
    unlocked INTEGER NOT NULL DEFAULT 0,
    unlocked_date TEXT,
    reward_xp INTEGER NOT NULL DEFAULT 0,
    category TEXT CHECK (category IN ('task', 'time', 'streak', 'special')),
    progress INTEGER NOT NULL DEFAULT 0 CHECK (progress >= 0 AND progress <= 100),
    target_value INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_achievements_unlocked ON achievements(unlocked);
CREATE INDEX IF NOT EXISTS idx_achievements_category ON achievements(category);
"#;

const USER_STATS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS user_stats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_date TEXT NOT NULL DEFAULT (datetime('now')),
    updated_date TEXT NOT NULL DEFAULT (datetime('now')),
    total_tasks_created INTEGER NOT NULL DEFAULT 0,
    total_tasks_completed INTEGER NOT NULL DEFAULT 0,
    total_pomodoros INTEGER NOT NULL DEFAULT 0,
    current_streak INTEGER NOT NULL DEFAULT 0,
    longest_streak INTEGER NOT NULL DEFAULT 0,
    total_xp INTEGER NOT NULL DEFAULT 0,
    level INTEGER NOT NULL DEFAULT 1,
    last_active_date TEXT,
    completion_rate REAL NOT NULL DEFAULT 0.0,
    achievements_unlocked INTEGER NOT NULL DEFAULT 0
);
"#;

const USER_SETTINGS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS user_settings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_date TEXT NOT NULL DEFAULT (datetime('now')),
    updated_date TEXT NOT NULL DEFAULT (datetime('now')),
    pomodoro_duration INTEGER NOT NULL DEFAULT 25,
    short_break_duration INTEGER NOT NULL DEFAULT 5,
    long_break_duration INTEGER NOT NULL DEFAULT 15,
    pomodoros_until_long_break INTEGER NOT NULL DEFAULT 4,
    sound_enabled INTEGER NOT NULL DEFAULT 1,
    notifications_enabled INTEGER NOT NULL DEFAULT 1,
    theme TEXT NOT NULL DEFAULT 'default',
    language TEXT NOT NULL DEFAULT 'zh',
    auto_start_pomodoros INTEGER NOT NULL DEFAULT 0
);
"#;

const POMODORO_SESSIONS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS pomodoro_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_date TEXT NOT NULL DEFAULT (datetime('now')),
    task_id INTEGER,
    start_time TEXT NOT NULL,
    end_time TEXT,
    duration INTEGER,
    completed INTEGER NOT NULL DEFAULT 0,
    interrupted INTEGER NOT NULL DEFAULT 0,
    interruption_reason TEXT,
    FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_pomodoro_task_id ON pomodoro_sessions(task_id);
CREATE INDEX IF NOT EXISTS idx_pomodoro_start_time ON pomodoro_sessions(start_time);
CREATE INDEX IF NOT EXISTS idx_pomodoro_completed ON pomodoro_sessions(completed);
"#;

/// DDL per table, in [`TABLE_NAMES`] order.
const TABLE_DDL: [(&str, &str); 8] = [
    ("tasks", TASKS_SQL),
    ("projects", PROJECTS_SQL),
    ("challenges", CHALLENGES_SQL),
    ("reminders", REMINDERS_SQL),
    ("achievements", ACHIEVEMENTS_SQL),
    ("user_stats", USER_STATS_SQL),
    ("user_settings", USER_SETTINGS_SQL),
    ("pomodoro_sessions", POMODORO_SESSIONS_SQL),
];

/// Tables in reverse dependency order, children before parents.
const DROP_ORDER: [&str; 8] = [
    "pomodoro_sessions",
    "user_settings",
    "user_stats",
    "achievements",
    "reminders",
    "challenges",
    "tasks",
    "projects",
];

/// Generates the complete schema script for all tables and indexes.
pub fn generate_schema_sql() -> String {
    TABLE_DDL.iter().map(|(_, sql)| *sql).collect()
}

/// Generates the script that drops every table, children first.
pub fn generate_drop_sql() -> String {
    DROP_ORDER
        .iter()
        .map(|table| format!("DROP TABLE IF EXISTS {table};\n"))
        .collect()
}

/// Creates every table and index that does not exist yet.
///
/// All-or-nothing: the first failing table aborts the sequence and rolls
/// back the ones created before it.
///
/// # Errors
///
/// Returns [`StoreError::Schema`] naming the table whose DDL failed.
pub fn create_tables(conn: &Connection) -> Result<()> {
    with_savepoint(conn, "questlog_bootstrap", || {
        for (table, sql) in TABLE_DDL {
            conn.execute_batch(sql)
                .map_err(|source| StoreError::Schema { table, source })?;
            debug!(table, "table ready");
        }
        Ok(())
    })?;
    info!(tables = TABLE_DDL.len(), "schema bootstrapped");
    Ok(())
}

/// Drops every bootstrapped table, children first.
///
/// Uses `DROP TABLE IF EXISTS` so it is safe on a database that was never
/// bootstrapped.
pub fn drop_tables(conn: &Connection) -> Result<()> {
    let sql = generate_drop_sql();
    with_savepoint(conn, "questlog_drop", || {
        conn.execute_batch(&sql)
            .map_err(|e| StoreError::Migration(format!("failed to drop tables: {e}")))
    })?;
    info!("schema dropped");
    Ok(())
}

/// Returns `true` if a table called `name` exists.
pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found = conn
        .prepare_cached("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?
        .query_row([name], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// Returns the names of all user tables, sorted. SQLite's internal
/// `sqlite_*` tables are excluded.
pub fn table_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    fn sorted_table_names() -> Vec<String> {
        let mut names: Vec<String> = TABLE_NAMES.iter().map(|s| s.to_string()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_generate_schema_sql_contains_tables() {
        let sql = generate_schema_sql();
        for table in TABLE_NAMES {
            assert!(
                sql.contains(&format!("CREATE TABLE IF NOT EXISTS {table} (")),
                "missing {table}"
            );
        }
    }

    #[test]
    fn test_generate_schema_sql_contains_indexes() {
        let sql = generate_schema_sql();
        assert!(sql.contains("idx_tasks_completed"));
        assert!(sql.contains("idx_tasks_priority"));
        assert!(sql.contains("idx_tasks_due_date"));
        assert!(sql.contains("idx_tasks_project_id"));
        assert!(sql.contains("idx_reminders_task_id"));
        assert!(sql.contains("idx_pomodoro_task_id"));
        // achievements.name has a UNIQUE constraint, which implicitly creates an index
        assert!(!sql.contains("idx_achievements_name"));
    }

    #[test]
    fn test_generate_drop_sql_contains_all_tables() {
        let sql = generate_drop_sql();
        for table in TABLE_NAMES {
            assert!(sql.contains(&format!("DROP TABLE IF EXISTS {table};")));
        }
        // Children go before their parents.
        let tasks = sql.find("DROP TABLE IF EXISTS tasks;").unwrap();
        let projects = sql.find("DROP TABLE IF EXISTS projects;").unwrap();
        let reminders = sql.find("DROP TABLE IF EXISTS reminders;").unwrap();
        assert!(reminders < tasks);
        assert!(tasks < projects);
    }

    #[test]
    fn test_create_tables_is_idempotent() {
        let conn = open();
        create_tables(&conn).unwrap();
        let before = table_names(&conn).unwrap();
        create_tables(&conn).unwrap();
        let after = table_names(&conn).unwrap();
        assert_eq!(before, after);
        assert_eq!(after, sorted_table_names());
    }

    #[test]
    fn test_table_exists() {
        let conn = open();
        assert!(!table_exists(&conn, "tasks").unwrap());
        create_tables(&conn).unwrap();
        assert!(table_exists(&conn, "tasks").unwrap());
        assert!(table_exists(&conn, "pomodoro_sessions").unwrap());
        assert!(!table_exists(&conn, "ghost").unwrap());
    }

    #[test]
    fn test_table_names_hide_internal_tables() {
        let conn = open();
        create_tables(&conn).unwrap();
        conn.execute("INSERT INTO projects (name) VALUES ('p')", [])
            .unwrap();
        // AUTOINCREMENT materializes sqlite_sequence.
        assert!(table_exists(&conn, "sqlite_sequence").unwrap());
        assert!(!table_names(&conn).unwrap().contains(&"sqlite_sequence".to_string()));
    }

    #[test]
    fn test_drop_tables() {
        let conn = open();
        create_tables(&conn).unwrap();
        drop_tables(&conn).unwrap();
        assert!(table_names(&conn).unwrap().is_empty());
        // Nothing left to drop is fine too.
        drop_tables(&conn).unwrap();
    }

    #[test]
    fn test_failing_table_rolls_back_the_rest() {
        let conn = open();
        // A view named like a later table makes its index DDL fail.
        conn.execute_batch("CREATE VIEW reminders AS SELECT 1 AS x;")
            .unwrap();

        let err = create_tables(&conn).unwrap_err();
        assert!(matches!(err, StoreError::Schema { table: "reminders", .. }));
        assert!(!table_exists(&conn, "tasks").unwrap());
        assert!(!table_exists(&conn, "projects").unwrap());
        assert!(conn.is_autocommit());
    }

    #[test]
    fn test_task_without_project_satisfies_foreign_key() {
        let conn = open();
        create_tables(&conn).unwrap();
        conn.execute("INSERT INTO tasks (title) VALUES ('x')", [])
            .unwrap();
        assert!(
            conn.execute("INSERT INTO tasks (title, project_id) VALUES ('y', 99)", [])
                .is_err()
        );
    }

    #[test]
    fn test_check_constraints() {
        let conn = open();
        create_tables(&conn).unwrap();

        assert!(conn.execute("INSERT INTO tasks (title, priority) VALUES ('a', 2)", []).is_ok());
        assert!(conn.execute("INSERT INTO tasks (title, priority) VALUES ('b', 3)", []).is_err());
        assert!(conn.execute("INSERT INTO projects (name, progress) VALUES ('p', 1.5)", []).is_err());
        assert!(
            conn.execute(
                "INSERT INTO reminders (title, trigger_time, recurrence) VALUES ('r', '2024-01-01', 'hourly')",
                [],
            )
            .is_err()
        );
        assert!(
            conn.execute("INSERT INTO achievements (name, progress) VALUES ('first', 101)", [])
                .is_err()
        );
    }

    #[test]
    fn test_deleting_task_cascades_to_reminders() {
        let conn = open();
        create_tables(&conn).unwrap();
        conn.execute("INSERT INTO tasks (title) VALUES ('t')", []).unwrap();
        let task_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO reminders (title, trigger_time, task_id) VALUES ('r', '2024-01-01 09:00', ?1)",
            [task_id],
        )
        .unwrap();
        conn.execute("DELETE FROM tasks WHERE id = ?1", [task_id]).unwrap();

        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM reminders", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }
}
