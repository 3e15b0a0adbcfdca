use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

/// Helper to create a temp directory that is cleaned up on drop.
struct TempDir {
    path: PathBuf,
}

impl TempDir {
    fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!("questlog_cli_test_{name}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&path);
        fs::create_dir_all(&path).expect("failed to create temp dir");
        Self { path }
    }

    fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

fn run(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_questlog-db"))
        .args(args)
        .output()
        .expect("failed to run questlog-db")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

fn init(db: &str) {
    let out = run(&["init", "--db", db]);
    assert!(out.status.success(), "init failed: {}", stderr(&out));
}

// ---------------------------------------------------------------------------
// Database commands
// ---------------------------------------------------------------------------

#[test]
fn init_creates_all_tables() {
    let dir = TempDir::new("init");
    let db = dir.join("tasks.db");
    let db = db.to_str().unwrap();

    let out = run(&["init", "--db", db]);
    assert!(out.status.success(), "init failed: {}", stderr(&out));
    assert!(stdout(&out).contains("8 tables"), "stdout: {}", stdout(&out));

    let out = run(&["tables", "--db", db]);
    let tables = stdout(&out);
    for table in ["tasks", "projects", "challenges", "reminders", "achievements", "user_stats", "user_settings", "pomodoro_sessions"] {
        assert!(tables.lines().any(|l| l == table), "missing {table} in:\n{tables}");
    }
}

#[test]
fn status_json_reports_counts() {
    let dir = TempDir::new("status_json");
    let db = dir.join("tasks.db");
    let db = db.to_str().unwrap();
    init(db);

    let out = run(&["exec", "--db", db, "--sql", "INSERT INTO tasks (title) VALUES (?)", "--param", "Water plants"]);
    assert!(out.status.success(), "exec failed: {}", stderr(&out));

    let out = run(&["status", "--db", db, "--json"]);
    assert!(out.status.success());
    let json: serde_json::Value = serde_json::from_slice(&out.stdout).expect("status should print JSON");
    assert_eq!(json["tasks"], 1);
    assert_eq!(json["projects"], 0);
    assert_eq!(json["tables_exist"], true);
    assert_eq!(json["schema_version"], json["latest_version"]);
}

#[test]
fn status_on_missing_database_fails() {
    let dir = TempDir::new("status_missing");
    let db = dir.join("nope.db");

    let out = run(&["status", "--db", db.to_str().unwrap()]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("error:"), "stderr: {}", stderr(&out));
    assert!(!db.exists(), "status must not create the database");
}

#[test]
fn inspection_commands_leave_schema_untouched() {
    let dir = TempDir::new("inspect_untouched");
    let db = dir.join("tasks.db");
    let db = db.to_str().unwrap();
    init(db);

    let out = run(&["migrate", "down", "--db", db]);
    assert!(out.status.success(), "migrate down failed: {}", stderr(&out));

    let out = run(&["tables", "--db", db]);
    assert!(out.status.success(), "tables failed: {}", stderr(&out));
    assert_eq!(stdout(&out).trim(), "");

    for cmd in ["status", "check"] {
        let out = run(&[cmd, "--db", db]);
        assert!(out.status.success(), "{cmd} failed: {}", stderr(&out));
    }
    let out = run(&["query", "--db", db, "--sql", "SELECT 1 AS one"]);
    assert!(out.status.success(), "query failed: {}", stderr(&out));

    let out = run(&["migrate", "status", "--db", db]);
    let text = stdout(&out);
    assert!(text.contains("Schema version: 0"), "stdout: {text}");
    assert!(text.contains("Tables exist: no"), "stdout: {text}");
}

#[test]
fn exec_and_query_round_trip() {
    let dir = TempDir::new("exec_query");
    let db = dir.join("tasks.db");
    let db = db.to_str().unwrap();
    init(db);

    for title in ["a", "b", "c"] {
        let out = run(&["exec", "--db", db, "--sql", "INSERT INTO tasks (title, priority) VALUES (?, ?)", "--param", title, "--param", "2"]);
        assert!(out.status.success(), "exec failed: {}", stderr(&out));
    }

    let out = run(&["query", "--db", db, "--sql", "SELECT title, priority FROM tasks ORDER BY id", "--limit", "2"]);
    assert!(out.status.success(), "query failed: {}", stderr(&out));
    let text = stdout(&out);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines, vec!["title\tpriority", "a\t2", "b\t2"]);
}

#[test]
fn exec_reports_constraint_failure() {
    let dir = TempDir::new("exec_fail");
    let db = dir.join("tasks.db");
    let db = db.to_str().unwrap();
    init(db);

    let out = run(&["exec", "--db", db, "--sql", "INSERT INTO tasks (title, priority) VALUES ('x', 9)"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("Statement failed"), "stderr: {}", stderr(&out));
}

#[test]
fn check_and_vacuum_succeed() {
    let dir = TempDir::new("check_vacuum");
    let db = dir.join("tasks.db");
    let db = db.to_str().unwrap();
    init(db);

    let out = run(&["check", "--db", db]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("Integrity check passed"));

    let out = run(&["vacuum", "--db", db]);
    assert!(out.status.success(), "vacuum failed: {}", stderr(&out));
}

#[test]
fn backup_and_restore() {
    let dir = TempDir::new("backup_restore");
    let db = dir.join("tasks.db");
    let backup = dir.join("snapshot.db");
    let db = db.to_str().unwrap();
    init(db);

    run(&["exec", "--db", db, "--sql", "INSERT INTO projects (name) VALUES ('Garden')"]);
    let out = run(&["backup", "--db", db, "--output", backup.to_str().unwrap()]);
    assert!(out.status.success(), "backup failed: {}", stderr(&out));
    assert!(stdout(&out).contains("SHA-256:"));
    assert!(backup.exists());

    run(&["exec", "--db", db, "--sql", "DELETE FROM projects"]);
    let out = run(&["restore", "--db", db, "--from", backup.to_str().unwrap()]);
    assert!(out.status.success(), "restore failed: {}", stderr(&out));

    let out = run(&["query", "--db", db, "--sql", "SELECT name FROM projects"]);
    assert_eq!(stdout(&out).lines().nth(1), Some("Garden"));
}

#[test]
fn restore_from_missing_backup_fails() {
    let dir = TempDir::new("restore_missing");
    let db = dir.join("tasks.db");
    let db = db.to_str().unwrap();
    init(db);

    let out = run(&["restore", "--db", db, "--from", dir.join("absent.db").to_str().unwrap()]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("backup file not found"), "stderr: {}", stderr(&out));
}

#[test]
fn config_file_supplies_database_path() {
    let dir = TempDir::new("config");
    let db = dir.join("configured.db");
    let config = dir.join("store.yaml");
    fs::write(&config, format!("path: {}\npragmas:\n  journal_mode: DELETE\n", db.display()))
        .expect("failed to write config");

    let out = run(&["--config", config.to_str().unwrap(), "init"]);
    assert!(out.status.success(), "init failed: {}", stderr(&out));
    assert!(db.exists());
    assert!(!dir.join("configured.db-wal").exists());
}

// ---------------------------------------------------------------------------
// Migrate tests
// ---------------------------------------------------------------------------

#[test]
fn migrate_up_down_and_status() {
    let dir = TempDir::new("migrate");
    let db = dir.join("tasks.db");
    let db = db.to_str().unwrap();

    let out = run(&["migrate", "up", "--db", db, "--to", "1"]);
    assert!(out.status.success(), "migrate up failed: {}", stderr(&out));
    assert!(stdout(&out).contains("version 0 -> 1"));

    let out = run(&["migrate", "status", "--db", db]);
    let text = stdout(&out);
    assert!(text.contains("Schema version: 1"), "stdout: {text}");
    assert!(text.contains("Tables exist: yes"));

    let out = run(&["migrate", "up", "--db", db]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("v2"));

    let out = run(&["migrate", "up", "--db", db]);
    assert!(stdout(&out).contains("already at version"));

    let out = run(&["migrate", "down", "--db", db]);
    assert!(out.status.success(), "migrate down failed: {}", stderr(&out));

    let out = run(&["migrate", "status", "--db", db]);
    let text = stdout(&out);
    assert!(text.contains("Schema version: 0"), "stdout: {text}");
    assert!(text.contains("Tables exist: no"));
}

#[test]
fn migrate_up_rejects_unknown_target() {
    let dir = TempDir::new("migrate_bad_target");
    let db = dir.join("tasks.db");

    let out = run(&["migrate", "up", "--db", db.to_str().unwrap(), "--to", "42"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("unknown target version"));
}
