use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use questlog_sqlite::{Migrator, Store, StoreConfig, Value};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "questlog-db")]
#[command(about = "Maintenance tool for the questlog task database", version)]
struct Cli {
    /// YAML store configuration (path, pragmas, statement cache size).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level to stderr (overrides RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the database file and bootstrap the schema.
    Init(DbArgs),
    /// Show schema version and row counts.
    Status(StatusArgs),
    /// List user tables.
    Tables(DbArgs),
    /// Run the engine's integrity check.
    Check(DbArgs),
    /// Rebuild the database file, reclaiming free pages.
    Vacuum(DbArgs),
    /// Copy the database file.
    Backup(BackupArgs),
    /// Replace the database file with a backup.
    Restore(RestoreArgs),
    /// Schema version operations.
    Migrate(MigrateArgs),
    /// Run a statement.
    Exec(ExecArgs),
    /// Run a query and print the rows tab-separated.
    Query(QueryArgs),
}

#[derive(Debug, Args)]
struct DbArgs {
    /// Database file path (overrides the config file).
    #[arg(long)]
    db: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[command(flatten)]
    db: DbArgs,
    /// Print JSON instead of text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct BackupArgs {
    #[command(flatten)]
    db: DbArgs,
    /// Destination file (default: timestamped file next to the database).
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    #[command(flatten)]
    db: DbArgs,
    /// Backup file to restore from.
    #[arg(long)]
    from: PathBuf,
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[command(subcommand)]
    operation: MigrateOperation,
}

#[derive(Debug, Subcommand)]
enum MigrateOperation {
    /// Apply pending schema versions.
    Up(MigrateUpArgs),
    /// Drop every table and reset the schema version to 0.
    Down(DbArgs),
    /// Show the schema version and row counts.
    Status(DbArgs),
}

#[derive(Debug, Args)]
struct MigrateUpArgs {
    #[command(flatten)]
    db: DbArgs,
    /// Stop at this version instead of the latest.
    #[arg(long)]
    to: Option<u32>,
}

#[derive(Debug, Args)]
struct ExecArgs {
    #[command(flatten)]
    db: DbArgs,
    /// SQL to run.
    #[arg(long)]
    sql: String,
    /// Positional parameter, bound as text. Repeat for each `?`.
    #[arg(long = "param")]
    params: Vec<String>,
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[command(flatten)]
    db: DbArgs,
    /// SQL to run.
    #[arg(long)]
    sql: String,
    /// Print at most this many rows.
    #[arg(long)]
    limit: Option<usize>,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Command::Init(args) => run_init(config, args),
        Command::Status(args) => run_status(config, args),
        Command::Tables(args) => run_tables(config, args),
        Command::Check(args) => run_check(config, args),
        Command::Vacuum(args) => run_vacuum(config, args),
        Command::Backup(args) => run_backup(config, args),
        Command::Restore(args) => run_restore(config, args),
        Command::Migrate(args) => run_migrate(config, args),
        Command::Exec(args) => run_exec(config, args),
        Command::Query(args) => run_query(config, args),
    });

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<StoreConfig, String> {
    match path {
        Some(path) => StoreConfig::load(path)
            .map_err(|e| format!("Failed to load config '{}': {e}", path.display())),
        None => Ok(StoreConfig::default()),
    }
}

/// Applies the `--db` override.
fn resolve(mut config: StoreConfig, args: &DbArgs) -> StoreConfig {
    if let Some(db) = &args.db {
        config.path = db.clone();
    }
    config
}

/// Attaches to an existing database without creating it or touching its
/// schema.
fn open_existing(config: StoreConfig, args: &DbArgs) -> Result<Store, String> {
    let config = resolve(config, args);
    let path = config.path.clone();
    if !path.is_file() {
        return Err(format!(
            "Database '{}' not found (run `questlog-db init` first)",
            path.display()
        ));
    }
    debug!(path = %path.display(), "attaching to existing database");
    Store::open_existing(config)
        .map_err(|e| format!("Failed to open database '{}': {e}", path.display()))
}

/// Opens the store, creating the file and bootstrapping the schema as needed.
fn open_store(config: StoreConfig) -> Result<Store, String> {
    let path = config.path.clone();
    debug!(path = %path.display(), "opening database with bootstrap");
    Store::open(config).map_err(|e| format!("Failed to open database '{}': {e}", path.display()))
}

// ---------------------------------------------------------------------------
// database commands
// ---------------------------------------------------------------------------

fn run_init(config: StoreConfig, args: DbArgs) -> Result<(), String> {
    let store = open_store(resolve(config, &args))?;
    let tables = store.table_names().map_err(|e| e.to_string())?;
    let version = store.schema_version().map_err(|e| e.to_string())?;
    info!(tables = tables.len(), version, "database initialized");
    println!(
        "Initialized '{}': {} tables, schema version {version}.",
        store.database_path().display(),
        tables.len()
    );
    store.close().map_err(|e| e.to_string())
}

#[derive(Debug, Serialize)]
struct StatusReport {
    path: PathBuf,
    schema_version: u32,
    latest_version: u32,
    tables_exist: bool,
    tasks: u64,
    projects: u64,
    reminders: u64,
    achievements: u64,
}

fn run_status(config: StoreConfig, args: StatusArgs) -> Result<(), String> {
    let store = open_existing(config, &args.db)?;
    let status = store
        .migration_status()
        .map_err(|e| format!("Failed to get status: {e}"))?;
    let report = StatusReport {
        path: store.database_path(),
        schema_version: status.schema_version,
        latest_version: status.latest_version,
        tables_exist: status.tables_exist,
        tasks: status.task_count,
        projects: status.project_count,
        reminders: status.reminder_count,
        achievements: status.achievement_count,
    };

    if args.json {
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| format!("Failed to serialize status: {e}"))?;
        println!("{json}");
        return Ok(());
    }

    println!("Database: {}", report.path.display());
    println!(
        "  Schema version: {} (latest {})",
        report.schema_version, report.latest_version
    );
    println!(
        "  Tables exist: {}",
        if report.tables_exist { "yes" } else { "no" }
    );
    println!("  Tasks: {}", report.tasks);
    println!("  Projects: {}", report.projects);
    println!("  Reminders: {}", report.reminders);
    println!("  Achievements: {}", report.achievements);
    Ok(())
}

fn run_tables(config: StoreConfig, args: DbArgs) -> Result<(), String> {
    let store = open_existing(config, &args)?;
    for name in store.table_names().map_err(|e| e.to_string())? {
        println!("{name}");
    }
    Ok(())
}

fn run_check(config: StoreConfig, args: DbArgs) -> Result<(), String> {
    let store = open_existing(config, &args)?;
    store
        .check_integrity()
        .map_err(|e| format!("Integrity check failed for '{}': {e}", store.database_path().display()))?;
    println!("Integrity check passed.");
    Ok(())
}

fn run_vacuum(config: StoreConfig, args: DbArgs) -> Result<(), String> {
    let store = open_existing(config, &args)?;
    store
        .vacuum_database()
        .map_err(|e| format!("Vacuum failed: {e}"))?;
    println!("Vacuum complete.");
    Ok(())
}

fn run_backup(config: StoreConfig, args: BackupArgs) -> Result<(), String> {
    let store = open_existing(config, &args.db)?;
    let dest = args
        .output
        .unwrap_or_else(|| default_backup_path(&store.database_path()));
    let report = store
        .backup_database(&dest)
        .map_err(|e| format!("Backup to '{}' failed: {e}", dest.display()))?;
    info!(dest = %report.path.display(), bytes = report.bytes, "backup written");
    println!("Backup written to '{}'.", report.path.display());
    println!("  Bytes: {}", report.bytes);
    println!("  SHA-256: {}", report.sha256);
    Ok(())
}

fn run_restore(config: StoreConfig, args: RestoreArgs) -> Result<(), String> {
    let store = open_store(resolve(config, &args.db))?;
    store
        .restore_database(&args.from)
        .map_err(|e| format!("Restore from '{}' failed: {e}", args.from.display()))?;
    info!(from = %args.from.display(), "restore complete");
    println!(
        "Restored '{}' from '{}'.",
        store.database_path().display(),
        args.from.display()
    );
    Ok(())
}

fn run_exec(config: StoreConfig, args: ExecArgs) -> Result<(), String> {
    let store = open_existing(config, &args.db)?;
    let result = if args.params.is_empty() {
        store.execute(&args.sql)
    } else {
        store.execute_parameterized(&args.sql, &args.params)
    };
    result.map_err(|e| format!("Statement failed: {e}"))?;
    debug!(params = args.params.len(), "statement executed");
    let id = store.last_insert_id().map_err(|e| e.to_string())?;
    println!("OK (last insert id {id})");
    Ok(())
}

fn run_query(config: StoreConfig, args: QueryArgs) -> Result<(), String> {
    let store = open_existing(config, &args.db)?;
    let limit = args.limit.unwrap_or(usize::MAX);
    let (columns, rows) = store
        .query_with(&args.sql, &[], |rows| {
            let columns = rows.columns().to_vec();
            let rows: Vec<_> = rows.take(limit).collect();
            (columns, rows)
        })
        .map_err(|e| format!("Query failed: {e}"))?;
    debug!(rows = rows.len(), "query returned");

    println!("{}", columns.join("\t"));
    for row in rows {
        let cells: Vec<String> = row.into_values().iter().map(render_value).collect();
        println!("{}", cells.join("\t"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// migrate command
// ---------------------------------------------------------------------------

fn run_migrate(config: StoreConfig, args: MigrateArgs) -> Result<(), String> {
    match args.operation {
        MigrateOperation::Up(a) => run_migrate_up(config, a),
        MigrateOperation::Down(a) => run_migrate_down(config, a),
        MigrateOperation::Status(a) => run_migrate_status(config, a),
    }
}

/// Opens a bare connection so migrations run from the recorded version
/// rather than after a full bootstrap.
fn open_connection(config: StoreConfig, args: &DbArgs) -> Result<rusqlite::Connection, String> {
    let path = resolve(config, args).path;
    let conn = rusqlite::Connection::open(&path)
        .map_err(|e| format!("Failed to open database '{}': {e}", path.display()))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(|e| format!("Failed to enable foreign keys: {e}"))?;
    Ok(conn)
}

fn run_migrate_up(config: StoreConfig, args: MigrateUpArgs) -> Result<(), String> {
    let conn = open_connection(config, &args.db)?;
    let report = Migrator::new(&conn)
        .up(args.to)
        .map_err(|e| format!("Migration up failed: {e}"))?;
    info!(from = report.from, to = report.to, applied = report.applied.len(), "migrate up");
    if report.applied.is_empty() {
        println!("Schema already at version {}.", report.to);
        return Ok(());
    }
    println!(
        "Migration up complete: version {} -> {}.",
        report.from, report.to
    );
    for step in &report.applied {
        println!(
            "  v{} {} (applied {})",
            step.version, step.description, step.applied_at
        );
    }
    Ok(())
}

fn run_migrate_down(config: StoreConfig, args: DbArgs) -> Result<(), String> {
    let conn = open_connection(config, &args)?;
    Migrator::new(&conn)
        .down()
        .map_err(|e| format!("Migration down failed: {e}"))?;
    info!("migrate down: all tables dropped");
    println!("Migration down complete. All tables dropped, schema version 0.");
    Ok(())
}

fn run_migrate_status(config: StoreConfig, args: DbArgs) -> Result<(), String> {
    let conn = open_connection(config, &args)?;
    let status = Migrator::new(&conn)
        .status()
        .map_err(|e| format!("Failed to get migration status: {e}"))?;
    println!("Migration Status:");
    println!(
        "  Schema version: {} (latest {})",
        status.schema_version, status.latest_version
    );
    println!(
        "  Tables exist: {}",
        if status.tables_exist { "yes" } else { "no" }
    );
    println!("  Task count: {}", status.task_count);
    println!("  Project count: {}", status.project_count);
    println!("  Reminder count: {}", status.reminder_count);
    println!("  Achievement count: {}", status.achievement_count);
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `<dir>/<stem>-backup-<timestamp>.db` next to the database.
fn default_backup_path(db: &Path) -> PathBuf {
    let stem = db
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("database");
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    db.with_file_name(format!("{stem}-backup-{stamp}.db"))
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(v) => v.to_string(),
        Value::Real(v) => v.to_string(),
        Value::Text(v) => v.clone(),
        Value::Blob(v) => format!("<blob {} bytes>", v.len()),
    }
}
