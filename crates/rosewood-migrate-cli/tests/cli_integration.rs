use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_rwm<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_rwm"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute rwm binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_rwm(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "rwm command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn as_u64(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_migration(dir: &Path, filename: &str, sql: &str) {
    fs::write(dir.join(filename), sql)
        .unwrap_or_else(|err| panic!("failed to write migration {filename}: {err}"));
}

struct Workspace {
    root: PathBuf,
    db: PathBuf,
    migrations: PathBuf,
}

impl Workspace {
    fn new(label: &str) -> Self {
        let root = unique_temp_dir(&format!("rwm-{label}"));
        let migrations = root.join("migrations");
        fs::create_dir_all(&migrations).unwrap_or_else(|err| {
            panic!("failed to create migrations dir {}: {err}", migrations.display())
        });
        Self {
            db: root.join("rosewood.sqlite3"),
            migrations,
            root,
        }
    }

    fn base_args(&self, command: &str) -> Vec<String> {
        vec![
            "--db".to_string(),
            path_str(&self.db).to_string(),
            "--dir".to_string(),
            path_str(&self.migrations).to_string(),
            command.to_string(),
        ]
    }

    fn cleanup(self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

#[test]
fn run_applies_pending_migrations_and_reports_envelope() {
    let ws = Workspace::new("run");
    write_migration(
        &ws.migrations,
        "001_create_guests.sql",
        "CREATE TABLE guests (id INTEGER PRIMARY KEY, full_name TEXT NOT NULL);\n\
         -- ROLLBACK: DROP TABLE guests;\n",
    );
    write_migration(
        &ws.migrations,
        "002_create_events.sql",
        "CREATE TABLE events (id INTEGER PRIMARY KEY, title TEXT NOT NULL);",
    );

    let payload = run_json(ws.base_args("run"));
    assert_eq!(as_str(&payload, "contract_version"), "cli.v1");
    assert_eq!(as_u64(&payload, "already_applied"), 0);

    let applied = as_array(&payload, "applied");
    assert_eq!(applied.len(), 2);
    assert_eq!(as_str(&applied[0], "filename"), "001_create_guests.sql");
    assert_eq!(as_str(&applied[1], "filename"), "002_create_events.sql");
    assert_eq!(as_str(&applied[0], "created_by"), "runner");
    assert_eq!(
        as_str(&applied[0], "rollback_sql"),
        "DROP TABLE guests;"
    );

    // Second run is a no-op.
    let second = run_json(ws.base_args("run"));
    assert!(as_array(&second, "applied").is_empty());
    assert_eq!(as_u64(&second, "already_applied"), 2);
    assert_eq!(second.get("up_to_date"), Some(&Value::Bool(true)));

    ws.cleanup();
}

#[test]
fn run_failure_names_the_failing_file_and_exits_nonzero() {
    let ws = Workspace::new("failure");
    write_migration(&ws.migrations, "001_ok.sql", "CREATE TABLE a (id INTEGER);");
    write_migration(&ws.migrations, "002_broken.sql", "CREATE TABLE b (id INTEGER;");
    write_migration(&ws.migrations, "003_later.sql", "CREATE TABLE c (id INTEGER);");

    let output = run_rwm(ws.base_args("run"));
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("002_broken.sql"),
        "stderr should name the failing file:\n{stderr}"
    );

    // 001 is durably applied, 003 was never attempted.
    let status = run_json(ws.base_args("status"));
    let applied = as_array(&status, "applied");
    assert_eq!(applied.len(), 1);
    assert_eq!(as_str(&applied[0], "filename"), "001_ok.sql");
    let pending = as_array(&status, "pending");
    assert_eq!(pending.len(), 2);

    // Fixing the file lets the next run resume from it.
    write_migration(&ws.migrations, "002_broken.sql", "CREATE TABLE b (id INTEGER);");
    let resumed = run_json(ws.base_args("run"));
    let resumed_applied = as_array(&resumed, "applied");
    assert_eq!(resumed_applied.len(), 2);
    assert_eq!(as_str(&resumed_applied[0], "filename"), "002_broken.sql");
    assert_eq!(as_str(&resumed_applied[1], "filename"), "003_later.sql");

    ws.cleanup();
}

#[test]
fn status_flags_drifted_files_after_edits() {
    let ws = Workspace::new("drift");
    write_migration(&ws.migrations, "001_guests.sql", "CREATE TABLE guests (id INTEGER);");

    let before = run_json(ws.base_args("status"));
    assert!(as_array(&before, "applied").is_empty());
    assert_eq!(as_array(&before, "pending").len(), 1);

    run_json(ws.base_args("run"));
    write_migration(
        &ws.migrations,
        "001_guests.sql",
        "CREATE TABLE guests (id INTEGER, email TEXT);",
    );

    let after = run_json(ws.base_args("status"));
    let applied = as_array(&after, "applied");
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].get("drifted"), Some(&Value::Bool(true)));
    assert_eq!(after.get("up_to_date"), Some(&Value::Bool(true)));

    ws.cleanup();
}

#[test]
fn repository_migration_set_applies_cleanly() {
    let migrations = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations");
    let scratch = unique_temp_dir("rwm-repo-set");
    let db = scratch.join("rosewood.sqlite3");

    let payload = run_json([
        "--db",
        path_str(&db),
        "--dir",
        path_str(&migrations),
        "run",
    ]);

    let applied = as_array(&payload, "applied");
    assert_eq!(applied.len(), 5);
    assert_eq!(as_str(&applied[0], "filename"), "001_create_guests.sql");
    assert_eq!(as_str(&applied[4], "filename"), "005_create_themes.sql");

    let _ = fs::remove_dir_all(&scratch);
}

#[test]
fn sync_backfills_the_ledger_without_executing_files() {
    let ws = Workspace::new("sync");
    write_migration(&ws.migrations, "001_guests.sql", "CREATE TABLE guests (id INTEGER);");

    let mut args = ws.base_args("sync");
    args.extend(["--notes".to_string(), "applied by hand in production".to_string()]);
    let payload = run_json(args);

    let backfilled = as_array(&payload, "backfilled");
    assert_eq!(backfilled.len(), 1);
    assert_eq!(as_str(&backfilled[0], "created_by"), "sync");
    assert_eq!(
        as_str(&backfilled[0], "notes"),
        "applied by hand in production"
    );

    // The backfilled file is recorded, so nothing is pending to run.
    let run = run_json(ws.base_args("run"));
    assert!(as_array(&run, "applied").is_empty());
    assert_eq!(as_u64(&run, "already_applied"), 1);

    ws.cleanup();
}
