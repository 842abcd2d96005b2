use std::collections::BTreeSet;
use std::path::Path;
use std::time::Instant;

use rosewood_migrate_core::{
    list_migration_files, read_migration, MigrationFile, MigrationRecord, SourceError,
};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const CREATE_LEDGER_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  filename TEXT PRIMARY KEY,
  checksum TEXT NOT NULL,
  executed_at TEXT NOT NULL,
  execution_time_ms INTEGER NOT NULL,
  rollback_sql TEXT,
  created_by TEXT NOT NULL,
  notes TEXT
);
";

/// `created_by` value written by the runner for normally applied files.
pub const CREATED_BY_RUNNER: &str = "runner";

/// `created_by` value written by ledger backfills.
pub const CREATED_BY_SYNC: &str = "sync";

#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error("cannot open database: {0}")]
    Connection(rusqlite::Error),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("migration {filename} failed at statement {index}: {source}")]
    Statement {
        filename: String,
        index: usize,
        source: rusqlite::Error,
    },
    #[error("migration {filename} is already recorded in the ledger")]
    DuplicateEntry { filename: String },
    #[error("ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),
    #[error("failed to format RFC3339 timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// Outcome of one `run_pending` invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunSummary {
    pub applied: Vec<MigrationRecord>,
    pub already_applied: usize,
}

/// Outcome of one `sync_existing` invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SyncSummary {
    pub backfilled: Vec<MigrationRecord>,
    pub already_recorded: usize,
}

/// Ledger-side view of one applied migration, with drift flags.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AppliedStatus {
    pub filename: String,
    pub checksum: String,
    pub executed_at: String,
    pub execution_time_ms: i64,
    pub created_by: String,
    pub drifted: bool,
    pub missing_on_disk: bool,
}

/// Applied/pending classification of a migration directory.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatusReport {
    pub applied: Vec<AppliedStatus>,
    pub pending: Vec<String>,
}

/// The migration ledger and runner over one SQLite connection.
///
/// The connection is constructed explicitly by `open` and released when the
/// value is dropped, on success and failure paths alike. Each migration file
/// is applied inside its own transaction covering both the file's statements
/// and its ledger row.
pub struct MigrationLedger {
    conn: Connection,
}

impl MigrationLedger {
    /// Open the ledger database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns `MigrateError::Connection` when the database cannot be opened
    /// or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self, MigrateError> {
        let conn = Connection::open(path).map_err(MigrateError::Connection)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(MigrateError::Connection)?;

        Ok(Self { conn })
    }

    /// Create the `schema_migrations` table if absent. Safe on every run.
    ///
    /// # Errors
    /// Returns an error when the DDL cannot be executed.
    pub fn ensure_ledger_schema(&self) -> Result<(), MigrateError> {
        self.conn.execute_batch(CREATE_LEDGER_SQL)?;
        Ok(())
    }

    /// Filenames already recorded in the ledger.
    ///
    /// # Errors
    /// Returns an error when the ledger cannot be queried.
    pub fn applied_filenames(&self) -> Result<BTreeSet<String>, MigrateError> {
        let mut stmt = self
            .conn
            .prepare("SELECT filename FROM schema_migrations ORDER BY filename ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut filenames = BTreeSet::new();
        for row in rows {
            filenames.insert(row?);
        }
        Ok(filenames)
    }

    /// All ledger rows, ordered by filename.
    ///
    /// # Errors
    /// Returns an error when the ledger cannot be queried.
    pub fn applied_records(&self) -> Result<Vec<MigrationRecord>, MigrateError> {
        let mut stmt = self.conn.prepare(
            "SELECT filename, checksum, executed_at, execution_time_ms,
                    rollback_sql, created_by, notes
             FROM schema_migrations
             ORDER BY filename ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(MigrationRecord {
                filename: row.get(0)?,
                checksum: row.get(1)?,
                executed_at: row.get(2)?,
                execution_time_ms: row.get(3)?,
                rollback_sql: row.get(4)?,
                created_by: row.get(5)?,
                notes: row.get(6)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Insert one ledger row in its own transaction.
    ///
    /// Ledger rows are immutable once written; this is the only write path
    /// besides `apply_migration`, and it never updates in place.
    ///
    /// # Errors
    /// Returns `MigrateError::DuplicateEntry` when the filename is already
    /// recorded, or a ledger error for other failures.
    pub fn record_applied(&mut self, record: &MigrationRecord) -> Result<(), MigrateError> {
        let tx = self.conn.transaction()?;
        insert_record(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    /// Apply one migration file: every statement plus the ledger row, in a
    /// single transaction. Any failure rolls the whole file back.
    ///
    /// # Errors
    /// Returns `MigrateError::Statement` when a statement fails,
    /// `MigrateError::DuplicateEntry` when the ledger insert collides, or a
    /// ledger error for transaction bookkeeping failures.
    pub fn apply_migration(&mut self, file: &MigrationFile) -> Result<MigrationRecord, MigrateError> {
        let started = Instant::now();
        let tx = self.conn.transaction()?;

        for (index, statement) in file.statements().iter().enumerate() {
            tx.execute_batch(statement)
                .map_err(|source| MigrateError::Statement {
                    filename: file.filename.clone(),
                    index,
                    source,
                })?;
        }

        let record = MigrationRecord {
            filename: file.filename.clone(),
            checksum: file.checksum(),
            executed_at: now_rfc3339()?,
            execution_time_ms: elapsed_ms(started),
            rollback_sql: file.rollback_sql(),
            created_by: CREATED_BY_RUNNER.to_string(),
            notes: None,
        };
        insert_record(&tx, &record)?;

        tx.commit()?;
        Ok(record)
    }

    /// Apply all pending migrations in `dir`, in lexicographic order.
    ///
    /// # Errors
    /// See `run_pending_with`.
    pub fn run_pending(&mut self, dir: &Path) -> Result<RunSummary, MigrateError> {
        self.run_pending_with(dir, |_| {})
    }

    /// Apply all pending migrations in `dir`, invoking `on_applied` after
    /// each file commits.
    ///
    /// Every pending file's content is read before the first transaction
    /// starts, so an unreadable file aborts the run with the database
    /// untouched. A failure while applying file N stops the run; files
    /// N+1..end stay pending for the next invocation.
    ///
    /// # Errors
    /// Returns an error when the directory or a pending file cannot be read,
    /// or when applying a file fails.
    pub fn run_pending_with<F>(
        &mut self,
        dir: &Path,
        mut on_applied: F,
    ) -> Result<RunSummary, MigrateError>
    where
        F: FnMut(&MigrationRecord),
    {
        self.ensure_ledger_schema()?;

        let filenames = list_migration_files(dir)?;
        let applied = self.applied_filenames()?;

        let mut already_applied = 0_usize;
        let mut pending = Vec::new();
        for filename in filenames {
            if applied.contains(&filename) {
                already_applied += 1;
                continue;
            }
            pending.push(read_migration(dir, &filename)?);
        }

        let mut summary = RunSummary {
            applied: Vec::new(),
            already_applied,
        };
        for file in &pending {
            let record = self.apply_migration(file)?;
            on_applied(&record);
            summary.applied.push(record);
        }
        Ok(summary)
    }

    /// Classify every migration in `dir` as applied or pending, flagging
    /// applied files whose on-disk content drifted from the recorded
    /// checksum and applied files missing from disk.
    ///
    /// # Errors
    /// Returns an error when the ledger, the directory, or an applied file
    /// on disk cannot be read.
    pub fn status(&self, dir: &Path) -> Result<StatusReport, MigrateError> {
        self.ensure_ledger_schema()?;

        let filenames = list_migration_files(dir)?;
        let records = self.applied_records()?;
        let recorded: BTreeSet<&str> = records.iter().map(|r| r.filename.as_str()).collect();

        let mut applied = Vec::new();
        for record in &records {
            let on_disk = filenames.iter().any(|f| *f == record.filename);
            let (drifted, missing_on_disk) = if on_disk {
                let file = read_migration(dir, &record.filename)?;
                (file.checksum() != record.checksum, false)
            } else {
                (false, true)
            };
            applied.push(AppliedStatus {
                filename: record.filename.clone(),
                checksum: record.checksum.clone(),
                executed_at: record.executed_at.clone(),
                execution_time_ms: record.execution_time_ms,
                created_by: record.created_by.clone(),
                drifted,
                missing_on_disk,
            });
        }

        let pending = filenames
            .into_iter()
            .filter(|f| !recorded.contains(f.as_str()))
            .collect();

        Ok(StatusReport { applied, pending })
    }

    /// Backfill ledger rows for files present on disk but absent from the
    /// ledger, without executing them. Checksums are computed post-hoc and
    /// `execution_time_ms` is recorded as 0.
    ///
    /// # Errors
    /// Returns an error when the directory or a file cannot be read, or
    /// when a ledger insert fails.
    pub fn sync_existing(
        &mut self,
        dir: &Path,
        created_by: &str,
        notes: Option<&str>,
    ) -> Result<SyncSummary, MigrateError> {
        self.ensure_ledger_schema()?;

        let filenames = list_migration_files(dir)?;
        let applied = self.applied_filenames()?;

        let mut summary = SyncSummary::default();
        for filename in filenames {
            if applied.contains(&filename) {
                summary.already_recorded += 1;
                continue;
            }

            let file = read_migration(dir, &filename)?;
            let record = MigrationRecord {
                filename: file.filename.clone(),
                checksum: file.checksum(),
                executed_at: now_rfc3339()?,
                execution_time_ms: 0,
                rollback_sql: file.rollback_sql(),
                created_by: created_by.to_string(),
                notes: notes.map(ToString::to_string),
            };
            self.record_applied(&record)?;
            summary.backfilled.push(record);
        }
        Ok(summary)
    }
}

fn insert_record(
    tx: &rusqlite::Transaction<'_>,
    record: &MigrationRecord,
) -> Result<(), MigrateError> {
    tx.execute(
        "INSERT INTO schema_migrations(
            filename, checksum, executed_at, execution_time_ms,
            rollback_sql, created_by, notes
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.filename,
            record.checksum,
            record.executed_at,
            record.execution_time_ms,
            record.rollback_sql,
            record.created_by,
            record.notes,
        ],
    )
    .map_err(|source| match source {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            MigrateError::DuplicateEntry {
                filename: record.filename.clone(),
            }
        }
        other => MigrateError::Ledger(other),
    })?;
    Ok(())
}

fn now_rfc3339() -> Result<String, MigrateError> {
    let formatted =
        OffsetDateTime::now_utc().format(&time::format_description::well_known::Rfc3339)?;
    Ok(formatted)
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}
