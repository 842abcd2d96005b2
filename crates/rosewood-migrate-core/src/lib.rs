use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const MIGRATION_EXTENSION: &str = "sql";

/// Line prefix marking rollback statements inside a migration file.
const ROLLBACK_MARKER: &str = "-- ROLLBACK:";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to list migration directory {path}: {source}")]
    ListDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read migration file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One migration file loaded from the file store.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MigrationFile {
    pub filename: String,
    pub sql: String,
}

impl MigrationFile {
    /// SHA-256 hex digest of the raw file content.
    #[must_use]
    pub fn checksum(&self) -> String {
        checksum_hex(&self.sql)
    }

    /// Executable statements in file order.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        split_statements(&self.sql)
    }

    /// Rollback statements annotated in the file, if any.
    #[must_use]
    pub fn rollback_sql(&self) -> Option<String> {
        extract_rollback_sql(&self.sql)
    }
}

/// One row of the migration ledger.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationRecord {
    pub filename: String,
    pub checksum: String,
    pub executed_at: String,
    pub execution_time_ms: i64,
    pub rollback_sql: Option<String>,
    pub created_by: String,
    pub notes: Option<String>,
}

/// List migration filenames in `dir`, lexicographically sorted.
///
/// Only regular files with the `sql` extension are considered. The
/// `NNN_description.sql` numeric prefix is a naming convention relied on for
/// ordering, not something this function enforces.
///
/// # Errors
/// Returns an error when the directory cannot be read.
pub fn list_migration_files(dir: &Path) -> Result<Vec<String>, SourceError> {
    let entries = fs::read_dir(dir).map_err(|source| SourceError::ListDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut filenames = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| SourceError::ListDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(OsStr::to_str) != Some(MIGRATION_EXTENSION) {
            continue;
        }
        let Some(filename) = path.file_name().and_then(OsStr::to_str) else {
            continue;
        };
        filenames.push(filename.to_string());
    }

    filenames.sort();
    Ok(filenames)
}

/// Load one migration file from `dir`.
///
/// # Errors
/// Returns an error when the file is missing or unreadable.
pub fn read_migration(dir: &Path, filename: &str) -> Result<MigrationFile, SourceError> {
    let path = dir.join(filename);
    let sql = fs::read_to_string(&path).map_err(|source| SourceError::Read { path, source })?;
    Ok(MigrationFile {
        filename: filename.to_string(),
        sql,
    })
}

/// Split migration content into executable statements.
///
/// Statements are separated by a literal `;`. Chunks that are empty after
/// trimming, or that contain nothing but `--` comment lines, are dropped.
/// This is a textual heuristic: semicolons embedded in string literals or
/// procedural bodies produce wrong boundaries, and migrations must avoid
/// them.
#[must_use]
pub fn split_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty() && has_executable_sql(chunk))
        .map(ToString::to_string)
        .collect()
}

fn has_executable_sql(chunk: &str) -> bool {
    chunk
        .lines()
        .map(str::trim)
        .any(|line| !line.is_empty() && !line.starts_with("--"))
}

/// Lowercase SHA-256 hex digest of `content`.
#[must_use]
pub fn checksum_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Collect the payload of every `-- ROLLBACK:` line, joined with newlines.
///
/// The captured SQL is ledger metadata for future tooling; nothing in this
/// workspace executes it.
#[must_use]
pub fn extract_rollback_sql(sql: &str) -> Option<String> {
    let lines: Vec<&str> = sql
        .lines()
        .filter_map(|line| line.trim().strip_prefix(ROLLBACK_MARKER))
        .map(str::trim)
        .filter(|payload| !payload.is_empty())
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
