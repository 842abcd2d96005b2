use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rosewood_migrate_sqlite::{MigrationLedger, CREATED_BY_SYNC};
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rwm")]
#[command(about = "Rosewood schema migration runner")]
struct Cli {
    #[arg(long, default_value = "./rosewood.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = "./migrations")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply all pending migrations in order.
    Run,
    /// Report applied and pending migrations, with drift detection.
    Status,
    /// Backfill ledger rows for migrations applied outside the runner.
    Sync(SyncArgs),
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long, default_value = CREATED_BY_SYNC)]
    created_by: String,
    #[arg(long)]
    notes: Option<String>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut ledger = MigrationLedger::open(&cli.db)
        .with_context(|| format!("failed to open ledger database {}", cli.db.display()))?;

    match cli.command {
        Command::Run => run_migrations(&cli.dir, &mut ledger),
        Command::Status => run_status(&cli.dir, &ledger),
        Command::Sync(args) => run_sync(&cli.dir, &args, &mut ledger),
    }
}

fn run_migrations(dir: &Path, ledger: &mut MigrationLedger) -> Result<()> {
    let summary = ledger
        .run_pending_with(dir, |record| {
            eprintln!("applied {} ({} ms)", record.filename, record.execution_time_ms);
        })
        .with_context(|| format!("migration run failed in {}", dir.display()))?;

    eprintln!(
        "done: {} applied, {} already applied",
        summary.applied.len(),
        summary.already_applied
    );
    let up_to_date = summary.applied.is_empty();
    emit_json(serde_json::json!({
        "applied": summary.applied,
        "already_applied": summary.already_applied,
        "up_to_date": up_to_date
    }))
}

fn run_status(dir: &Path, ledger: &MigrationLedger) -> Result<()> {
    let report = ledger
        .status(dir)
        .with_context(|| format!("failed to compute migration status for {}", dir.display()))?;

    let up_to_date = report.pending.is_empty();
    emit_json(serde_json::json!({
        "applied": report.applied,
        "pending": report.pending,
        "up_to_date": up_to_date
    }))
}

fn run_sync(dir: &Path, args: &SyncArgs, ledger: &mut MigrationLedger) -> Result<()> {
    let summary = ledger
        .sync_existing(dir, &args.created_by, args.notes.as_deref())
        .with_context(|| format!("ledger sync failed in {}", dir.display()))?;

    for record in &summary.backfilled {
        eprintln!("backfilled {} (not executed)", record.filename);
    }
    emit_json(serde_json::json!({
        "backfilled": summary.backfilled,
        "already_recorded": summary.already_recorded
    }))
}
