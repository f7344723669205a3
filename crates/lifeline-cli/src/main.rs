// ============================================================================
// lifeline-db — CLI inspection tool for the LifeLine call archive
// ============================================================================
// Usage:
//   lifeline-db stats                           Show archive statistics
//   lifeline-db list-logs --binding CHAT        List call logs for a binding
//   lifeline-db export --format json            Export full archive as JSON
//   lifeline-db prune --older-than 90           Prune old call logs
// ============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use lifeline_core::{BlobStorage, CallLogEntry, CallLogStore, RedbStorage};

/// LifeLine call-archive inspection tool
#[derive(Parser)]
#[command(name = "lifeline-db", version, about = "Inspect and manage the LifeLine call archive")]
struct Cli {
    /// Path to the database file (default: ~/.lifeline/callsim.redb)
    #[arg(long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show archive statistics (bindings, entry counts, missed calls)
    Stats,

    /// List call logs for one chat binding
    ListLogs {
        /// Chat binding whose archive to list
        #[arg(long)]
        binding: String,

        /// Only show missed/rejected calls
        #[arg(long)]
        missed: bool,
    },

    /// Export full archive contents as JSON
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Prune call logs older than a cutoff
    Prune {
        /// Delete entries older than this many days
        #[arg(long, default_value = "90")]
        older_than: i64,

        /// Restrict pruning to one binding
        #[arg(long)]
        binding: Option<String>,

        /// Show what would be pruned without actually deleting
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let storage = Arc::new(RedbStorage::open(cli.db_path.as_deref())?);

    match cli.command {
        Commands::Stats => cmd_stats(storage),
        Commands::ListLogs { binding, missed } => cmd_list_logs(storage, &binding, missed),
        Commands::Export { format } => cmd_export(storage, &format),
        Commands::Prune {
            older_than,
            binding,
            dry_run,
        } => cmd_prune(storage, older_than, binding.as_deref(), dry_run),
    }
}

/// Load a binding's archive without range sanitization; the CLI has no
/// transcript to validate against
fn load_all(storage: Arc<dyn BlobStorage>, binding: &str) -> Result<Vec<CallLogEntry>> {
    CallLogStore::new(storage, binding).load(usize::MAX)
}

fn describe(entry: &CallLogEntry) -> String {
    if entry.missed {
        entry.summary.clone()
    } else {
        format!("{}s", entry.duration_seconds)
    }
}

fn cmd_stats(storage: Arc<RedbStorage>) -> Result<()> {
    let stats = CallLogStore::stats(storage.as_ref())?;

    println!("=== LifeLine Call Archive Stats ===");
    println!("Database: {}", storage.path().display());
    println!();
    println!("Entries:  {} total ({} missed)", stats.total_entries, stats.missed_entries);
    for (binding, count) in &stats.bindings {
        println!("  {:24} {}", binding, count);
    }

    Ok(())
}

fn cmd_list_logs(storage: Arc<RedbStorage>, binding: &str, missed_only: bool) -> Result<()> {
    let mut entries = load_all(storage, binding)?;
    if missed_only {
        entries.retain(|entry| entry.missed);
    }

    if entries.is_empty() {
        println!("No call logs found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<16}  {:<22}  {:<10}  {}",
        "LOG ID", "CONTACT", "DATE", "DURATION", "SUMMARY"
    );
    println!("{}", "-".repeat(110));

    for entry in &entries {
        let summary = entry.summary.chars().take(40).collect::<String>();
        println!(
            "{:<36}  {:<16}  {:<22}  {:<10}  {}",
            entry.id,
            entry.contact_name,
            entry.date.format("%Y-%m-%d %H:%M:%S UTC"),
            describe(entry),
            summary
        );
    }

    println!("\nTotal: {} entries", entries.len());
    Ok(())
}

fn cmd_export(storage: Arc<RedbStorage>, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let stats = CallLogStore::stats(storage.as_ref())?;
    let mut bindings = serde_json::Map::new();
    for (binding, _count) in &stats.bindings {
        let entries = load_all(storage.clone(), binding)?;
        bindings.insert(binding.clone(), serde_json::to_value(entries)?);
    }

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "total_entries": stats.total_entries,
        "missed_entries": stats.missed_entries,
        "bindings": bindings,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

fn cmd_prune(
    storage: Arc<RedbStorage>,
    older_than: i64,
    binding: Option<&str>,
    dry_run: bool,
) -> Result<()> {
    let cutoff = Utc::now() - Duration::days(older_than);
    let bindings: Vec<String> = match binding {
        Some(b) => vec![b.to_string()],
        None => CallLogStore::bindings(storage.as_ref())?,
    };

    if dry_run {
        println!("=== DRY RUN — no data will be deleted ===\n");
    }

    let mut pruned_total = 0;
    for binding in &bindings {
        let entries = load_all(storage.clone(), binding)?;
        let (old, keep): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|entry| entry.date < cutoff);
        if old.is_empty() {
            continue;
        }

        pruned_total += old.len();
        if dry_run {
            println!("{}: would prune {} entries", binding, old.len());
            for entry in &old {
                println!(
                    "  - {} ({}, {})",
                    entry.id,
                    entry.contact_name,
                    entry.date.format("%Y-%m-%d")
                );
            }
        } else {
            CallLogStore::new(storage.clone(), binding).save(&keep)?;
            println!("{}: pruned {} entries", binding, old.len());
        }
    }

    if dry_run {
        println!("\nWould prune {} entries older than {} days", pruned_total, older_than);
    } else {
        println!("Pruned {} entries (older than {} days)", pruned_total, older_than);
    }

    Ok(())
}
