//! MediPost CLI - operator tooling for the offline-first record store.
//!
//! Inspect sync status, force a cycle, and work through the outbox and
//! dead-letter queue on a field device.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use medipost_app::{App, AppConfig};
use medipost_records::Patient;
use medipost_store::OutboxQueue;

#[derive(Parser)]
#[command(name = "medipost")]
#[command(about = "MediPost - offline-first clinical records")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Path to the configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file.
    Init {
        /// Where to write the configuration.
        #[arg(short, long)]
        path: PathBuf,
    },

    /// Show the current sync status.
    Status,

    /// Force a sync cycle now and report the outcome.
    Sync,

    /// List pending outbox entries.
    Outbox,

    /// Inspect and act on dead-lettered entries.
    DeadLetter {
        #[command(subcommand)]
        action: DeadLetterAction,
    },

    /// List or search patients in the local store.
    Patients {
        /// Substring to match against name, phone or village.
        #[arg(short, long)]
        search: Option<String>,

        /// Maximum results.
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum DeadLetterAction {
    /// List dead letters.
    List,
    /// Discard one dead letter permanently.
    Discard { entry_id: i64 },
    /// Put a dead letter back on the queue.
    Requeue { entry_id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Init { path } = &cli.command {
        return cmd_init(path);
    }

    let config = load_config(cli.config.as_deref())?;
    let app = App::start(config).context("Failed to start application")?;

    let result = match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::Status => cmd_status(&app),
        Commands::Sync => cmd_sync(&app).await,
        Commands::Outbox => cmd_outbox(&app),
        Commands::DeadLetter { action } => cmd_dead_letter(&app, action),
        Commands::Patients { search, limit } => cmd_patients(&app, search.as_deref(), limit),
    };

    app.shutdown().await;
    result
}

fn load_config(path: Option<&std::path::Path>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(AppConfig::default()),
    }
}

fn cmd_init(path: &PathBuf) -> Result<()> {
    let config = AppConfig::default();
    config.save(path).context("Failed to write config")?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn cmd_status(app: &App) -> Result<()> {
    let status = app.feed.recompute().context("Failed to read status")?;

    println!("Online:             {}", status.is_online);
    println!("Syncing:            {}", status.is_syncing);
    println!(
        "Last sync:          {}",
        status
            .last_sync_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    println!("Pending operations: {}", status.pending_operations);
    println!("Unsynced records:   {}", status.unsynced_entities);
    println!("Dead letters:       {}", status.dead_letters);
    Ok(())
}

async fn cmd_sync(app: &App) -> Result<()> {
    let report = app.force_sync().await.context("Sync failed")?;

    if report.offline {
        println!("Device is offline; nothing synced.");
        return Ok(());
    }
    println!(
        "Synced in {:?}: {} pushed, {} failed, {} dead-lettered, {} pulled, {} held",
        report.duration,
        report.pushed,
        report.push_failed,
        report.dead_lettered,
        report.pulled,
        report.held
    );
    for error in &report.errors {
        println!("  error: {error}");
    }
    Ok(())
}

fn cmd_outbox(app: &App) -> Result<()> {
    let outbox = OutboxQueue::new(app.store.clone());
    let entries = outbox
        .dequeue_batch(1000, 0)
        .context("Failed to read outbox")?;

    if entries.is_empty() {
        println!("Outbox is empty.");
        return Ok(());
    }
    for entry in entries {
        println!(
            "#{} {} {} {} (attempts: {}{})",
            entry.entry_id,
            entry.operation,
            entry.entity_type,
            entry.entity_id,
            entry.attempt_count,
            entry
                .last_error
                .map(|e| format!(", last error: {e}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn cmd_dead_letter(app: &App, action: DeadLetterAction) -> Result<()> {
    let outbox = OutboxQueue::new(app.store.clone());
    match action {
        DeadLetterAction::List => {
            let letters = outbox.dead_letters().context("Failed to read dead letters")?;
            if letters.is_empty() {
                println!("No dead letters.");
                return Ok(());
            }
            for letter in letters {
                println!(
                    "#{} {} {} {} failed {} ({})",
                    letter.entry_id,
                    letter.operation,
                    letter.entity_type,
                    letter.entity_id,
                    letter.failed_at.to_rfc3339(),
                    letter.reason
                );
            }
        }
        DeadLetterAction::Discard { entry_id } => {
            outbox
                .discard_dead_letter(entry_id)
                .context("Failed to discard dead letter")?;
            println!("Discarded dead letter #{entry_id}.");
        }
        DeadLetterAction::Requeue { entry_id } => {
            let entry = outbox
                .requeue_dead_letter(entry_id)
                .context("Failed to requeue dead letter")?;
            println!(
                "Requeued as #{} ({} {} {}).",
                entry.entry_id, entry.operation, entry.entity_type, entry.entity_id
            );
        }
    }
    Ok(())
}

fn cmd_patients(app: &App, search: Option<&str>, limit: usize) -> Result<()> {
    let patients: Vec<Patient> = match search {
        Some(query) => app
            .records
            .search_patients(query, limit)
            .context("Search failed")?,
        None => {
            let mut all = app.records.list::<Patient>().context("List failed")?;
            all.truncate(limit);
            all
        }
    };

    if patients.is_empty() {
        println!("No patients found.");
        return Ok(());
    }
    for patient in patients {
        println!(
            "{}  {} {}  {}",
            patient.id,
            patient.family_name,
            patient.given_name.unwrap_or_default(),
            patient.village.unwrap_or_default()
        );
    }
    Ok(())
}
