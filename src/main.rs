//! # Dunning — paced billing reminders over chat
//!
//! Usage:
//!   dunning init                                   # Write default ~/.dunning/config.toml
//!   dunning run --recipients debtors.json          # Start a new run
//!   dunning run --recipients debtors.json --dry-run
//!   dunning resume <run-id>                        # Continue a stopped or crashed run
//!   dunning status <run-id>                        # Summary of a persisted run
//!   dunning runs                                   # List persisted runs

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dunning_channels::{DryRunTransport, PortalDocumentFetcher, WhatsAppTransport};
use dunning_core::clock::{Clock, SystemClock};
use dunning_core::config::{DunningConfig, expand_path};
use dunning_core::traits::Transport;
use dunning_dispatch::store::StoreSnapshot;
use dunning_dispatch::{
    BatchOrchestrator, DeliveryExecutor, RecipientStore, RunDb, RunPhase, RunSummary, ingest,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "dunning",
    version,
    about = "📨 Dunning — paced billing reminders over chat"
)]
struct Cli {
    /// Config file (default: ~/.dunning/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file if none exists
    Init,
    /// Start a new dispatch run
    Run {
        /// JSON array of recipient rows
        #[arg(short, long)]
        recipients: PathBuf,
        /// Log messages instead of sending them
        #[arg(long)]
        dry_run: bool,
        /// Explicit run id (default: generated)
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Resume a persisted run
    Resume {
        run_id: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Show the summary of a persisted run
    Status { run_id: String },
    /// List persisted runs
    Runs,
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose { "dunning=debug" } else { "dunning=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let config = match &cli.config {
        Some(path) => DunningConfig::load_from(path)?,
        None => DunningConfig::load()?,
    };

    match cli.command {
        Command::Init => {
            let path = DunningConfig::default_path();
            if path.exists() {
                println!("⚠️  Config already exists: {}", path.display());
            } else {
                DunningConfig::default().save()?;
                println!("✅ Config written: {}", path.display());
            }
            Ok(())
        }
        Command::Run {
            recipients,
            dry_run,
            run_id,
        } => start_run(&config, &recipients, dry_run, run_id).await,
        Command::Resume { run_id, dry_run } => resume_run(&config, &run_id, dry_run).await,
        Command::Status { run_id } => show_status(&config, &run_id),
        Command::Runs => list_runs(&config),
    }
}

fn open_db(config: &DunningConfig) -> Result<RunDb> {
    let path = expand_path(&config.store.db_path);
    RunDb::open(&path).with_context(|| format!("opening run database {}", path.display()))
}

fn build_executor(config: &DunningConfig, clock: Arc<dyn Clock>, dry_run: bool) -> DeliveryExecutor {
    let transport: Box<dyn Transport> = if dry_run {
        Box::new(DryRunTransport::new())
    } else {
        Box::new(WhatsAppTransport::new(config.whatsapp.clone()))
    };
    let executor = DeliveryExecutor::new(transport, clock, config);
    if config.documents.enabled {
        executor.with_documents(Box::new(PortalDocumentFetcher::new(&config.documents)))
    } else {
        executor
    }
}

async fn start_run(
    config: &DunningConfig,
    recipients: &std::path::Path,
    dry_run: bool,
    run_id: Option<String>,
) -> Result<()> {
    let report = ingest::load_json(recipients)?;
    if !report.rejected.is_empty() {
        println!("⚠️  {} rows rejected at ingestion:", report.rejected.len());
        for r in &report.rejected {
            println!("   row {}: {}", r.row, r.reason);
        }
    }

    let run_id = run_id.unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("run-{}", &id[..8])
    });
    let db = open_db(config)?;
    if db.load(&run_id)?.is_some() {
        anyhow::bail!("run '{run_id}' already exists; use `dunning resume {run_id}`");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut store = RecipientStore::new(config.retry.max_attempts, config.store.attempt_log_capacity);
    store.load(report.accepted, clock.now());

    let executor = build_executor(config, Arc::clone(&clock), dry_run);
    let orchestrator = BatchOrchestrator::new(&run_id, config, store, executor, clock).with_db(db)?;
    println!("🚀 Run {run_id} started");
    drive(orchestrator).await
}

async fn resume_run(config: &DunningConfig, run_id: &str, dry_run: bool) -> Result<()> {
    let db = open_db(config)?;
    let snapshot = db
        .load(run_id)?
        .with_context(|| format!("no persisted run '{run_id}'"))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let executor = build_executor(config, Arc::clone(&clock), dry_run);
    let orchestrator = BatchOrchestrator::resume(snapshot, config, executor, clock).with_db(db)?;
    println!("♻️  Run {run_id} resumed");
    drive(orchestrator).await
}

async fn drive(mut orchestrator: BatchOrchestrator) -> Result<()> {
    let stop = orchestrator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("🛑 Ctrl-C: finishing the current delivery, then stopping");
            stop.stop();
        }
    });

    orchestrator.set_on_progress(|snap| {
        tracing::debug!(
            sent = snap.sent,
            failed = snap.failed,
            pending = snap.pending,
            total = snap.total,
            "📈 Progress"
        );
    });

    let summary = orchestrator.run().await;
    println!("{summary}");
    if summary.phase == RunPhase::Error {
        anyhow::bail!(
            "run halted: {}",
            summary.halt_reason.unwrap_or_else(|| "unknown".into())
        );
    }
    Ok(())
}

fn show_status(config: &DunningConfig, run_id: &str) -> Result<()> {
    let db = open_db(config)?;
    let snapshot = db
        .load(run_id)?
        .with_context(|| format!("no persisted run '{run_id}'"))?;
    let elapsed = (snapshot.updated_at - snapshot.started_at)
        .to_std()
        .unwrap_or_default();
    let summary = RunSummary::build(
        &snapshot.run_id,
        snapshot.phase,
        StoreSnapshot::from_records(&snapshot.records),
        elapsed,
        snapshot.halt_reason.clone(),
        &snapshot.records,
    );
    println!("{summary}");
    if !snapshot.phase.is_terminal() {
        println!("⚠️  Run did not finish cleanly; continue it with `dunning resume {run_id}`");
    }
    Ok(())
}

fn list_runs(config: &DunningConfig) -> Result<()> {
    let db = open_db(config)?;
    let runs = db.list_runs()?;
    if runs.is_empty() {
        println!("📭 No runs yet");
        return Ok(());
    }
    println!(
        "{:<14} {:<9} {:<20} {:>6} {:>6} {:>6} {:>9}",
        "RUN", "PHASE", "STARTED", "TOTAL", "SENT", "FAILED", "REMAINING"
    );
    for run in runs {
        println!(
            "{:<14} {:<9} {:<20} {:>6} {:>6} {:>6} {:>9}",
            run.run_id,
            run.phase.as_str(),
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.total,
            run.sent,
            run.failed,
            run.remaining
        );
    }
    Ok(())
}
