use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::builder::RangedU64ValueParser;
use clap::{Parser, Subcommand};
use pcs_core::{redact_database_url, Trigger};
use pcs_sync::{build_orchestrator, build_scheduler, maybe_build_scheduler, report_recent_markdown, SyncConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pcs-cli")]
#[command(about = "Product catalog sync command-line interface")]
struct Cli {
    /// YAML config file; environment variables override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync now. Ctrl-C stops it at the next record.
    Sync,
    /// Apply target database migrations.
    Migrate,
    /// Serve the admin web UI, plus the scheduler when enabled.
    Serve,
    /// Run the cron scheduler until Ctrl-C.
    Schedule,
    /// Print the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => return sync(&config).await,
        Commands::Migrate => migrate(&config).await?,
        Commands::Serve => serve(&config).await?,
        Commands::Schedule => schedule(&config).await?,
        Commands::Report { runs } => {
            println!("{}", report_recent_markdown(&config.reports_dir, runs).await?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn sync(config: &SyncConfig) -> Result<ExitCode> {
    let orchestrator = Arc::new(build_orchestrator(config).await?);
    let canceller = orchestrator.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling sync");
            canceller.cancel();
        }
    });

    let outcome = orchestrator.run_sync(Trigger::Cli).await;
    ctrl_c.abort();

    println!("sync {}: run_id={} {}", outcome.status, outcome.run_id, outcome.summary_line());
    for error in &outcome.errors {
        eprintln!("  {}: {}", error.context, error.message);
    }
    Ok(if outcome.status.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn migrate(config: &SyncConfig) -> Result<()> {
    if config.uses_memory_target() {
        bail!("migrate needs DATABASE_URL to point at a Postgres target");
    }
    let store = config.target_store_config();
    let pool = pcs_storage::connect_target_pool(&store).await?;
    pcs_storage::run_migrations(&pool).await?;
    info!(target = %redact_database_url(&store.database_url), "target migrations applied");
    Ok(())
}

async fn serve(config: &SyncConfig) -> Result<()> {
    let orchestrator = Arc::new(build_orchestrator(config).await?);
    let scheduler = maybe_build_scheduler(config, orchestrator.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }
    pcs_web::serve(config, orchestrator).await
}

async fn schedule(config: &SyncConfig) -> Result<()> {
    let orchestrator = Arc::new(build_orchestrator(config).await?);
    let mut sched = build_scheduler(orchestrator.clone(), &config.sync_cron).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
    orchestrator.cancel();
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}
