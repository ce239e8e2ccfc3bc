//! Product catalog reconciliation: engine, orchestrator, run reports and scheduling.

use std::sync::Arc;

use anyhow::Result;
use pcs_core::{SyncOutcome, Trigger};
use pcs_source::SourceConnector;
use pcs_storage::{connect_target_pool, InMemoryProductRepository, PgProductRepository, TargetRepository};
use tracing::{info, warn};

pub mod config;
pub mod engine;
pub mod orchestrator;
pub mod reports;
pub mod scheduler;

pub use config::SyncConfig;
pub use engine::{AbortFlag, EngineReport, HaltReason, ReconciliationEngine};
pub use orchestrator::{OrchestratorOptions, SyncOrchestrator};
pub use reports::{recent_outcomes, report_recent_markdown, ReportWriter};
pub use scheduler::{build_scheduler, maybe_build_scheduler};

pub const CRATE_NAME: &str = "pcs-sync";

/// Wire the configured source connector and target repository into an orchestrator.
pub async fn build_orchestrator(config: &SyncConfig) -> Result<SyncOrchestrator> {
    let source = config.source_connector()?;
    let repository: Arc<dyn TargetRepository> = if config.uses_memory_target() {
        warn!("using in-memory target store; products will not persist past this process");
        Arc::new(InMemoryProductRepository::new())
    } else {
        let pool = connect_target_pool(&config.target_store_config()).await?;
        Arc::new(PgProductRepository::new(pool))
    };
    info!(source = %source.describe(), reports = %config.reports_dir.display(), "sync orchestrator ready");
    Ok(SyncOrchestrator::new(source, repository, config.orchestrator_options())
        .with_reports(ReportWriter::new(config.reports_dir.clone())))
}

pub async fn run_sync_once(config: &SyncConfig, trigger: Trigger) -> Result<SyncOutcome> {
    let orchestrator = build_orchestrator(config).await?;
    Ok(orchestrator.run_sync(trigger).await)
}

pub async fn run_sync_once_from_env() -> Result<SyncOutcome> {
    run_sync_once(&SyncConfig::from_env(), Trigger::Cli).await
}
