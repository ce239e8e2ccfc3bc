use std::sync::Arc;

use anyhow::{Context, Result};
use pcs_core::Trigger;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::orchestrator::SyncOrchestrator;

/// Scheduler with a single job that runs a sync on `cron`. The caller starts it.
pub async fn build_scheduler(orchestrator: Arc<SyncOrchestrator>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            let outcome = orchestrator.run_sync(Trigger::Scheduled).await;
            if outcome.status.is_success() {
                info!(run_id = %outcome.run_id, summary = %outcome.summary_line(), "scheduled sync finished");
            } else {
                warn!(run_id = %outcome.run_id, summary = %outcome.summary_line(), "scheduled sync did not complete");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<SyncOrchestrator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    let sched = build_scheduler(orchestrator, &config.sync_cron).await?;
    info!(cron = %config.sync_cron, "sync scheduler configured");
    Ok(Some(sched))
}
