//! Axum + Askama admin surface for triggering and inspecting catalog syncs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pcs_core::{RunStatus, SyncOutcome, Trigger};
use pcs_sync::{recent_outcomes, SyncConfig, SyncOrchestrator};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "pcs-web";

const DASHBOARD_RUNS: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub reports_dir: PathBuf,
}

impl AppState {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            orchestrator,
            reports_dir: reports_dir.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct RunRow {
    started_at: String,
    trigger: String,
    status: String,
    created: usize,
    updated: usize,
    deleted: usize,
    errors: usize,
}

impl From<&SyncOutcome> for RunRow {
    fn from(outcome: &SyncOutcome) -> Self {
        Self {
            started_at: outcome.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            trigger: outcome.trigger.to_string(),
            status: outcome.status.to_string(),
            created: outcome.created,
            updated: outcome.updated,
            deleted: outcome.deleted,
            errors: outcome.errors.len(),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    source: String,
    running: bool,
    runs: Vec<RunRow>,
}

#[derive(Template)]
#[template(path = "sync_result.html")]
struct SyncResultTemplate {
    succeeded: bool,
    status: String,
    run_id: String,
    created: usize,
    updated: usize,
    skipped: usize,
    deleted: usize,
    delete_failures: usize,
    invalid_rows: usize,
    errors: Vec<String>,
}

impl From<&SyncOutcome> for SyncResultTemplate {
    fn from(outcome: &SyncOutcome) -> Self {
        Self {
            succeeded: outcome.status.is_success(),
            status: outcome.status.to_string(),
            run_id: outcome.run_id.to_string(),
            created: outcome.created,
            updated: outcome.updated,
            skipped: outcome.skipped,
            deleted: outcome.deleted,
            delete_failures: outcome.delete_failures,
            invalid_rows: outcome.invalid_rows,
            errors: outcome
                .errors
                .iter()
                .map(|e| format!("{}: {}", e.context, e.message))
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    sync_running: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/sync", post(sync_form_handler))
        .route("/api/sync", post(api_sync_handler))
        .route("/api/runs", get(api_runs_handler))
        .route("/healthz", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &SyncConfig, orchestrator: Arc<SyncOrchestrator>) -> anyhow::Result<()> {
    let state = AppState::new(orchestrator, config.reports_dir.clone());
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "admin web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// HTTP status reported by the JSON trigger for a finished run.
pub fn status_code_for(status: RunStatus) -> StatusCode {
    match status {
        RunStatus::Skipped => StatusCode::CONFLICT,
        RunStatus::Failed => StatusCode::SERVICE_UNAVAILABLE,
        RunStatus::Succeeded | RunStatus::PartiallyFailed | RunStatus::Cancelled => StatusCode::OK,
    }
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_runs(&state).await {
        Ok(runs) => render_html(IndexTemplate {
            source: state.orchestrator.source_description(),
            running: state.orchestrator.is_running(),
            runs: runs.iter().map(RunRow::from).collect(),
        }),
        Err(err) => server_error(err),
    }
}

async fn sync_form_handler(State(state): State<Arc<AppState>>) -> Response {
    let outcome = match run_manual_sync(&state).await {
        Ok(outcome) => outcome,
        Err(err) => return server_error(err),
    };
    let tpl = SyncResultTemplate::from(&outcome);
    match tpl.render() {
        Ok(html) => (status_code_for(outcome.status), Html(html)).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

async fn api_sync_handler(State(state): State<Arc<AppState>>) -> Response {
    let outcome = match run_manual_sync(&state).await {
        Ok(outcome) => outcome,
        Err(err) => return server_error(err),
    };
    (status_code_for(outcome.status), Json(outcome)).into_response()
}

async fn api_runs_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_runs(&state).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        sync_running: state.orchestrator.is_running(),
    })
}

// Persisted reports first; without any, fall back to the last run held in memory.
async fn load_runs(state: &AppState) -> anyhow::Result<Vec<SyncOutcome>> {
    let runs = recent_outcomes(&state.reports_dir, DASHBOARD_RUNS).await?;
    if !runs.is_empty() {
        return Ok(runs);
    }
    Ok(state.orchestrator.last_outcome().await.into_iter().collect())
}

// The run is detached from the request so a client that disconnects cannot cut it short.
async fn run_manual_sync(state: &AppState) -> anyhow::Result<SyncOutcome> {
    let orchestrator = state.orchestrator.clone();
    let outcome = tokio::spawn(async move { orchestrator.run_sync(Trigger::Manual).await })
        .await
        .context("manual sync task failed")?;
    log_manual_outcome(&outcome);
    Ok(outcome)
}

fn log_manual_outcome(outcome: &SyncOutcome) {
    if outcome.status.is_success() {
        info!(run_id = %outcome.run_id, summary = %outcome.summary_line(), "manual sync finished");
    } else {
        warn!(run_id = %outcome.run_id, summary = %outcome.summary_line(), "manual sync did not complete");
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {err:#}")),
    )
        .into_response()
}
