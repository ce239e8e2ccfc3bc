//! Per-run report persistence under `reports/<run_id>/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pcs_core::SyncOutcome;
use tokio::fs;
use tracing::warn;

const OUTCOME_FILE: &str = "outcome.json";
const SUMMARY_FILE: &str = "summary.md";

#[derive(Debug, Clone)]
pub struct ReportWriter {
    root: PathBuf,
}

impl ReportWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn write(&self, outcome: &SyncOutcome) -> Result<PathBuf> {
        let run_dir = self.root.join(outcome.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let json = serde_json::to_vec_pretty(outcome).context("serializing run outcome")?;
        fs::write(run_dir.join(OUTCOME_FILE), json)
            .await
            .with_context(|| format!("writing {OUTCOME_FILE}"))?;
        fs::write(run_dir.join(SUMMARY_FILE), render_summary(outcome))
            .await
            .with_context(|| format!("writing {SUMMARY_FILE}"))?;

        Ok(run_dir)
    }
}

pub fn render_summary(outcome: &SyncOutcome) -> String {
    let mut lines = vec![
        format!("# Product Sync Run `{}`", outcome.run_id),
        String::new(),
        format!("- Trigger: {}", outcome.trigger),
        format!("- Status: {}", outcome.status),
        format!("- Started: {}", outcome.started_at),
        format!("- Finished: {}", outcome.finished_at),
        format!(
            "- Source digest: {}",
            outcome
                .source_digest
                .as_deref()
                .map(|d| format!("`{d}`"))
                .unwrap_or_else(|| "n/a".to_string())
        ),
        String::new(),
        "## Counts".to_string(),
        format!("- created: {}", outcome.created),
        format!("- updated: {}", outcome.updated),
        format!("- skipped: {}", outcome.skipped),
        format!("- deleted: {}", outcome.deleted),
        format!("- delete failures: {}", outcome.delete_failures),
        format!("- invalid rows: {}", outcome.invalid_rows),
    ];

    if !outcome.errors.is_empty() {
        lines.push(String::new());
        lines.push("## Errors".to_string());
        for entry in &outcome.errors {
            let kind = serde_json::to_value(entry.kind)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            lines.push(format!("- [{kind}] {}: {}", entry.context, entry.message));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Most recent outcomes first. A missing reports directory yields an empty list.
pub async fn recent_outcomes(root: &Path, limit: usize) -> Result<Vec<SyncOutcome>> {
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", root.display())),
    };

    let mut outcomes = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", root.display()))?
    {
        let path = entry.path().join(OUTCOME_FILE);
        let Ok(text) = fs::read_to_string(&path).await else {
            continue;
        };
        match serde_json::from_str::<SyncOutcome>(&text) {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => warn!(path = %path.display(), error = %err, "ignoring unreadable run report"),
        }
    }

    outcomes.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    outcomes.truncate(limit);
    Ok(outcomes)
}

pub async fn report_recent_markdown(root: &Path, runs: usize) -> Result<String> {
    let outcomes = recent_outcomes(root, runs).await?;
    let mut lines = vec!["# Product Sync Report".to_string(), String::new()];
    if outcomes.is_empty() {
        lines.push(format!("No runs recorded under `{}`.", root.display()));
    }
    for outcome in outcomes {
        lines.push(format!("## Run `{}`", outcome.run_id));
        lines.push(format!("- trigger: {}", outcome.trigger));
        lines.push(format!("- started: {}", outcome.started_at));
        lines.push(format!("- {}", outcome.summary_line()));
        lines.push(format!(
            "- summary: `{}`",
            root.join(outcome.run_id.to_string()).join(SUMMARY_FILE).display()
        ));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
