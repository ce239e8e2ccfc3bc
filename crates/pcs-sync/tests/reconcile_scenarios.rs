use std::path::{Path, PathBuf};
use std::sync::Arc;

use pcs_core::{RunStatus, TargetId, TargetRecord, Trigger};
use pcs_source::{FixtureSourceConnector, MemorySourceConnector, RawProductRow};
use pcs_storage::InMemoryProductRepository;
use pcs_sync::{recent_outcomes, OrchestratorOptions, ReportWriter, SyncOrchestrator};
use tempfile::tempdir;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn orchestrator(
    source: Arc<MemorySourceConnector>,
    repo: Arc<InMemoryProductRepository>,
) -> SyncOrchestrator {
    SyncOrchestrator::new(source, repo, OrchestratorOptions::default())
}

#[tokio::test]
async fn first_sync_into_empty_target_creates_the_product() {
    let source = Arc::new(MemorySourceConnector::new(vec![RawProductRow::new("A1", "Widget", "EA", None)]));
    let repo = Arc::new(InMemoryProductRepository::new());

    let outcome = orchestrator(source, repo.clone()).run_sync(Trigger::Manual).await;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!((outcome.created, outcome.updated, outcome.deleted), (1, 0, 0));
    let records = repo.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].external_code.as_str(), "A1");
    assert_eq!(records[0].title, "Widget");
    assert_eq!(records[0].unit, "EA");
    assert_eq!(records[0].photo_path, None);
}

#[tokio::test]
async fn changed_description_updates_the_existing_record() {
    let source = Arc::new(MemorySourceConnector::new(vec![RawProductRow::new("A1", "Widget v2", "EA", None)]));
    let repo = Arc::new(InMemoryProductRepository::new());
    repo.seed(TargetRecord {
        id: TargetId(5),
        external_code: "A1".into(),
        title: "Widget".into(),
        unit: "EA".into(),
        photo_path: None,
    })
    .await;

    let outcome = orchestrator(source, repo.clone()).run_sync(Trigger::Manual).await;

    assert_eq!((outcome.created, outcome.updated, outcome.deleted), (0, 1, 0));
    assert_eq!(repo.get(TargetId(5)).await.expect("id 5 kept").title, "Widget v2");
}

#[tokio::test]
async fn emptied_catalog_removes_the_product() {
    let source = Arc::new(MemorySourceConnector::new(vec![]));
    let repo = Arc::new(InMemoryProductRepository::new());
    repo.seed(TargetRecord {
        id: TargetId(1),
        external_code: "A1".into(),
        title: "Widget".into(),
        unit: "EA".into(),
        photo_path: None,
    })
    .await;

    let outcome = orchestrator(source, repo.clone()).run_sync(Trigger::Scheduled).await;

    assert_eq!((outcome.created, outcome.updated, outcome.deleted), (0, 0, 1));
    assert!(repo.is_empty().await);
}

#[tokio::test]
async fn catalog_changes_between_runs_are_tracked() {
    let source = Arc::new(MemorySourceConnector::new(vec![
        RawProductRow::new("A1", "Widget", "EA", None),
        RawProductRow::new("B2", "Bolt", "UN", Some("fotos/b2.jpg")),
    ]));
    let repo = Arc::new(InMemoryProductRepository::new());
    let orchestrator = orchestrator(source.clone(), repo.clone());

    let first = orchestrator.run_sync(Trigger::Scheduled).await;
    let unchanged = orchestrator.run_sync(Trigger::Scheduled).await;
    assert_eq!((unchanged.created, unchanged.updated, unchanged.deleted), (0, 2, 0));
    assert_eq!(first.source_digest, unchanged.source_digest);

    source
        .set_rows(vec![
            RawProductRow::new("B2", "Bolt", "UN", None),
            RawProductRow::new("C3", "Cable", "M", None),
        ])
        .await;
    let changed = orchestrator.run_sync(Trigger::Manual).await;

    assert_eq!((changed.created, changed.updated, changed.deleted), (1, 1, 1));
    assert_ne!(first.source_digest, changed.source_digest);
    let mut codes: Vec<String> = repo
        .records()
        .await
        .into_iter()
        .map(|r| r.external_code.to_string())
        .collect();
    codes.sort();
    assert_eq!(codes, vec!["B2", "C3"]);
    let b2 = repo
        .records()
        .await
        .into_iter()
        .find(|r| r.external_code.as_str() == "B2")
        .expect("B2");
    assert_eq!(b2.photo_path, None);
}

#[tokio::test]
async fn fixture_snapshot_sync_persists_a_report() {
    let reports = tempdir().expect("tempdir");
    let source = Arc::new(FixtureSourceConnector::new(
        workspace_root().join("fixtures/products/sample.json"),
    ));
    let repo = Arc::new(InMemoryProductRepository::new());
    let orchestrator = SyncOrchestrator::new(source, repo.clone(), OrchestratorOptions::default())
        .with_reports(ReportWriter::new(reports.path()));

    let outcome = orchestrator.run_sync(Trigger::Cli).await;

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.created, 4);
    assert_eq!(outcome.invalid_rows, 1);
    assert_eq!(repo.len().await, 4);

    let saved = recent_outcomes(reports.path(), 5).await.expect("reports");
    assert_eq!(saved, vec![outcome.clone()]);
    assert!(reports
        .path()
        .join(outcome.run_id.to_string())
        .join("summary.md")
        .exists());
}
