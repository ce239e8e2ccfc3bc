//! One-run-at-a-time driver around the reconciliation engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pcs_core::{ErrorKind, RunStatus, SyncErrorEntry, SyncOutcome, Trigger};
use pcs_source::{BackoffPolicy, RetryDisposition, SourceConnector, SourceError, SourceStream};
use pcs_storage::TargetRepository;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::engine::{AbortFlag, EngineReport, HaltReason, ReconciliationEngine};
use crate::reports::ReportWriter;

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub open_timeout: Duration,
    pub scan_timeout: Duration,
    pub connect_backoff: BackoffPolicy,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(30),
            scan_timeout: Duration::from_secs(900),
            connect_backoff: BackoffPolicy::default(),
        }
    }
}

pub struct SyncOrchestrator {
    source: Arc<dyn SourceConnector>,
    repository: Arc<dyn TargetRepository>,
    options: OrchestratorOptions,
    reports: Option<ReportWriter>,
    active: Mutex<()>,
    running: AtomicBool,
    abort: AbortFlag,
    last_outcome: RwLock<Option<SyncOutcome>>,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn SourceConnector>,
        repository: Arc<dyn TargetRepository>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            source,
            repository,
            options,
            reports: None,
            active: Mutex::new(()),
            running: AtomicBool::new(false),
            abort: AbortFlag::new(),
            last_outcome: RwLock::new(None),
        }
    }

    pub fn with_reports(mut self, writer: ReportWriter) -> Self {
        self.reports = Some(writer);
        self
    }

    pub fn reports(&self) -> Option<&ReportWriter> {
        self.reports.as_ref()
    }

    pub fn source_description(&self) -> String {
        self.source.describe()
    }

    /// Ask the active run, if any, to stop at the next record boundary.
    pub fn cancel(&self) {
        self.abort.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Latest outcome of a run that actually executed in this process.
    pub async fn last_outcome(&self) -> Option<SyncOutcome> {
        self.last_outcome.read().await.clone()
    }

    /// Run one full sync. A trigger that arrives while another run is active is reported as
    /// `Skipped` without touching the source or the target.
    pub async fn run_sync(&self, trigger: Trigger) -> SyncOutcome {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let Ok(_active) = self.active.try_lock() else {
            warn!(%run_id, %trigger, "sync already in progress; trigger skipped");
            return SyncOutcome::empty(run_id, trigger, RunStatus::Skipped, started_at);
        };
        let _running = RunningFlag::raise(&self.running);
        self.abort.reset();

        let span = info_span!("sync_run", %run_id, %trigger);
        let outcome = self
            .execute(run_id, trigger, started_at)
            .instrument(span)
            .await;

        if let Some(writer) = &self.reports {
            if let Err(err) = writer.write(&outcome).await {
                warn!(%run_id, error = %format!("{err:#}"), "failed to persist run report");
            }
        }
        *self.last_outcome.write().await = Some(outcome.clone());
        outcome
    }

    async fn execute(&self, run_id: Uuid, trigger: Trigger, started_at: chrono::DateTime<Utc>) -> SyncOutcome {
        info!(source = %self.source.describe(), "sync run started");

        let mut stream = match self.open_source().await {
            Ok(stream) => StreamGuard(Some(stream)),
            Err(err) => {
                warn!(error = %err, "could not open product source; run aborted");
                let mut outcome = SyncOutcome::empty(run_id, trigger, RunStatus::Failed, started_at);
                outcome
                    .errors
                    .push(SyncErrorEntry::new(ErrorKind::Connection, "open", err.to_string()));
                outcome.finished_at = Utc::now();
                return outcome;
            }
        };

        let engine = ReconciliationEngine::new(self.options.scan_timeout);
        let report = match stream.0.as_deref_mut() {
            Some(source) => engine.run(source, self.repository.as_ref(), &self.abort).await,
            None => EngineReport::default(),
        };
        stream.close().await;

        let outcome = outcome_from_report(run_id, trigger, started_at, report);
        info!(summary = %outcome.summary_line(), "sync run finished");
        outcome
    }

    async fn open_source(&self) -> Result<Box<dyn SourceStream>, SourceError> {
        let backoff = self.options.connect_backoff;
        let mut attempt = 0usize;
        loop {
            let result = match tokio::time::timeout(self.options.open_timeout, self.source.open()).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout {
                    phase: "open",
                    secs: self.options.open_timeout.as_secs(),
                }),
            };

            match result {
                Ok(stream) => return Ok(stream),
                Err(err) if err.disposition() == RetryDisposition::Retryable && attempt < backoff.max_retries => {
                    let delay = backoff.delay_for_attempt(attempt);
                    warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %err, "retrying source connection");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Held for the lifetime of a run so `is_running` never has to probe the run lock.
struct RunningFlag<'a>(&'a AtomicBool);

impl<'a> RunningFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the open source stream. If the run future is dropped before `close`, the stream is
/// closed on a background task instead.
struct StreamGuard(Option<Box<dyn SourceStream>>);

impl StreamGuard {
    async fn close(&mut self) {
        if let Some(mut stream) = self.0.take() {
            if let Err(err) = stream.close().await {
                warn!(error = %err, "closing product source failed");
            }
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let Some(mut stream) = self.0.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("sync run dropped before the source was closed; closing in background");
                handle.spawn(async move {
                    match stream.close().await {
                        Ok(()) => debug!("product source closed after dropped run"),
                        Err(err) => warn!(error = %err, "closing product source failed"),
                    }
                });
            }
            Err(_) => warn!("no runtime available to close the product source"),
        }
    }
}

fn outcome_from_report(
    run_id: Uuid,
    trigger: Trigger,
    started_at: chrono::DateTime<Utc>,
    report: EngineReport,
) -> SyncOutcome {
    let status = match &report.halted {
        Some(HaltReason::Cancelled) => RunStatus::Cancelled,
        Some(_) => RunStatus::Failed,
        None if report.skipped > 0 || report.delete_failures > 0 || report.listing_failed => {
            RunStatus::PartiallyFailed
        }
        None => RunStatus::Succeeded,
    };

    SyncOutcome {
        run_id,
        trigger,
        status,
        started_at,
        finished_at: Utc::now(),
        created: report.created,
        updated: report.updated,
        skipped: report.skipped,
        deleted: report.deleted,
        delete_failures: report.delete_failures,
        invalid_rows: report.invalid_rows,
        source_digest: report.source_digest,
        errors: report.errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use pcs_source::{MemorySourceConnector, RawProductRow};
    use pcs_storage::InMemoryProductRepository;
    use tokio::sync::Notify;

    fn quick_options() -> OrchestratorOptions {
        OrchestratorOptions {
            open_timeout: Duration::from_millis(200),
            scan_timeout: Duration::from_secs(5),
            connect_backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        }
    }

    #[tokio::test]
    async fn connection_failure_is_fatal_and_mutates_nothing() {
        let source = Arc::new(MemorySourceConnector::default().failing_open("ORA-01017: invalid username/password"));
        let repo = Arc::new(InMemoryProductRepository::new());
        repo.seed(pcs_core::TargetRecord {
            id: pcs_core::TargetId(1),
            external_code: "A1".into(),
            title: "Widget".into(),
            unit: "EA".into(),
            photo_path: None,
        })
        .await;
        let orchestrator = SyncOrchestrator::new(source.clone(), repo.clone(), quick_options());

        let outcome = orchestrator.run_sync(Trigger::Manual).await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.errors[0].kind, ErrorKind::Connection);
        assert!(outcome.errors[0].message.contains("invalid username"));
        assert_eq!(repo.len().await, 1);
        assert_eq!(source.open_count(), 0);
    }

    #[tokio::test]
    async fn source_is_closed_even_when_scan_fails() {
        let source = Arc::new(
            MemorySourceConnector::new(vec![
                RawProductRow::new("A1", "Widget", "EA", None),
                RawProductRow::new("B2", "Bolt", "EA", None),
            ])
            .failing_after(1),
        );
        let repo = Arc::new(InMemoryProductRepository::new());
        let orchestrator = SyncOrchestrator::new(source.clone(), repo, quick_options());

        let outcome = orchestrator.run_sync(Trigger::Cli).await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.created, 1);
        assert_eq!(source.close_count(), 1);
        assert_eq!(orchestrator.last_outcome().await, Some(outcome));
    }

    #[tokio::test]
    async fn partial_failures_are_reported_not_fatal() {
        let source = Arc::new(MemorySourceConnector::new(vec![
            RawProductRow::new("A1", "Widget", "EA", None),
            RawProductRow {
                codprod: None,
                ..Default::default()
            },
        ]));
        let repo = Arc::new(InMemoryProductRepository::new());
        let orchestrator = SyncOrchestrator::new(source, repo, quick_options());

        let outcome = orchestrator.run_sync(Trigger::Manual).await;

        // Bad keys are warnings, not failures.
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.invalid_rows, 1);
        assert_eq!(outcome.created, 1);
        assert!(outcome.source_digest.is_some());
    }

    /// Fails the first `failures` opens with a retryable error, then delegates.
    struct FlakyConnector {
        inner: MemorySourceConnector,
        failures: usize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl SourceConnector for FlakyConnector {
        fn describe(&self) -> String {
            "flaky".into()
        }

        async fn open(&self) -> Result<Box<dyn SourceStream>, SourceError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(SourceError::Connection {
                    message: "connection reset".into(),
                    retryable: true,
                    source: None,
                });
            }
            self.inner.open().await
        }
    }

    #[tokio::test]
    async fn transient_open_failures_are_retried_with_backoff() {
        let source = Arc::new(FlakyConnector {
            inner: MemorySourceConnector::new(vec![RawProductRow::new("A1", "Widget", "EA", None)]),
            failures: 2,
            attempts: AtomicUsize::new(0),
        });
        let repo = Arc::new(InMemoryProductRepository::new());
        let orchestrator = SyncOrchestrator::new(source.clone(), repo.clone(), quick_options());

        let outcome = orchestrator.run_sync(Trigger::Scheduled).await;

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(source.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(repo.len().await, 1);

        let exhausted = Arc::new(FlakyConnector {
            inner: MemorySourceConnector::default(),
            failures: 10,
            attempts: AtomicUsize::new(0),
        });
        let orchestrator = SyncOrchestrator::new(exhausted.clone(), repo, quick_options());
        let outcome = orchestrator.run_sync(Trigger::Scheduled).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(exhausted.attempts.load(Ordering::SeqCst), 3);
    }

    /// Blocks inside `open` until released, so a run can be held active.
    struct GatedConnector {
        inner: MemorySourceConnector,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl SourceConnector for GatedConnector {
        fn describe(&self) -> String {
            "gated".into()
        }

        async fn open(&self) -> Result<Box<dyn SourceStream>, SourceError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.open().await
        }
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped() {
        let source = Arc::new(GatedConnector {
            inner: MemorySourceConnector::new(vec![RawProductRow::new("A1", "Widget", "EA", None)]),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let repo = Arc::new(InMemoryProductRepository::new());
        let options = OrchestratorOptions {
            open_timeout: Duration::from_secs(5),
            ..quick_options()
        };
        let orchestrator = Arc::new(SyncOrchestrator::new(source.clone(), repo.clone(), options));

        let first = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.run_sync(Trigger::Scheduled).await }
        });
        source.entered.notified().await;
        assert!(orchestrator.is_running());

        let second = orchestrator.run_sync(Trigger::Manual).await;
        assert_eq!(second.status, RunStatus::Skipped);
        assert_eq!(second.created, 0);

        source.release.notify_one();
        let first = first.await.expect("join");
        assert_eq!(first.status, RunStatus::Succeeded);
        assert_eq!(first.created, 1);
        assert!(!orchestrator.is_running());
        assert_eq!(orchestrator.last_outcome().await.map(|o| o.run_id), Some(first.run_id));
    }

    #[tokio::test]
    async fn overlapping_trigger_carries_no_error_entries() {
        let source = Arc::new(GatedConnector {
            inner: MemorySourceConnector::default(),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let options = OrchestratorOptions {
            open_timeout: Duration::from_secs(5),
            ..quick_options()
        };
        let orchestrator = Arc::new(SyncOrchestrator::new(
            source.clone(),
            Arc::new(InMemoryProductRepository::new()),
            options,
        ));
        let first = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.run_sync(Trigger::Scheduled).await }
        });
        source.entered.notified().await;

        let second = orchestrator.run_sync(Trigger::Manual).await;
        assert_eq!(second.status, RunStatus::Skipped);
        assert!(second.errors.is_empty());

        source.release.notify_one();
        first.await.expect("join");
    }

    #[test]
    fn polling_is_running_never_blocks_a_trigger() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("runtime");
        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::new(MemorySourceConnector::default()),
            Arc::new(InMemoryProductRepository::new()),
            quick_options(),
        ));
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let poller = std::thread::spawn({
            let orchestrator = orchestrator.clone();
            let stop = stop.clone();
            move || {
                while !stop.load(Ordering::SeqCst) {
                    std::hint::black_box(orchestrator.is_running());
                }
            }
        });

        let skipped = runtime.block_on(async {
            let mut skipped = 0;
            for _ in 0..2000 {
                if orchestrator.run_sync(Trigger::Scheduled).await.status == RunStatus::Skipped {
                    skipped += 1;
                }
            }
            skipped
        });
        stop.store(true, Ordering::SeqCst);
        poller.join().expect("poller");

        assert_eq!(skipped, 0);
        assert!(!orchestrator.is_running());
    }

    /// Delegates to the in-memory store after sleeping in `create`.
    struct SlowCreateRepository {
        inner: InMemoryProductRepository,
        delay: Duration,
    }

    #[async_trait]
    impl TargetRepository for SlowCreateRepository {
        async fn find_by_external_code(
            &self,
            code: &pcs_core::ExternalCode,
        ) -> Result<Option<pcs_core::TargetRecord>, pcs_storage::RepositoryError> {
            self.inner.find_by_external_code(code).await
        }

        async fn create(&self, fields: &pcs_core::ProductFields) -> Result<pcs_core::TargetId, pcs_storage::RepositoryError> {
            tokio::time::sleep(self.delay).await;
            self.inner.create(fields).await
        }

        async fn update(
            &self,
            id: pcs_core::TargetId,
            fields: &pcs_core::ProductFields,
        ) -> Result<(), pcs_storage::RepositoryError> {
            self.inner.update(id, fields).await
        }

        async fn list_all_external_codes(
            &self,
        ) -> Result<Vec<(pcs_core::TargetId, pcs_core::ExternalCode)>, pcs_storage::RepositoryError> {
            self.inner.list_all_external_codes().await
        }

        async fn delete(&self, id: pcs_core::TargetId) -> Result<(), pcs_storage::RepositoryError> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn dropped_run_still_closes_the_source_and_releases_the_guard() {
        let source = Arc::new(MemorySourceConnector::new(vec![
            RawProductRow::new("A1", "Widget", "EA", None),
            RawProductRow::new("B2", "Bolt", "EA", None),
        ]));
        let repo = Arc::new(SlowCreateRepository {
            inner: InMemoryProductRepository::new(),
            delay: Duration::from_millis(300),
        });
        let orchestrator = SyncOrchestrator::new(source.clone(), repo, quick_options());

        let abandoned = tokio::time::timeout(Duration::from_millis(50), orchestrator.run_sync(Trigger::Manual)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.open_count(), 1);
        assert_eq!(source.close_count(), 1);
        assert!(!orchestrator.is_running());

        let next = orchestrator.run_sync(Trigger::Manual).await;
        assert_ne!(next.status, RunStatus::Skipped);
    }

    #[test]
    fn halted_reports_map_to_cancelled_or_failed() {
        let started_at = Utc::now();
        let cancelled = EngineReport {
            deleted: 1,
            halted: Some(HaltReason::Cancelled),
            ..EngineReport::default()
        };
        let outcome = outcome_from_report(Uuid::new_v4(), Trigger::Cli, started_at, cancelled);
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(outcome.deleted, 1);

        let timed_out = EngineReport {
            halted: Some(HaltReason::ScanTimeout(Duration::from_secs(1))),
            ..EngineReport::default()
        };
        let outcome = outcome_from_report(Uuid::new_v4(), Trigger::Cli, started_at, timed_out);
        assert_eq!(outcome.status, RunStatus::Failed);
    }

    /// `open` never resolves.
    struct HangingConnector {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl SourceConnector for HangingConnector {
        fn describe(&self) -> String {
            "hanging".into()
        }

        async fn open(&self) -> Result<Box<dyn SourceStream>, SourceError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<Result<Box<dyn SourceStream>, SourceError>>().await
        }
    }

    #[tokio::test]
    async fn hanging_open_times_out_is_retried_and_fails_the_run() {
        let source = Arc::new(HangingConnector {
            attempts: AtomicUsize::new(0),
        });
        let repo = Arc::new(InMemoryProductRepository::new());
        let options = OrchestratorOptions {
            open_timeout: Duration::from_millis(20),
            ..quick_options()
        };
        let orchestrator = SyncOrchestrator::new(source.clone(), repo.clone(), options);

        let outcome = orchestrator.run_sync(Trigger::Scheduled).await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(source.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.errors[0].kind, ErrorKind::Connection);
        assert!(outcome.errors[0].message.contains("open timed out"));
        assert!(repo.is_empty().await);
    }
}
