//! Reconciliation of one source snapshot against the target product collection.
//!
//! Rows are upserted in source order. Once the stream is exhausted, every target record that was
//! not matched this run is deleted, except records whose code failed to write: an ambiguous state
//! never drives a delete. A scan that stops early (source failure, deadline, cancel) skips the
//! deletion phase entirely.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pcs_core::{ErrorKind, ExternalCode, ProductFields, SourceRecord, SyncErrorEntry, TargetId};
use pcs_source::{SourceRow, SourceStream};
use pcs_storage::{RepositoryError, TargetRepository};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Cooperative cancel signal, checked between records and between deletions.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    Cancelled,
    SourceFailed(String),
    ScanTimeout(Duration),
}

#[derive(Debug, Clone, Default)]
pub struct EngineReport {
    pub rows_read: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub delete_failures: usize,
    pub invalid_rows: usize,
    pub listing_failed: bool,
    pub halted: Option<HaltReason>,
    /// Order-independent SHA-256 over the valid rows; only set when the scan completed.
    pub source_digest: Option<String>,
    pub errors: Vec<SyncErrorEntry>,
}

enum Upserted {
    Created(TargetId),
    Updated(TargetId),
}

#[derive(Default)]
struct ScanState {
    seen_ids: HashSet<TargetId>,
    seen_codes: HashSet<ExternalCode>,
    skipped_codes: HashSet<ExternalCode>,
    row_digests: Vec<[u8; 32]>,
}

pub struct ReconciliationEngine {
    scan_timeout: Duration,
}

impl ReconciliationEngine {
    pub fn new(scan_timeout: Duration) -> Self {
        Self { scan_timeout }
    }

    pub async fn run(
        &self,
        source: &mut dyn SourceStream,
        repository: &dyn TargetRepository,
        abort: &AbortFlag,
    ) -> EngineReport {
        let mut report = EngineReport::default();
        let mut state = ScanState::default();
        let deadline = Instant::now() + self.scan_timeout;

        loop {
            if abort.is_cancelled() {
                halt(&mut report, HaltReason::Cancelled, "scan");
                break;
            }

            let row = match tokio::time::timeout_at(deadline, source.next_row()).await {
                Err(_) => {
                    halt(&mut report, HaltReason::ScanTimeout(self.scan_timeout), "scan");
                    break;
                }
                Ok(Err(err)) => {
                    halt(&mut report, HaltReason::SourceFailed(err.to_string()), "scan");
                    break;
                }
                Ok(Ok(None)) => break,
                Ok(Ok(Some(row))) => row,
            };
            report.rows_read += 1;

            match row {
                SourceRow::Invalid(issue) => {
                    warn!(row = issue.row_number, reason = %issue.reason, "skipping source row with bad key");
                    report.invalid_rows += 1;
                    report.errors.push(SyncErrorEntry::new(
                        ErrorKind::DataQuality,
                        format!("row {}", issue.row_number),
                        issue.reason,
                    ));
                }
                SourceRow::Valid(record) => {
                    state.row_digests.push(record_digest(&record));
                    self.apply_record(repository, record, &mut state, &mut report).await;
                }
            }
        }

        if report.halted.is_some() {
            warn!(
                rows_read = report.rows_read,
                "scan did not complete; skipping deletion phase"
            );
            return report;
        }

        report.source_digest = Some(snapshot_digest(&mut state.row_digests));
        self.delete_unmatched(repository, &state, &mut report, abort).await;

        info!(
            rows_read = report.rows_read,
            created = report.created,
            updated = report.updated,
            skipped = report.skipped,
            deleted = report.deleted,
            delete_failures = report.delete_failures,
            invalid_rows = report.invalid_rows,
            "reconciliation finished"
        );
        report
    }

    async fn apply_record(
        &self,
        repository: &dyn TargetRepository,
        record: SourceRecord,
        state: &mut ScanState,
        report: &mut EngineReport,
    ) {
        let code = record.external_code.clone();
        match upsert(repository, &record).await {
            Ok(Upserted::Created(id)) => {
                debug!(external_code = %code, id = %id, "created product");
                report.created += 1;
                state.seen_ids.insert(id);
                state.seen_codes.insert(code);
            }
            Ok(Upserted::Updated(id)) => {
                debug!(external_code = %code, id = %id, "updated product");
                report.updated += 1;
                state.seen_ids.insert(id);
                state.seen_codes.insert(code);
            }
            Err(err) => {
                warn!(external_code = %code, error = %err, "product write failed; record skipped");
                report.skipped += 1;
                report.errors.push(SyncErrorEntry::new(
                    ErrorKind::RecordProcessing,
                    format!("external_code={code}"),
                    err.to_string(),
                ));
                state.skipped_codes.insert(code);
            }
        }
    }

    async fn delete_unmatched(
        &self,
        repository: &dyn TargetRepository,
        state: &ScanState,
        report: &mut EngineReport,
        abort: &AbortFlag,
    ) {
        let existing = match repository.list_all_external_codes().await {
            Ok(existing) => existing,
            Err(err) => {
                warn!(error = %err, "listing target products failed; skipping deletion phase");
                report.listing_failed = true;
                report.errors.push(SyncErrorEntry::new(
                    ErrorKind::Listing,
                    "list_all_external_codes",
                    err.to_string(),
                ));
                return;
            }
        };

        for (id, code) in existing {
            if state.seen_ids.contains(&id) || state.skipped_codes.contains(&code) {
                continue;
            }
            if abort.is_cancelled() {
                halt(report, HaltReason::Cancelled, "deletion");
                return;
            }

            if state.seen_codes.contains(&code) {
                debug!(external_code = %code, id = %id, "removing duplicate holder of code");
            }
            match repository.delete(id).await {
                Ok(()) => {
                    debug!(external_code = %code, id = %id, "deleted stale product");
                    report.deleted += 1;
                }
                Err(err) => {
                    warn!(external_code = %code, id = %id, error = %err, "deleting stale product failed");
                    report.delete_failures += 1;
                    report.errors.push(SyncErrorEntry::new(
                        ErrorKind::Deletion,
                        format!("id={id} external_code={code}"),
                        err.to_string(),
                    ));
                }
            }
        }
    }
}

async fn upsert(repository: &dyn TargetRepository, record: &SourceRecord) -> Result<Upserted, RepositoryError> {
    let fields = ProductFields::from(record);
    match repository.find_by_external_code(&record.external_code).await? {
        Some(existing) => {
            repository.update(existing.id, &fields).await?;
            Ok(Upserted::Updated(existing.id))
        }
        None => repository.create(&fields).await.map(Upserted::Created),
    }
}

fn halt(report: &mut EngineReport, reason: HaltReason, phase: &str) {
    let (kind, message) = match &reason {
        HaltReason::Cancelled => (ErrorKind::Cancelled, "cancel requested".to_string()),
        HaltReason::SourceFailed(message) => (ErrorKind::Source, message.clone()),
        HaltReason::ScanTimeout(limit) => (
            ErrorKind::Source,
            format!("scan exceeded {} seconds", limit.as_secs()),
        ),
    };
    report.errors.push(SyncErrorEntry::new(kind, phase, message));
    report.halted = Some(reason);
}

fn record_digest(record: &SourceRecord) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in [
        record.external_code.as_str(),
        record.description.as_str(),
        record.unit.as_str(),
        record.photo_path.as_deref().unwrap_or_default(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update(b"\x1f");
    }
    hasher.update([u8::from(record.photo_path.is_some())]);
    hasher.finalize().into()
}

fn snapshot_digest(row_digests: &mut [[u8; 32]]) -> String {
    row_digests.sort_unstable();
    let mut hasher = Sha256::new();
    for digest in row_digests.iter() {
        hasher.update(digest);
    }
    hex::encode(hasher.finalize())
}
