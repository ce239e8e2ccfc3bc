//! Source reader contracts plus the Postgres, fixture and in-memory catalog connectors.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pcs_core::{redact_database_url, ExternalCode, SourceRecord};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{Connection, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "pcs-source";

/// Currently-valid products: not soft-deleted and tagged with an `obs` other than `PV`.
/// A NULL `obs` fails the comparison, so untagged rows are left out.
pub const PRODUCT_QUERY: &str = "SELECT CAST(codprod AS TEXT) AS codprod, descricao, unidade, dirfotoprod \
     FROM pcprodut WHERE dtexclusao IS NULL AND obs <> 'PV'";

const CURSOR_NAME: &str = "pcs_products";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source connection failed: {message}")]
    Connection {
        message: String,
        retryable: bool,
        #[source]
        source: Option<BoxError>,
    },
    #[error("source {phase} timed out after {secs} seconds")]
    Timeout { phase: &'static str, secs: u64 },
    #[error("reading source rows failed: {message}")]
    Fetch {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("source stream already closed")]
    Closed,
}

impl SourceError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            retryable: false,
            source: None,
        }
    }

    fn from_sqlx_connect(context: String, err: sqlx::Error) -> Self {
        Self::Connection {
            message: format!("{context}: {err}"),
            retryable: classify_sqlx_error(&err) == RetryDisposition::Retryable,
            source: Some(Box::new(err)),
        }
    }

    fn from_sqlx_fetch(err: sqlx::Error) -> Self {
        Self::Fetch {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Connection { retryable: true, .. } | Self::Timeout { .. } => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut => RetryDisposition::Retryable,
        // cannot_connect_now, too_many_connections
        sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("57P03") | Some("53300")) => {
            RetryDisposition::Retryable
        }
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// One row as it comes out of the catalog, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawProductRow {
    #[serde(default, deserialize_with = "deserialize_code")]
    pub codprod: Option<String>,
    #[serde(default)]
    pub descricao: Option<String>,
    #[serde(default)]
    pub unidade: Option<String>,
    #[serde(default)]
    pub dirfotoprod: Option<String>,
}

impl RawProductRow {
    pub fn new(code: &str, description: &str, unit: &str, photo_path: Option<&str>) -> Self {
        Self {
            codprod: Some(code.to_string()),
            descricao: Some(description.to_string()),
            unidade: Some(unit.to_string()),
            dirfotoprod: photo_path.map(str::to_string),
        }
    }
}

impl From<&SourceRecord> for RawProductRow {
    fn from(record: &SourceRecord) -> Self {
        Self {
            codprod: Some(record.external_code.to_string()),
            descricao: Some(record.description.clone()),
            unidade: Some(record.unit.clone()),
            dirfotoprod: record.photo_path.clone(),
        }
    }
}

// Catalog codes are numeric upstream; fixtures may carry them as numbers or strings.
fn deserialize_code<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s)),
        Some(JsonValue::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "product code must be a string or number, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataQualityIssue {
    /// 1-based position in the stream.
    pub row_number: u64,
    pub reason: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRow {
    Valid(SourceRecord),
    Invalid(DataQualityIssue),
}

/// Validate a raw row. Only the key is required; other nulls become absent values.
pub fn decode_row(row_number: u64, raw: RawProductRow) -> SourceRow {
    let code = match raw.codprod {
        Some(code) if !code.trim().is_empty() => code,
        Some(_) => {
            return SourceRow::Invalid(DataQualityIssue {
                row_number,
                reason: "product code is blank".to_string(),
                description: raw.descricao,
            })
        }
        None => {
            return SourceRow::Invalid(DataQualityIssue {
                row_number,
                reason: "product code is null".to_string(),
                description: raw.descricao,
            })
        }
    };

    SourceRow::Valid(SourceRecord {
        external_code: ExternalCode::new(code),
        description: raw.descricao.unwrap_or_default(),
        unit: raw.unidade.unwrap_or_default(),
        photo_path: raw.dirfotoprod.filter(|p| !p.is_empty()),
    })
}

/// Opens a fresh, single-consumer scan of the catalog.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Human-readable target for logs; must not contain credentials.
    fn describe(&self) -> String;

    async fn open(&self) -> Result<Box<dyn SourceStream>, SourceError>;
}

/// Lazy, finite, non-restartable sequence of catalog rows.
#[async_trait]
pub trait SourceStream: Send {
    /// `Ok(None)` marks the end of the stream.
    async fn next_row(&mut self) -> Result<Option<SourceRow>, SourceError>;

    /// Release the underlying connection. Safe to call more than once.
    async fn close(&mut self) -> Result<(), SourceError>;
}

#[derive(Debug, Clone)]
pub struct PgSourceConfig {
    pub database_url: String,
    pub fetch_batch_size: usize,
}

/// Reads the catalog from Postgres through a server-side cursor, one batch at a time.
#[derive(Debug, Clone)]
pub struct PgSourceConnector {
    config: PgSourceConfig,
}

impl PgSourceConnector {
    pub fn new(config: PgSourceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SourceConnector for PgSourceConnector {
    fn describe(&self) -> String {
        redact_database_url(&self.config.database_url)
    }

    async fn open(&self) -> Result<Box<dyn SourceStream>, SourceError> {
        let target = self.describe();
        let mut conn = PgConnection::connect(&self.config.database_url)
            .await
            .map_err(|e| SourceError::from_sqlx_connect(format!("connecting to {target}"), e))?;

        let declare = format!("DECLARE {CURSOR_NAME} NO SCROLL CURSOR FOR {PRODUCT_QUERY}");
        let prepared = match sqlx::query("BEGIN READ ONLY").execute(&mut conn).await {
            Ok(_) => sqlx::query(&declare).execute(&mut conn).await,
            Err(err) => Err(err),
        };
        if let Err(err) = prepared {
            if let Err(close_err) = conn.close().await {
                warn!(source = %target, error = %close_err, "closing source connection after failed open");
            }
            return Err(SourceError::from_sqlx_connect(
                format!("opening product cursor on {target}"),
                err,
            ));
        }

        info!(source = %target, "product cursor opened");
        let batch_size = self.config.fetch_batch_size.max(1);
        Ok(Box::new(PgSourceStream {
            conn: Some(conn),
            fetch_sql: format!("FETCH FORWARD {batch_size} FROM {CURSOR_NAME}"),
            batch_size,
            buffer: VecDeque::new(),
            exhausted: false,
            rows_read: 0,
        }))
    }
}

pub struct PgSourceStream {
    conn: Option<PgConnection>,
    fetch_sql: String,
    batch_size: usize,
    buffer: VecDeque<RawProductRow>,
    exhausted: bool,
    rows_read: u64,
}

fn raw_row_from_pg(row: &PgRow) -> Result<RawProductRow, sqlx::Error> {
    Ok(RawProductRow {
        codprod: row.try_get("codprod")?,
        descricao: row.try_get("descricao")?,
        unidade: row.try_get("unidade")?,
        dirfotoprod: row.try_get("dirfotoprod")?,
    })
}

#[async_trait]
impl SourceStream for PgSourceStream {
    async fn next_row(&mut self) -> Result<Option<SourceRow>, SourceError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(SourceError::Closed);
        };

        if self.buffer.is_empty() && !self.exhausted {
            let rows = sqlx::query(&self.fetch_sql)
                .fetch_all(&mut *conn)
                .await
                .map_err(SourceError::from_sqlx_fetch)?;
            if rows.len() < self.batch_size {
                self.exhausted = true;
            }
            debug!(rows = rows.len(), "fetched product batch");
            for row in &rows {
                self.buffer
                    .push_back(raw_row_from_pg(row).map_err(SourceError::from_sqlx_fetch)?);
            }
        }

        Ok(self.buffer.pop_front().map(|raw| {
            self.rows_read += 1;
            decode_row(self.rows_read, raw)
        }))
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        self.buffer.clear();
        // Ending the transaction also drops the cursor.
        let rollback = sqlx::query("ROLLBACK").execute(&mut conn).await;
        let closed = conn.close().await;
        rollback.map_err(SourceError::from_sqlx_fetch)?;
        closed.map_err(SourceError::from_sqlx_fetch)?;
        debug!(rows = self.rows_read, "product cursor closed");
        Ok(())
    }
}

/// Captured catalog snapshot stored as JSON under `fixtures/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureSnapshot {
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
    pub rows: Vec<RawProductRow>,
}

pub async fn load_fixture_snapshot(path: impl AsRef<Path>) -> anyhow::Result<FixtureSnapshot> {
    let path = path.as_ref();
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Serves a JSON snapshot file as if it were the live catalog.
#[derive(Debug, Clone)]
pub struct FixtureSourceConnector {
    path: PathBuf,
}

impl FixtureSourceConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SourceConnector for FixtureSourceConnector {
    fn describe(&self) -> String {
        format!("fixture:{}", self.path.display())
    }

    async fn open(&self) -> Result<Box<dyn SourceStream>, SourceError> {
        let snapshot = load_fixture_snapshot(&self.path)
            .await
            .map_err(|err| SourceError::Connection {
                message: format!("{err:#}"),
                retryable: false,
                source: Some(err.into()),
            })?;
        info!(source = %self.describe(), rows = snapshot.rows.len(), "fixture snapshot loaded");
        Ok(Box::new(MemorySourceStream::new(snapshot.rows, None, None)))
    }
}

/// In-process catalog. Rows can be swapped between runs and failures injected.
#[derive(Debug, Default)]
pub struct MemorySourceConnector {
    rows: Mutex<Vec<RawProductRow>>,
    fail_open: Option<String>,
    fail_after: Option<usize>,
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl MemorySourceConnector {
    pub fn new(rows: Vec<RawProductRow>) -> Self {
        Self {
            rows: Mutex::new(rows),
            ..Self::default()
        }
    }

    pub fn from_records(records: &[SourceRecord]) -> Self {
        Self::new(records.iter().map(RawProductRow::from).collect())
    }

    /// Every `open` fails with a connection error.
    pub fn failing_open(mut self, message: impl Into<String>) -> Self {
        self.fail_open = Some(message.into());
        self
    }

    /// Streams fail with a fetch error after yielding `rows` rows.
    pub fn failing_after(mut self, rows: usize) -> Self {
        self.fail_after = Some(rows);
        self
    }

    pub async fn set_rows(&self, rows: Vec<RawProductRow>) {
        *self.rows.lock().await = rows;
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceConnector for MemorySourceConnector {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn open(&self) -> Result<Box<dyn SourceStream>, SourceError> {
        if let Some(message) = &self.fail_open {
            return Err(SourceError::connection(message.clone()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let rows = self.rows.lock().await.clone();
        Ok(Box::new(MemorySourceStream::new(
            rows,
            self.fail_after,
            Some(self.closes.clone()),
        )))
    }
}

pub struct MemorySourceStream {
    rows: VecDeque<RawProductRow>,
    rows_read: u64,
    fail_after: Option<usize>,
    closed: bool,
    close_counter: Option<Arc<AtomicUsize>>,
}

impl MemorySourceStream {
    fn new(rows: Vec<RawProductRow>, fail_after: Option<usize>, close_counter: Option<Arc<AtomicUsize>>) -> Self {
        Self {
            rows: rows.into(),
            rows_read: 0,
            fail_after,
            closed: false,
            close_counter,
        }
    }
}

#[async_trait]
impl SourceStream for MemorySourceStream {
    async fn next_row(&mut self) -> Result<Option<SourceRow>, SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }
        if self.fail_after.is_some_and(|n| self.rows_read as usize >= n) {
            return Err(SourceError::Fetch {
                message: format!("injected failure after {} rows", self.rows_read),
                source: None,
            });
        }
        Ok(self.rows.pop_front().map(|raw| {
            self.rows_read += 1;
            decode_row(self.rows_read, raw)
        }))
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        if !self.closed {
            self.closed = true;
            self.rows.clear();
            if let Some(counter) = &self.close_counter {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}
