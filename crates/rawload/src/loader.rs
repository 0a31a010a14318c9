//! Batch loader
//!
//! Replaces the contents of one destination table with the rows of its
//! staged source object. Parsing runs on a blocking worker and feeds the
//! insert loop through a bounded channel; the clear and every insert share
//! one transaction, so readers see either the old rows or the new ones.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{DatasetCatalog, DatasetDescriptor};
use crate::detector::{Detection, LoadDecision};
use crate::error::{ErrorKind, LoadError, Result};
use crate::records::{RecordReader, Row};
use crate::source::SourceHandle;
use crate::store::postgres::clamp_chunk_size;
use crate::store::{ClearStrategy, Destination, ReplaceTxn};

/// Parsed chunks buffered between the parser and the insert loop
const CHANNEL_DEPTH: usize = 4;

/// Terminal status of one dataset in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Succeeded,
    Skipped,
    Failed,
    /// Not attempted because a dataset it depends on failed
    Blocked,
    /// Rolled back after cancellation
    Cancelled,
}

impl std::fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoadStatus::Succeeded => "succeeded",
            LoadStatus::Skipped => "skipped",
            LoadStatus::Failed => "failed",
            LoadStatus::Blocked => "blocked",
            LoadStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Serializable description of the error that failed a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&LoadError> for FailureInfo {
    fn from(err: &LoadError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one dataset
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadResult {
    pub dataset: String,
    pub table: String,
    pub decision: Option<LoadDecision>,
    pub status: LoadStatus,
    pub source_rows: Option<u64>,
    pub rows_loaded: u64,
    /// Rows dropped because an earlier row had the same primary key
    pub duplicates_dropped: u64,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    /// Why a dataset was skipped or blocked
    pub note: Option<String>,
    pub error: Option<FailureInfo>,
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

impl LoadResult {
    fn new(dataset: &DatasetDescriptor, status: LoadStatus) -> Self {
        Self {
            dataset: dataset.name.clone(),
            table: dataset.table.clone(),
            decision: None,
            status,
            source_rows: None,
            rows_loaded: 0,
            duplicates_dropped: 0,
            duration: Duration::ZERO,
            note: None,
            error: None,
        }
    }

    /// Dataset left untouched because its source object is absent
    pub fn source_missing(dataset: &DatasetDescriptor, key: &str) -> Self {
        Self {
            note: Some(format!("source object {} not found", key)),
            ..Self::new(dataset, LoadStatus::Skipped)
        }
    }

    /// Dataset not attempted because `failed_parent` failed
    pub fn blocked(dataset: &DatasetDescriptor, failed_parent: &str) -> Self {
        Self {
            note: Some(format!("blocked by failed dataset {}", failed_parent)),
            ..Self::new(dataset, LoadStatus::Blocked)
        }
    }

    /// Dataset that failed before the loader ran (detection, staging)
    pub fn failed(dataset: &DatasetDescriptor, err: &LoadError) -> Self {
        let status = if matches!(err, LoadError::Cancelled) {
            LoadStatus::Cancelled
        } else {
            LoadStatus::Failed
        };
        Self {
            error: Some(err.into()),
            ..Self::new(dataset, status)
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

#[derive(Debug, Default)]
struct ReplaceStats {
    submitted: u64,
    inserted: u64,
}

/// Streams a dataset's records into its destination table
pub struct BatchLoader {
    destination: Arc<dyn Destination>,
    catalog: Arc<DatasetCatalog>,
    batch_size: usize,
}

impl BatchLoader {
    pub fn new(destination: Arc<dyn Destination>, catalog: Arc<DatasetCatalog>, batch_size: usize) -> Self {
        Self {
            destination,
            catalog,
            batch_size,
        }
    }

    /// Apply `detection` to `dataset`; never returns an error, failures land in the result
    #[instrument(skip_all, fields(dataset = %dataset.name, decision = %detection.decision))]
    pub async fn load(
        &self,
        dataset: &DatasetDescriptor,
        detection: &Detection,
        source: &SourceHandle,
        cancel: &CancellationToken,
    ) -> LoadResult {
        let started = Instant::now();
        let mut result = LoadResult {
            decision: Some(detection.decision),
            source_rows: detection.source_rows,
            ..LoadResult::new(dataset, LoadStatus::Failed)
        };

        match detection.decision {
            LoadDecision::Skip => {
                info!(rows = ?detection.destination_rows, "Source unchanged, skipping");
                result.status = LoadStatus::Skipped;
                result.note = Some("row counts match".to_string());
            },
            LoadDecision::MissingTarget => {
                let err = LoadError::SchemaNotReady {
                    table: dataset.table.clone(),
                };
                warn!(error = %err, "Cannot load dataset");
                result.error = Some((&err).into());
            },
            LoadDecision::Replace if detection.source_emptied() => {
                warn!(
                    rows = ?detection.destination_rows,
                    "Source object has no records, keeping table {}", dataset.table
                );
                result.status = LoadStatus::Skipped;
                result.note = Some("source object empty, table left untouched".to_string());
            },
            LoadDecision::Replace => match self.replace(dataset, source, cancel).await {
                Ok(stats) => {
                    result.status = LoadStatus::Succeeded;
                    result.rows_loaded = stats.inserted;
                    result.duplicates_dropped = stats.submitted - stats.inserted;
                    result.source_rows.get_or_insert(stats.submitted);
                    if result.duplicates_dropped > 0 {
                        warn!(
                            duplicates = result.duplicates_dropped,
                            "Dropped rows with duplicate primary keys"
                        );
                    }
                    info!(rows = stats.inserted, "Replaced table {}", dataset.table);
                },
                Err(LoadError::Cancelled) => {
                    warn!("Load cancelled, transaction rolled back");
                    result.status = LoadStatus::Cancelled;
                    result.error = Some((&LoadError::Cancelled).into());
                },
                Err(err) => {
                    warn!(error = %err, "Load failed, transaction rolled back");
                    result.error = Some((&err).into());
                },
            },
        }

        result.duration = started.elapsed();
        result
    }

    fn clear_strategy(&self, dataset: &DatasetDescriptor) -> ClearStrategy {
        if self.catalog.is_referenced(&dataset.name) {
            ClearStrategy::Delete
        } else {
            ClearStrategy::Truncate
        }
    }

    async fn replace(
        &self,
        dataset: &DatasetDescriptor,
        source: &SourceHandle,
        cancel: &CancellationToken,
    ) -> Result<ReplaceStats> {
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }

        let path = source.stage().await?.path().to_path_buf();
        let chunk_size = clamp_chunk_size(self.batch_size, dataset.columns.len());
        let (tx, mut rx) = mpsc::channel(CHANNEL_DEPTH);
        let descriptor = dataset.clone();
        let parser = tokio::task::spawn_blocking(move || parse_chunks(&descriptor, path, chunk_size, tx));

        let strategy = self.clear_strategy(dataset);
        debug!(?strategy, chunk_size, "Starting replace");

        let outcome = match self.destination.begin_replace(dataset, strategy).await {
            Ok(mut txn) => {
                let mut stats = ReplaceStats::default();
                match insert_chunks(txn.as_mut(), &mut rx, cancel, &mut stats).await {
                    Ok(()) => txn.commit().await.map(|()| stats),
                    Err(err) => {
                        // rollback failures are logged by the store; the first error wins
                        let _ = txn.rollback().await;
                        Err(err)
                    },
                }
            },
            Err(err) => Err(err),
        };

        drop(rx);
        if let Err(e) = parser.await {
            warn!(error = %e, "Parser task did not finish cleanly");
        }
        outcome
    }
}

/// Drain parsed chunks into `txn`, checking for cancellation between chunks
async fn insert_chunks(
    txn: &mut dyn ReplaceTxn,
    rx: &mut mpsc::Receiver<Result<Vec<Row>>>,
    cancel: &CancellationToken,
    stats: &mut ReplaceStats,
) -> Result<()> {
    loop {
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        match rx.recv().await {
            None => return Ok(()),
            Some(Err(err)) => return Err(err),
            Some(Ok(rows)) => {
                let inserted = txn.insert_chunk(&rows).await?;
                stats.submitted += rows.len() as u64;
                stats.inserted += inserted;
                debug!(rows = rows.len(), inserted, total = stats.inserted, "Inserted chunk");
            },
        }
    }
}

/// Parse the staged file into chunks; runs on a blocking thread
///
/// Stops quietly when the receiving side has gone away.
fn parse_chunks(
    dataset: &DatasetDescriptor,
    path: PathBuf,
    chunk_size: usize,
    tx: mpsc::Sender<Result<Vec<Row>>>,
) {
    let parsed = (|| -> Result<()> {
        let file = File::open(&path)?;
        let mut reader = RecordReader::new(dataset, BufReader::new(file))?;
        loop {
            let chunk = reader.next_chunk(chunk_size)?;
            if chunk.is_empty() {
                return Ok(());
            }
            if tx.blocking_send(Ok(chunk)).is_err() {
                return Ok(());
            }
        }
    })();

    if let Err(err) = parsed {
        let _ = tx.blocking_send(Err(err));
    }
}
