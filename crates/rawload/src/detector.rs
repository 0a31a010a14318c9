//! Change detection
//!
//! Decides whether a dataset's destination table already matches its source.
//! The comparison is by row count only: a source edited without changing its
//! number of records is reported as unchanged.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::catalog::DatasetDescriptor;
use crate::error::Result;
use crate::source::SourceHandle;
use crate::store::Destination;

/// What the loader should do with a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadDecision {
    /// Destination already holds as many rows as the source
    Skip,
    /// Clear the destination table and reload it
    Replace,
    /// Destination table does not exist
    MissingTarget,
}

impl std::fmt::Display for LoadDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadDecision::Skip => f.write_str("skip"),
            LoadDecision::Replace => f.write_str("replace"),
            LoadDecision::MissingTarget => f.write_str("missing_target"),
        }
    }
}

/// A decision together with the counts it was based on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub decision: LoadDecision,
    /// `None` when the source was not inspected
    pub source_rows: Option<u64>,
    /// `None` when the table does not exist
    pub destination_rows: Option<u64>,
}

impl Detection {
    /// The source has no records while the destination still holds some
    ///
    /// Such a source is never loaded; an empty upload must not wipe a table.
    pub fn source_emptied(&self) -> bool {
        self.source_rows == Some(0) && self.destination_rows.is_some_and(|rows| rows > 0)
    }
}

pub struct ChangeDetector {
    destination: Arc<dyn Destination>,
}

impl ChangeDetector {
    pub fn new(destination: Arc<dyn Destination>) -> Self {
        Self { destination }
    }

    /// Compare destination and source row counts
    ///
    /// The destination is checked first; a missing table never causes a download.
    #[instrument(skip(self, dataset, source), fields(dataset = %dataset.name))]
    pub async fn decide(&self, dataset: &DatasetDescriptor, source: &SourceHandle) -> Result<Detection> {
        let Some(destination_rows) = self.destination.row_count(&dataset.table).await? else {
            debug!(table = %dataset.table, "Destination table missing");
            return Ok(Detection {
                decision: LoadDecision::MissingTarget,
                source_rows: None,
                destination_rows: None,
            });
        };

        let source_rows = source.record_count().await?;
        let decision = if source_rows == destination_rows {
            LoadDecision::Skip
        } else {
            LoadDecision::Replace
        };

        debug!(source_rows, destination_rows, %decision, "Compared row counts");

        Ok(Detection {
            decision,
            source_rows: Some(source_rows),
            destination_rows: Some(destination_rows),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::catalog::ColumnSpec;
    use crate::records::{Row, Value};
    use crate::source::StagingArea;
    use crate::store::memory::{MemoryDestination, MemoryObjectSource};

    fn parent() -> DatasetDescriptor {
        DatasetDescriptor::new("parent", "parent.csv", "parent_raw")
            .with_columns(vec![ColumnSpec::integer("id")])
            .with_primary_key(&["id"])
    }

    fn csv_with(rows: usize) -> String {
        let mut csv = String::from("id\n");
        for i in 0..rows {
            csv.push_str(&format!("{}\n", i));
        }
        csv
    }

    fn table_with(rows: usize) -> Vec<Row> {
        (0..rows).map(|i| vec![Value::Integer(i as i64)]).collect()
    }

    async fn detect(source_rows: usize, destination: MemoryDestination) -> (Detection, Arc<MemoryObjectSource>) {
        let source = Arc::new(MemoryObjectSource::new("raw/").with_object("parent.csv", csv_with(source_rows)));
        let staging = StagingArea::new(None).unwrap();
        let handle = SourceHandle::new(source.clone(), &parent(), &staging);
        let detection = ChangeDetector::new(Arc::new(destination))
            .decide(&parent(), &handle)
            .await
            .unwrap();
        (detection, source)
    }

    #[tokio::test]
    async fn test_missing_table_skips_download() {
        let (detection, source) = detect(3, MemoryDestination::new()).await;
        assert_eq!(detection.decision, LoadDecision::MissingTarget);
        assert_eq!(source.download_count(), 0);
    }

    #[tokio::test]
    async fn test_different_counts_replace() {
        let (detection, _) = detect(3, MemoryDestination::new().with_table("parent_raw", Vec::new())).await;
        assert_eq!(detection.decision, LoadDecision::Replace);
        assert_eq!(detection.source_rows, Some(3));
        assert_eq!(detection.destination_rows, Some(0));
    }

    #[tokio::test]
    async fn test_equal_counts_skip() {
        let destination = MemoryDestination::new().with_table("parent_raw", table_with(100));
        let (detection, _) = detect(100, destination.clone()).await;
        assert_eq!(detection.decision, LoadDecision::Skip);
        assert_eq!(destination.write_count(), 0);
    }

    #[tokio::test]
    async fn test_header_only_source_over_populated_table() {
        let (detection, _) = detect(0, MemoryDestination::new().with_table("parent_raw", table_with(2))).await;
        assert_eq!(detection.decision, LoadDecision::Replace);
        assert!(detection.source_emptied());

        let (detection, _) = detect(0, MemoryDestination::new().with_table("parent_raw", Vec::new())).await;
        assert_eq!(detection.decision, LoadDecision::Skip);
        assert!(!detection.source_emptied());
    }
}
