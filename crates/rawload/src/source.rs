//! Source object staging
//!
//! A [`SourceHandle`] downloads its object at most once, on first use, into
//! a temporary file inside the run's [`StagingArea`]. The change detector and
//! the batch loader share the handle, so a dataset that is counted and then
//! replaced is only fetched once. Staged files are removed when the handle
//! (and finally the staging area) is dropped.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::{NamedTempFile, TempDir};
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use crate::catalog::DatasetDescriptor;
use crate::error::{LoadError, Result};
use crate::records::count_records;
use crate::store::ObjectSource;

/// Per-run directory holding staged source objects
#[derive(Debug)]
pub struct StagingArea {
    dir: TempDir,
}

impl StagingArea {
    /// Create a fresh directory under `base`, or under the system temp dir
    pub fn new(base: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("rawload-");
        let dir = match base {
            Some(base) => {
                std::fs::create_dir_all(base)?;
                builder.tempdir_in(base)?
            },
            None => builder.tempdir()?,
        };
        debug!(path = %dir.path().display(), "Created staging area");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// A downloaded copy of one source object
#[derive(Debug)]
pub struct StagedObject {
    file: NamedTempFile,
    bytes: u64,
}

impl StagedObject {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// Lazily staged source object of one dataset
pub struct SourceHandle {
    source: Arc<dyn ObjectSource>,
    dataset: String,
    key: String,
    staging_dir: PathBuf,
    staged: OnceCell<StagedObject>,
    records: OnceCell<u64>,
}

impl std::fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceHandle")
            .field("dataset", &self.dataset)
            .field("key", &self.key)
            .field("staged", &self.staged.get())
            .finish()
    }
}

impl SourceHandle {
    pub fn new(source: Arc<dyn ObjectSource>, dataset: &DatasetDescriptor, staging: &StagingArea) -> Self {
        let key = source.key_for(&dataset.object_name);
        Self {
            source,
            dataset: dataset.name.clone(),
            key,
            staging_dir: staging.path().to_path_buf(),
            staged: OnceCell::new(),
            records: OnceCell::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_staged(&self) -> bool {
        self.staged.initialized()
    }

    /// Download the object unless that already happened
    #[instrument(skip(self), fields(dataset = %self.dataset, key = %self.key))]
    pub async fn stage(&self) -> Result<&StagedObject> {
        self.staged
            .get_or_try_init(|| async {
                let file = tempfile::Builder::new()
                    .prefix(&format!("{}-", self.dataset))
                    .suffix(".csv")
                    .tempfile_in(&self.staging_dir)?;
                let bytes = self.source.download(&self.key, file.path()).await?;
                debug!(bytes, "Staged source object");
                Ok::<_, LoadError>(StagedObject { file, bytes })
            })
            .await
    }

    /// Number of data records in the object, counted by streaming the staged copy
    pub async fn record_count(&self) -> Result<u64> {
        self.records
            .get_or_try_init(|| async {
                let path = self.stage().await?.path().to_path_buf();
                let dataset = self.dataset.clone();
                tokio::task::spawn_blocking(move || {
                    let file = File::open(&path)?;
                    count_records(&dataset, BufReader::new(file))
                })
                .await
                .map_err(|e| LoadError::Io(std::io::Error::other(e)))?
            })
            .await
            .copied()
    }
}
