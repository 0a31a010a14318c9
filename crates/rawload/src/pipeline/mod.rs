//! Pipeline orchestrator
//!
//! Drives one run through an explicit state machine:
//!
//! ```text
//! NotStarted -> SchemaReady -> Loading(1) -> ... -> Loading(n) -> Completed
//!          \____________\______________\________-> Failed(stage) | Cancelled
//! ```
//!
//! Datasets are processed strictly one after another in the catalog's load
//! order. Every dataset reached gets a [`LoadResult`]; the ones never reached
//! are listed as pending in the [`RunSummary`].

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::{DatasetCatalog, DatasetDescriptor};
use crate::config::{Config, FailurePolicy, DEFAULT_BATCH_SIZE, DEFAULT_DB_SCHEMA};
use crate::detector::ChangeDetector;
use crate::error::{LoadError, Result};
use crate::loader::{BatchLoader, LoadResult, LoadStatus};
use crate::schema::SchemaManager;
use crate::source::{SourceHandle, StagingArea};
use crate::store::{Destination, ObjectSource};

pub mod summary;

pub use summary::RunSummary;

/// Stage at which a run failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum FailedStage {
    Schema,
    Listing,
    Staging,
    /// 1-based position in the load order
    Dataset { index: usize, dataset: String },
}

impl std::fmt::Display for FailedStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailedStage::Schema => f.write_str("schema"),
            FailedStage::Listing => f.write_str("listing"),
            FailedStage::Staging => f.write_str("staging"),
            FailedStage::Dataset { index, dataset } => write!(f, "dataset {} ({})", index, dataset),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    SchemaReady,
    Loading { index: usize, dataset: String },
    Completed,
    Failed { stage: FailedStage },
    Cancelled,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::NotStarted => f.write_str("not started"),
            RunState::SchemaReady => f.write_str("schema ready"),
            RunState::Loading { index, dataset } => write!(f, "loading {} ({})", index, dataset),
            RunState::Completed => f.write_str("completed"),
            RunState::Failed { stage } => write!(f, "failed at {}", stage),
            RunState::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Drop and recreate the managed schema before loading
    pub force_schema_recreate: bool,
    pub failure_policy: FailurePolicy,
    pub batch_size: usize,
    pub temp_dir: Option<PathBuf>,
    pub schema: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            force_schema_recreate: false,
            failure_policy: FailurePolicy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            temp_dir: None,
            schema: DEFAULT_DB_SCHEMA.to_string(),
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &Config, force_schema_recreate: bool) -> Self {
        Self {
            force_schema_recreate,
            failure_policy: config.loader.failure_policy,
            batch_size: config.loader.batch_size,
            temp_dir: config.loader.temp_dir.clone(),
            schema: config.database.schema.clone(),
        }
    }
}

pub struct Pipeline {
    catalog: Arc<DatasetCatalog>,
    source: Arc<dyn ObjectSource>,
    schema: SchemaManager,
    detector: ChangeDetector,
    loader: BatchLoader,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        catalog: Arc<DatasetCatalog>,
        source: Arc<dyn ObjectSource>,
        destination: Arc<dyn Destination>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            schema: SchemaManager::new(destination.clone(), catalog.clone(), options.schema.clone()),
            detector: ChangeDetector::new(destination.clone()),
            loader: BatchLoader::new(destination, catalog.clone(), options.batch_size),
            catalog,
            source,
            options,
        }
    }

    /// Execute one run; the outcome, including any failure, is in the summary
    #[instrument(skip_all, fields(policy = %self.options.failure_policy))]
    pub async fn run(&self, cancel: &CancellationToken) -> RunSummary {
        let mut run = Run::new(&self.catalog, self.options.failure_policy);
        info!(run_id = %run.summary.run_id, datasets = self.catalog.len(), "Starting run");
        self.execute(&mut run, cancel).await;

        let mut summary = run.summary;
        summary.finished_at = Some(chrono::Utc::now());
        summary.log();
        summary
    }

    async fn execute(&self, run: &mut Run<'_>, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            run.cancel(0);
            return;
        }

        match self.schema.ensure_schema(self.options.force_schema_recreate).await {
            Ok(outcome) => {
                run.summary.schema = Some(outcome);
                run.transition(RunState::SchemaReady);
            },
            Err(err) => {
                error!(error = %err, "Schema preparation failed");
                run.fail(FailedStage::Schema, &err, 0);
                return;
            },
        }

        let keys = match self.list_sources().await {
            Ok(keys) => keys,
            Err(err) => {
                error!(error = %err, "Listing source objects failed");
                run.fail(FailedStage::Listing, &err, 0);
                return;
            },
        };

        let staging = match StagingArea::new(self.options.temp_dir.as_deref()) {
            Ok(staging) => staging,
            Err(err) => {
                error!(error = %err, "Creating staging directory failed");
                run.fail(FailedStage::Staging, &err, 0);
                return;
            },
        };

        // dataset -> failed ancestor that blocks it
        let mut blocked: BTreeMap<String, String> = BTreeMap::new();
        let mut first_failure: Option<FailedStage> = None;

        for (position, dataset) in run.order.clone().into_iter().enumerate() {
            if cancel.is_cancelled() {
                run.cancel(position);
                return;
            }

            let index = position + 1;
            run.transition(RunState::Loading {
                index,
                dataset: dataset.name.clone(),
            });

            let result = if let Some(parent) = blocked.get(&dataset.name) {
                warn!(dataset = %dataset.name, parent = %parent, "Blocked by failed dataset");
                LoadResult::blocked(dataset, parent)
            } else {
                let handle = SourceHandle::new(self.source.clone(), dataset, &staging);
                if keys.contains(handle.key()) {
                    self.load_dataset(dataset, &handle, cancel).await
                } else {
                    warn!(dataset = %dataset.name, key = %handle.key(), "Source object missing, table left untouched");
                    LoadResult::source_missing(dataset, handle.key())
                }
            };

            let status = result.status;
            let failure = result.error.clone();
            run.summary.results.push(result);

            match status {
                LoadStatus::Cancelled => {
                    run.cancel(index);
                    return;
                },
                LoadStatus::Failed => {
                    let tolerated = self.options.failure_policy == FailurePolicy::ContinueIndependent
                        && failure.as_ref().is_some_and(|f| f.kind.is_data_error());

                    if first_failure.is_none() {
                        run.summary.error = failure;
                    }
                    let stage = first_failure
                        .get_or_insert_with(|| FailedStage::Dataset {
                            index,
                            dataset: dataset.name.clone(),
                        })
                        .clone();

                    if !tolerated {
                        run.stop(stage, index);
                        return;
                    }

                    for dependent in self.catalog.dependents_of(&dataset.name) {
                        blocked.entry(dependent).or_insert_with(|| dataset.name.clone());
                    }
                },
                LoadStatus::Succeeded | LoadStatus::Skipped | LoadStatus::Blocked => {},
            }
        }

        match first_failure {
            Some(stage) => run.transition(RunState::Failed { stage }),
            None => run.transition(RunState::Completed),
        }
    }

    /// List the source prefix once; an empty listing means nothing can be loaded
    async fn list_sources(&self) -> Result<HashSet<String>> {
        let keys: HashSet<String> = self.source.list_keys().await?.into_iter().collect();
        if keys.is_empty() {
            return Err(LoadError::NoSourceObjects {
                location: self.source.location(),
            });
        }
        debug!(objects = keys.len(), "Listed source objects");
        Ok(keys)
    }

    async fn load_dataset(
        &self,
        dataset: &DatasetDescriptor,
        handle: &SourceHandle,
        cancel: &CancellationToken,
    ) -> LoadResult {
        let started = Instant::now();
        let mut result = match self.detector.decide(dataset, handle).await {
            Ok(detection) => {
                info!(dataset = %dataset.name, decision = %detection.decision, "Change detection finished");
                self.loader.load(dataset, &detection, handle, cancel).await
            },
            Err(err) => {
                warn!(dataset = %dataset.name, error = %err, "Change detection failed");
                LoadResult::failed(dataset, &err)
            },
        };
        result.duration = started.elapsed();
        result
    }
}

/// Mutable state of a run in progress
struct Run<'a> {
    order: Vec<&'a DatasetDescriptor>,
    summary: RunSummary,
}

impl<'a> Run<'a> {
    fn new(catalog: &'a DatasetCatalog, policy: FailurePolicy) -> Self {
        Self {
            order: catalog.load_order().collect(),
            summary: RunSummary::new(policy),
        }
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = %self.summary.state, to = %next, "Run state transition");
        self.summary.state = next;
    }

    /// Mark every dataset from `position` (0-based) onwards as pending
    fn defer_from(&mut self, position: usize) {
        self.summary.pending = self
            .order
            .iter()
            .skip(position)
            .map(|d| d.name.clone())
            .collect();
    }

    fn fail(&mut self, stage: FailedStage, err: &LoadError, pending_from: usize) {
        self.summary.error = Some(err.into());
        self.defer_from(pending_from);
        self.transition(RunState::Failed { stage });
    }

    fn stop(&mut self, stage: FailedStage, pending_from: usize) {
        self.defer_from(pending_from);
        self.transition(RunState::Failed { stage });
    }

    fn cancel(&mut self, pending_from: usize) {
        warn!("Cancellation requested, stopping run");
        self.defer_from(pending_from);
        self.transition(RunState::Cancelled);
    }
}
