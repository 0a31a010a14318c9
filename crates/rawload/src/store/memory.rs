//! In-memory store implementations
//!
//! Used by the test suites to drive the detector, loader and pipeline
//! without Docker. Both stores support fault injection and expose counters
//! so tests can assert that nothing was downloaded or written.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{ClearStrategy, Destination, ObjectSource, ReplaceTxn, SchemaPlan};
use crate::catalog::{DatasetDescriptor, MANAGED_TABLE_SUFFIX};
use crate::error::{Endpoint, LoadError, Result};
use crate::records::Row;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Object source
// ============================================================================

#[derive(Debug, Default)]
struct SourceState {
    objects: BTreeMap<String, Vec<u8>>,
    unreachable: bool,
}

/// Bucket prefix held in memory
#[derive(Debug, Default)]
pub struct MemoryObjectSource {
    prefix: String,
    state: Mutex<SourceState>,
    downloads: AtomicUsize,
}

impl MemoryObjectSource {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Add an object named `object_name` under the prefix
    pub fn with_object(self, object_name: &str, body: impl Into<Vec<u8>>) -> Self {
        self.put(object_name, body);
        self
    }

    pub fn put(&self, object_name: &str, body: impl Into<Vec<u8>>) {
        let key = self.key_for(object_name);
        lock(&self.state).objects.insert(key, body.into());
    }

    /// Add an object outside the prefix; it must never be listed
    pub fn put_key(&self, key: &str, body: impl Into<Vec<u8>>) {
        lock(&self.state).objects.insert(key.to_string(), body.into());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// Number of completed downloads
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        if lock(&self.state).unreachable {
            return Err(LoadError::connectivity(Endpoint::ObjectStore, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectSource for MemoryObjectSource {
    fn location(&self) -> String {
        format!("memory://{}", self.prefix)
    }

    fn key_for(&self, object_name: &str) -> String {
        format!("{}{}", self.prefix, object_name)
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        self.check_reachable()?;
        Ok(lock(&self.state)
            .objects
            .keys()
            .filter(|key| key.starts_with(&self.prefix))
            .cloned()
            .collect())
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<u64> {
        self.check_reachable()?;
        let body = lock(&self.state)
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| LoadError::ObjectStore(format!("no such key: {}", key)))?;
        tokio::fs::write(dest, &body).await?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(body.len() as u64)
    }
}

// ============================================================================
// Destination
// ============================================================================

/// Failure injected into a table's replace transaction
#[derive(Debug, Clone)]
pub enum Fault {
    /// Inserting fails once this many chunks have been inserted
    InsertFails { after_chunks: usize },
    /// Committing reports a foreign key violation
    ForeignKeyAtCommit,
    /// Cancel `token` once this many chunks have been inserted
    CancelAfter {
        after_chunks: usize,
        token: CancellationToken,
    },
}

#[derive(Debug, Default)]
struct DestinationState {
    tables: BTreeMap<String, Vec<Row>>,
    faults: HashMap<String, Fault>,
    plans: Vec<SchemaPlan>,
    writes: usize,
    unreachable: bool,
}

/// Relational store held in memory with transactional replace semantics
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    state: Arc<Mutex<DestinationState>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) `table` with `rows`; not counted as a write
    pub fn with_table(self, table: &str, rows: Vec<Row>) -> Self {
        lock(&self.state).tables.insert(table.to_string(), rows);
        self
    }

    pub fn rows(&self, table: &str) -> Option<Vec<Row>> {
        lock(&self.state).tables.get(table).cloned()
    }

    pub fn has_table(&self, table: &str) -> bool {
        lock(&self.state).tables.contains_key(table)
    }

    pub fn inject_fault(&self, table: &str, fault: Fault) {
        lock(&self.state).faults.insert(table.to_string(), fault);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// Number of mutating operations performed (clear, insert, commit, DDL)
    pub fn write_count(&self) -> usize {
        lock(&self.state).writes
    }

    /// Schema plans applied so far
    pub fn applied_plans(&self) -> Vec<SchemaPlan> {
        lock(&self.state).plans.clone()
    }

    fn check_reachable(&self) -> Result<()> {
        if lock(&self.state).unreachable {
            return Err(LoadError::connectivity(Endpoint::Database, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn server_version(&self) -> Result<String> {
        self.check_reachable()?;
        Ok("in-memory".to_string())
    }

    async fn managed_tables(&self) -> Result<BTreeSet<String>> {
        self.check_reachable()?;
        Ok(lock(&self.state)
            .tables
            .keys()
            .filter(|name| name.ends_with(MANAGED_TABLE_SUFFIX))
            .cloned()
            .collect())
    }

    async fn row_count(&self, table: &str) -> Result<Option<u64>> {
        self.check_reachable()?;
        Ok(lock(&self.state)
            .tables
            .get(table)
            .map(|rows| rows.len() as u64))
    }

    async fn apply_schema(&self, plan: &SchemaPlan) -> Result<()> {
        self.check_reachable()?;
        let mut state = lock(&self.state);
        if plan.recreate {
            state.tables.clear();
        }
        for table in &plan.tables {
            state.tables.entry(table.clone()).or_default();
        }
        state.plans.push(plan.clone());
        state.writes += 1;
        Ok(())
    }

    async fn begin_replace(
        &self,
        dataset: &DatasetDescriptor,
        _strategy: ClearStrategy,
    ) -> Result<Box<dyn ReplaceTxn>> {
        self.check_reachable()?;
        let mut state = lock(&self.state);
        if !state.tables.contains_key(&dataset.table) {
            return Err(LoadError::SchemaNotReady {
                table: dataset.table.clone(),
            });
        }
        state.writes += 1;

        let key_positions = dataset
            .primary_key
            .iter()
            .filter_map(|key| dataset.columns.iter().position(|c| &c.name == key))
            .collect();

        Ok(Box::new(MemoryReplaceTxn {
            state: Arc::clone(&self.state),
            table: dataset.table.clone(),
            key_positions,
            staged: Vec::new(),
            seen: HashSet::new(),
            chunks: 0,
        }))
    }
}

/// Staged replacement, applied to the table only on commit
struct MemoryReplaceTxn {
    state: Arc<Mutex<DestinationState>>,
    table: String,
    key_positions: Vec<usize>,
    staged: Vec<Row>,
    seen: HashSet<String>,
    chunks: usize,
}

impl MemoryReplaceTxn {
    fn key(&self, row: &Row) -> Option<String> {
        if self.key_positions.is_empty() {
            return None;
        }
        let values: Vec<_> = self.key_positions.iter().map(|&idx| row.get(idx)).collect();
        Some(format!("{:?}", values))
    }
}

#[async_trait]
impl ReplaceTxn for MemoryReplaceTxn {
    async fn insert_chunk(&mut self, rows: &[Row]) -> Result<u64> {
        let fault = {
            let mut state = lock(&self.state);
            if state.unreachable {
                return Err(LoadError::connectivity(Endpoint::Database, "connection reset"));
            }
            state.writes += 1;
            state.faults.get(&self.table).cloned()
        };

        if let Some(Fault::InsertFails { after_chunks }) = &fault {
            if self.chunks >= *after_chunks {
                return Err(LoadError::Database(format!(
                    "injected insert failure on {}",
                    self.table
                )));
            }
        }

        let mut inserted = 0u64;
        for row in rows {
            let fresh = match self.key(row) {
                Some(key) => self.seen.insert(key),
                None => true,
            };
            if fresh {
                self.staged.push(row.clone());
                inserted += 1;
            }
        }
        self.chunks += 1;

        if let Some(Fault::CancelAfter { after_chunks, token }) = &fault {
            if self.chunks >= *after_chunks {
                token.cancel();
            }
        }

        Ok(inserted)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryReplaceTxn {
            state,
            table,
            staged,
            ..
        } = *self;
        let mut state = lock(&state);
        if let Some(Fault::ForeignKeyAtCommit) = state.faults.get(&table) {
            return Err(LoadError::ForeignKeyViolation {
                table,
                detail: "injected foreign key violation".to_string(),
            });
        }
        state.writes += 1;
        state.tables.insert(table, staged);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
