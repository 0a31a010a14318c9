//! External store contracts
//!
//! The loader talks to object storage through [`ObjectSource`] and to the
//! relational store through [`Destination`]/[`ReplaceTxn`]. Production code
//! uses [`S3ObjectSource`] and [`PgDestination`]; tests use the in-memory
//! implementations in `memory`, built only with the `testing` feature.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::catalog::DatasetDescriptor;
use crate::error::{Endpoint, LoadError, Result};
use crate::records::Row;

#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod postgres;
pub mod s3;

pub use postgres::PgDestination;
pub use s3::S3ObjectSource;

/// Read-only view of the bucket prefix holding the source objects
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Human-readable location, e.g. `s3://bucket/raw/`
    fn location(&self) -> String;

    /// Full object key for a file name under the configured prefix
    fn key_for(&self, object_name: &str) -> String;

    /// Every object key under the configured prefix
    async fn list_keys(&self) -> Result<Vec<String>>;

    /// Download `key` into `dest`, returning the number of bytes written
    async fn download(&self, key: &str, dest: &Path) -> Result<u64>;
}

/// How a replace clears the target table before inserting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearStrategy {
    /// `TRUNCATE TABLE ONLY`; only valid when no foreign key references the table
    Truncate,
    /// Transactional `DELETE FROM`, checked against deferred foreign keys at commit
    Delete,
}

/// Schema creation work produced by [`crate::schema`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaPlan {
    /// Drop and recreate the managed schema first
    pub recreate: bool,
    /// Tables created by the plan, in creation order
    pub tables: Vec<String>,
    /// Statements executed in order inside one transaction
    pub statements: Vec<String>,
}

/// Relational store holding the managed tables
#[async_trait]
pub trait Destination: Send + Sync {
    /// Short description of the server, used by connection checks
    async fn server_version(&self) -> Result<String>;

    /// Names of the managed tables present in the managed schema
    async fn managed_tables(&self) -> Result<BTreeSet<String>>;

    /// Row count of `table`, or `None` when the table does not exist
    async fn row_count(&self, table: &str) -> Result<Option<u64>>;

    /// Execute a schema plan atomically
    async fn apply_schema(&self, plan: &SchemaPlan) -> Result<()>;

    /// Open a transaction and clear `dataset`'s table inside it
    async fn begin_replace(
        &self,
        dataset: &DatasetDescriptor,
        strategy: ClearStrategy,
    ) -> Result<Box<dyn ReplaceTxn>>;
}

/// An open clear-and-insert transaction on one table
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait ReplaceTxn: Send {
    /// Insert `rows`, skipping rows whose key already exists
    ///
    /// Returns the number of rows actually inserted.
    async fn insert_chunk(&mut self, rows: &[Row]) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Run `fut` with a deadline, reporting expiry as a connectivity failure
pub async fn with_timeout<T, F>(target: Endpoint, operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(LoadError::connectivity(
            target,
            format!("{} timed out after {}s", operation, limit.as_secs_f64()),
        )),
    }
}
