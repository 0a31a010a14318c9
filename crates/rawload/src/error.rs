//! Loader error types

use serde::Serialize;
use thiserror::Error;

/// Result type alias for loader operations
pub type Result<T> = std::result::Result<T, LoadError>;

/// External system an operation talked to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    ObjectStore,
    Database,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::ObjectStore => f.write_str("object storage"),
            Endpoint::Database => f.write_str("database"),
        }
    }
}

/// Error taxonomy of the loader
#[derive(Error, Debug)]
pub enum LoadError {
    /// Store unreachable, authentication failure, or a network timeout
    #[error("{target} unreachable: {message}")]
    Connectivity { target: Endpoint, message: String },

    /// Destination table absent when a load was attempted
    #[error("Destination table '{table}' does not exist. Create the schema before loading.")]
    SchemaNotReady { table: String },

    #[error("Cyclic dependency between datasets: {}", .datasets.join(", "))]
    CyclicDependency { datasets: Vec<String> },

    #[error("Malformed record in {dataset} at line {line}{}: {reason}", column_suffix(.column))]
    MalformedRecord {
        dataset: String,
        line: u64,
        column: Option<String>,
        reason: String,
    },

    /// Deferred foreign key check failed when committing a replace
    #[error("Foreign key violation while replacing {table}: {detail}")]
    ForeignKeyViolation { table: String, detail: String },

    #[error("Invalid dataset catalog: {0}")]
    InvalidCatalog(String),

    #[error("No source objects found under {location}")]
    NoSourceObjects { location: String },

    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("Load cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] rawload_common::CommonError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Object storage error: {0}")]
    ObjectStore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn column_suffix(column: &Option<String>) -> String {
    column
        .as_deref()
        .map(|c| format!(", column '{}'", c))
        .unwrap_or_default()
}

/// Stable, serializable classification of a [`LoadError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connectivity,
    SchemaNotReady,
    CyclicDependency,
    MalformedRecord,
    ForeignKeyViolation,
    InvalidCatalog,
    NoSourceObjects,
    UnknownDataset,
    Cancelled,
    Config,
    Database,
    ObjectStore,
    Io,
}

impl ErrorKind {
    /// Errors caused by the content of one dataset rather than by the environment
    ///
    /// Only these may be tolerated by the `continue_independent` failure policy.
    pub fn is_data_error(&self) -> bool {
        matches!(self, ErrorKind::MalformedRecord | ErrorKind::ForeignKeyViolation)
    }
}

impl LoadError {
    pub fn connectivity(target: Endpoint, message: impl Into<String>) -> Self {
        Self::Connectivity {
            target,
            message: message.into(),
        }
    }

    pub fn malformed(
        dataset: impl Into<String>,
        line: u64,
        column: Option<&str>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedRecord {
            dataset: dataset.into(),
            line,
            column: column.map(str::to_string),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::Connectivity { .. } => ErrorKind::Connectivity,
            LoadError::SchemaNotReady { .. } => ErrorKind::SchemaNotReady,
            LoadError::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            LoadError::MalformedRecord { .. } => ErrorKind::MalformedRecord,
            LoadError::ForeignKeyViolation { .. } => ErrorKind::ForeignKeyViolation,
            LoadError::InvalidCatalog(_) => ErrorKind::InvalidCatalog,
            LoadError::NoSourceObjects { .. } => ErrorKind::NoSourceObjects,
            LoadError::UnknownDataset(_) => ErrorKind::UnknownDataset,
            LoadError::Cancelled => ErrorKind::Cancelled,
            LoadError::Config(_) => ErrorKind::Config,
            LoadError::Database(_) => ErrorKind::Database,
            LoadError::ObjectStore(_) => ErrorKind::ObjectStore,
            LoadError::Io(_) => ErrorKind::Io,
        }
    }

    /// See [`ErrorKind::is_data_error`]
    pub fn is_data_error(&self) -> bool {
        self.kind().is_data_error()
    }
}

/// SQLSTATE class 28: invalid authorization specification
const SQLSTATE_AUTH_CLASS: &str = "28";
/// SQLSTATE 3D000: invalid catalog name (database does not exist)
const SQLSTATE_INVALID_CATALOG: &str = "3D000";

impl From<sqlx::Error> for LoadError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => LoadError::connectivity(Endpoint::Database, err.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
                if code.starts_with(SQLSTATE_AUTH_CLASS) || code == SQLSTATE_INVALID_CATALOG {
                    LoadError::connectivity(Endpoint::Database, err.to_string())
                } else {
                    LoadError::Database(err.to_string())
                }
            },
            _ => LoadError::Database(err.to_string()),
        }
    }
}
