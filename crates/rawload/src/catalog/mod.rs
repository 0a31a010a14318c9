//! Dataset catalog
//!
//! A [`DatasetCatalog`] is the validated, immutable description of every
//! dataset the loader manages: where its source object lives, which table it
//! lands in, the table's column layout, and which datasets it depends on.
//! It is built once at startup and shared read-only by every component.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;

use crate::error::{LoadError, Result};
use crate::resolver::DependencyGraph;

mod olist;

pub use olist::olist_catalog;

/// Naming convention for tables owned by the loader
pub const MANAGED_TABLE_SUFFIX: &str = "_raw";

/// Column type of a destination table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    /// 64-bit integer (`BIGINT`)
    Integer,
    /// `DOUBLE PRECISION`
    Float,
    /// `TIMESTAMP` without time zone
    Timestamp,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "BIGINT",
            ColumnType::Float => "DOUBLE PRECISION",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Float)
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Timestamp)
    }
}

/// One source-object to destination-table mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetDescriptor {
    /// Dataset identifier, e.g. `orders`
    pub name: String,
    /// File name of the source object under the configured prefix
    pub object_name: String,
    /// Destination table
    pub table: String,
    pub columns: Vec<ColumnSpec>,
    /// Primary key columns; empty for tables without a natural key
    pub primary_key: Vec<String>,
    /// Datasets that must be loaded before this one
    pub parents: Vec<String>,
    rank: usize,
}

impl DatasetDescriptor {
    pub fn new(
        name: impl Into<String>,
        object_name: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            object_name: object_name.into(),
            table: table.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            parents: Vec::new(),
            rank: 0,
        }
    }

    pub fn with_columns(mut self, columns: Vec<ColumnSpec>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_parents(mut self, parents: &[&str]) -> Self {
        self.parents = parents.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Dependency rank: 0 for roots, `1 + max(rank(parent))` otherwise
    ///
    /// Only meaningful on descriptors owned by a [`DatasetCatalog`].
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// Validated, immutable set of datasets with their resolved load order
#[derive(Debug, Clone)]
pub struct DatasetCatalog {
    datasets: Vec<DatasetDescriptor>,
    load_order: Vec<usize>,
    by_name: HashMap<String, usize>,
}

impl DatasetCatalog {
    /// Validate `datasets` and resolve their load order
    pub fn new(mut datasets: Vec<DatasetDescriptor>) -> Result<Self> {
        if datasets.is_empty() {
            return Err(LoadError::InvalidCatalog("catalog declares no datasets".into()));
        }

        let mut by_name = HashMap::with_capacity(datasets.len());
        let mut tables = HashSet::with_capacity(datasets.len());
        for (idx, dataset) in datasets.iter().enumerate() {
            validate_descriptor(dataset)?;
            if by_name.insert(dataset.name.clone(), idx).is_some() {
                return Err(LoadError::InvalidCatalog(format!(
                    "dataset '{}' declared more than once",
                    dataset.name
                )));
            }
            if !tables.insert(dataset.table.as_str()) {
                return Err(LoadError::InvalidCatalog(format!(
                    "table '{}' is the destination of more than one dataset",
                    dataset.table
                )));
            }
        }

        for dataset in &datasets {
            for parent in &dataset.parents {
                let parent = by_name
                    .get(parent)
                    .map(|&idx| &datasets[idx])
                    .ok_or_else(|| {
                        LoadError::InvalidCatalog(format!(
                            "dataset '{}' depends on undeclared dataset '{}'",
                            dataset.name, parent
                        ))
                    })?;
                validate_reference(dataset, parent)?;
            }
        }

        let graph = DependencyGraph::from_descriptors(&datasets)?;
        let resolution = graph.resolve()?;
        for (dataset, rank) in datasets.iter_mut().zip(resolution.ranks) {
            dataset.rank = rank;
        }

        Ok(Self {
            datasets,
            load_order: resolution.order,
            by_name,
        })
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&DatasetDescriptor> {
        self.by_name.get(name).map(|&idx| &self.datasets[idx])
    }

    pub fn require(&self, name: &str) -> Result<&DatasetDescriptor> {
        self.get(name)
            .ok_or_else(|| LoadError::UnknownDataset(name.to_string()))
    }

    /// Datasets in declaration order
    pub fn declared(&self) -> impl Iterator<Item = &DatasetDescriptor> {
        self.datasets.iter()
    }

    /// Datasets in load order: every parent precedes each of its children
    pub fn load_order(&self) -> impl Iterator<Item = &DatasetDescriptor> {
        self.load_order.iter().map(|&idx| &self.datasets[idx])
    }

    /// Datasets that declare `name` as a direct parent
    pub fn children_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a DatasetDescriptor> {
        self.datasets
            .iter()
            .filter(move |d| d.parents.iter().any(|p| p == name))
    }

    /// Whether any other dataset's table holds a foreign key into `name`'s table
    pub fn is_referenced(&self, name: &str) -> bool {
        self.children_of(name).next().is_some()
    }

    /// Every dataset that depends on `name`, directly or transitively
    pub fn dependents_of(&self, name: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![name.to_string()];
        while let Some(current) = frontier.pop() {
            for child in self.children_of(&current) {
                if found.insert(child.name.clone()) {
                    frontier.push(child.name.clone());
                }
            }
        }
        found
    }

    pub fn table_names(&self) -> BTreeSet<String> {
        self.datasets.iter().map(|d| d.table.clone()).collect()
    }
}

fn validate_descriptor(dataset: &DatasetDescriptor) -> Result<()> {
    let invalid = |reason: String| Err(LoadError::InvalidCatalog(reason));

    if dataset.name.trim().is_empty() {
        return invalid("dataset name must not be empty".into());
    }
    if dataset.object_name.trim().is_empty() {
        return invalid(format!("dataset '{}' has no source object", dataset.name));
    }
    if !is_identifier(&dataset.table) || !dataset.table.ends_with(MANAGED_TABLE_SUFFIX) {
        return invalid(format!(
            "dataset '{}' targets table '{}', which is not a managed table name (expected a \
             lowercase identifier ending in '{}')",
            dataset.name, dataset.table, MANAGED_TABLE_SUFFIX
        ));
    }
    if dataset.parents.iter().any(|p| p == &dataset.name) {
        return invalid(format!("dataset '{}' depends on itself", dataset.name));
    }

    if dataset.columns.is_empty() {
        return invalid(format!("dataset '{}' declares no columns", dataset.name));
    }

    let mut seen = HashSet::new();
    for column in &dataset.columns {
        if !is_identifier(&column.name) {
            return invalid(format!(
                "dataset '{}' has invalid column name '{}'",
                dataset.name, column.name
            ));
        }
        if !seen.insert(column.name.as_str()) {
            return invalid(format!(
                "dataset '{}' declares column '{}' more than once",
                dataset.name, column.name
            ));
        }
    }

    for key in &dataset.primary_key {
        if !seen.contains(key.as_str()) {
            return invalid(format!(
                "primary key column '{}' of dataset '{}' is not a declared column",
                key, dataset.name
            ));
        }
    }

    Ok(())
}

/// A child references its parent through the parent's primary key columns
fn validate_reference(child: &DatasetDescriptor, parent: &DatasetDescriptor) -> Result<()> {
    if parent.primary_key.is_empty() {
        return Err(LoadError::InvalidCatalog(format!(
            "dataset '{}' depends on '{}', which has no primary key to reference",
            child.name, parent.name
        )));
    }
    for key in &parent.primary_key {
        let child_type = child.column(key).map(|c| c.column_type);
        let parent_type = parent.column(key).map(|c| c.column_type);
        if child_type.is_none() || child_type != parent_type {
            return Err(LoadError::InvalidCatalog(format!(
                "dataset '{}' must declare column '{}' with the same type as its parent '{}'",
                child.name, key, parent.name
            )));
        }
    }
    Ok(())
}

/// Lowercase SQL identifier safe to interpolate unquoted
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && name.len() <= 63
}
