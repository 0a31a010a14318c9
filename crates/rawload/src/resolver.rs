//! Dependency resolution
//!
//! Orders datasets so that every parent is loaded before any of its
//! children. The sort is stable: whenever several datasets are ready, the
//! one declared first goes next, so the same catalog always yields the same
//! order.

use std::collections::HashMap;

use crate::catalog::DatasetDescriptor;
use crate::error::{LoadError, Result};

/// Directed graph over datasets; an edge parent → child means the child loads later
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    /// Parent indices per node, in declaration order
    parents: Vec<Vec<usize>>,
}

/// Outcome of resolving a [`DependencyGraph`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Node indices in load order
    pub order: Vec<usize>,
    /// Rank per node (declaration index)
    pub ranks: Vec<usize>,
}

impl DependencyGraph {
    /// Build the graph from `(name, parents)` pairs in declaration order
    pub fn new<N, P>(nodes: impl IntoIterator<Item = (N, Vec<P>)>) -> Result<Self>
    where
        N: Into<String>,
        P: AsRef<str>,
    {
        let nodes: Vec<(String, Vec<P>)> = nodes.into_iter().map(|(n, p)| (n.into(), p)).collect();
        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(idx, (name, _))| (name.as_str(), idx))
            .collect();

        let mut parents = Vec::with_capacity(nodes.len());
        for (name, declared) in &nodes {
            let mut resolved = Vec::with_capacity(declared.len());
            for parent in declared {
                let parent = parent.as_ref();
                let idx = index.get(parent).copied().ok_or_else(|| {
                    LoadError::InvalidCatalog(format!(
                        "dataset '{}' depends on undeclared dataset '{}'",
                        name, parent
                    ))
                })?;
                resolved.push(idx);
            }
            parents.push(resolved);
        }

        Ok(Self {
            names: nodes.into_iter().map(|(name, _)| name).collect(),
            parents,
        })
    }

    pub fn from_descriptors(descriptors: &[DatasetDescriptor]) -> Result<Self> {
        Self::new(
            descriptors
                .iter()
                .map(|d| (d.name.clone(), d.parents.clone())),
        )
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Stable topological sort with dependency ranks
    ///
    /// Fails with [`LoadError::CyclicDependency`] naming every dataset that
    /// could not be placed.
    pub fn resolve(&self) -> Result<Resolution> {
        let n = self.names.len();
        let mut placed = vec![false; n];
        let mut ranks = vec![0usize; n];
        let mut order = Vec::with_capacity(n);

        while order.len() < n {
            let ready = (0..n).find(|&idx| {
                !placed[idx] && self.parents[idx].iter().all(|&parent| placed[parent])
            });

            let Some(idx) = ready else {
                let unresolved = (0..n)
                    .filter(|&idx| !placed[idx])
                    .map(|idx| self.names[idx].clone())
                    .collect();
                return Err(LoadError::CyclicDependency {
                    datasets: unresolved,
                });
            };

            ranks[idx] = self.parents[idx]
                .iter()
                .map(|&parent| ranks[parent] + 1)
                .max()
                .unwrap_or(0);
            placed[idx] = true;
            order.push(idx);
        }

        Ok(Resolution { order, ranks })
    }

    /// Dataset names in load order
    pub fn resolve_names(&self) -> Result<Vec<String>> {
        let resolution = self.resolve()?;
        Ok(resolution
            .order
            .into_iter()
            .map(|idx| self.names[idx].clone())
            .collect())
    }
}
