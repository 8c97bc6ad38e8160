//! The store collaborator the collector works against.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use anyhow::Result;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::store_path::{StoreDir, StorePath};

mod local;

pub use local::LocalStore;

/// Errors surfaced by store bookkeeping.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("[SX800] '{path}' is not a valid store path: {reason}")]
    BadStorePath { path: String, reason: String },
    #[error("[SX801] path '{0}' is not in the store")]
    NotInStore(String),
    #[error("[SX802] path '{0}' is not valid")]
    InvalidPath(String),
    #[error("[SX803] cannot delete path '{path}' since it is still alive (referenced by {})", .referrers.join(", "))]
    PathInUse {
        path: String,
        referrers: Vec<String>,
    },
    #[error("[SX810] cycle detected in the references of '{path}' from '{parent}'")]
    TopoSortCycle { path: String, parent: String },
    #[error("[SX812] store database is corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadStorePath { .. } => "SX800",
            Self::NotInStore(_) => "SX801",
            Self::InvalidPath(_) => "SX802",
            Self::PathInUse { .. } => "SX803",
            Self::TopoSortCycle { .. } => "SX810",
            Self::Corrupt(_) => "SX812",
        }
    }
}

/// Metadata recorded for a valid store path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathInfo {
    pub path: StorePath,
    pub deriver: Option<StorePath>,
    pub references: BTreeSet<StorePath>,
    pub nar_size: u64,
    pub registration_time: i64,
}

impl PathInfo {
    #[must_use]
    pub fn new(path: StorePath) -> Self {
        Self {
            path,
            deriver: None,
            references: BTreeSet::new(),
            nar_size: 0,
            registration_time: 0,
        }
    }

    #[must_use]
    pub fn with_references(mut self, references: impl IntoIterator<Item = StorePath>) -> Self {
        self.references = references.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_deriver(mut self, deriver: StorePath) -> Self {
        self.deriver = Some(deriver);
        self
    }

    #[must_use]
    pub fn with_nar_size(mut self, nar_size: u64) -> Self {
        self.nar_size = nar_size;
        self
    }
}

/// Store operations the garbage collector depends on.
pub trait Store: Send + Sync {
    fn store_dir(&self) -> &StoreDir;

    fn is_valid_path(&self, path: &StorePath) -> Result<bool>;

    /// Fails with [`StoreError::InvalidPath`] when `path` is not registered.
    fn query_path_info(&self, path: &StorePath) -> Result<PathInfo>;

    fn query_references(&self, path: &StorePath) -> Result<BTreeSet<StorePath>> {
        Ok(self.query_path_info(path)?.references)
    }

    /// Valid paths that reference `path`, excluding `path` itself.
    fn query_referrers(&self, path: &StorePath) -> Result<BTreeSet<StorePath>>;

    /// Valid derivations recorded as producing `path`.
    fn query_valid_derivers(&self, path: &StorePath) -> Result<BTreeSet<StorePath>>;

    /// Output name to output path for a derivation.
    fn query_derivation_output_map(&self, drv: &StorePath) -> Result<BTreeMap<String, StorePath>>;

    /// Drop `path` from the bookkeeping. Fails with [`StoreError::PathInUse`]
    /// while another valid path still references it; invalid paths are a no-op.
    fn invalidate_path_checked(&self, path: &StorePath) -> Result<()>;

    /// Add everything reachable from `start` to `closure`.
    ///
    /// Forward edges are references, plus derivation outputs when
    /// `include_outputs` is set and the deriver when `include_derivers` is
    /// set. With `flip` the edges are walked backwards (referrers, valid
    /// derivers, and outputs derived from a derivation).
    fn compute_fs_closure(
        &self,
        start: &BTreeSet<StorePath>,
        closure: &mut BTreeSet<StorePath>,
        flip: bool,
        include_outputs: bool,
        include_derivers: bool,
    ) -> Result<()> {
        let mut queue: VecDeque<StorePath> = start.iter().cloned().collect();
        while let Some(path) = queue.pop_front() {
            if !closure.insert(path.clone()) {
                continue;
            }
            let mut edges = BTreeSet::new();
            if flip {
                edges.extend(self.query_referrers(&path)?);
                if include_outputs {
                    edges.extend(self.query_valid_derivers(&path)?);
                }
                if include_derivers && path.is_derivation() {
                    for output in self.query_derivation_output_map(&path)?.into_values() {
                        if self.is_valid_path(&output)?
                            && self.query_path_info(&output)?.deriver.as_ref() == Some(&path)
                        {
                            edges.insert(output);
                        }
                    }
                }
            } else {
                let info = self.query_path_info(&path)?;
                edges.extend(info.references);
                if include_outputs && path.is_derivation() {
                    for output in self.query_derivation_output_map(&path)?.into_values() {
                        if self.is_valid_path(&output)? {
                            edges.insert(output);
                        }
                    }
                }
                if include_derivers {
                    if let Some(deriver) = info.deriver {
                        if self.is_valid_path(&deriver)? {
                            edges.insert(deriver);
                        }
                    }
                }
            }
            queue.extend(edges.into_iter().filter(|edge| !closure.contains(edge)));
        }
        Ok(())
    }

    /// Order `paths` so that every path precedes the paths it references.
    /// References leaving the set are ignored.
    fn topo_sort_paths(&self, paths: &BTreeSet<StorePath>) -> Result<Vec<StorePath>> {
        let mut graph = DiGraph::<StorePath, ()>::new();
        let mut nodes: HashMap<&StorePath, NodeIndex> = HashMap::new();
        for path in paths {
            nodes.insert(path, graph.add_node(path.clone()));
        }
        for path in paths {
            if !self.is_valid_path(path)? {
                continue;
            }
            for reference in self.query_references(path)? {
                if reference == *path {
                    continue;
                }
                if let Some(target) = nodes.get(&reference) {
                    graph.add_edge(nodes[path], *target, ());
                }
            }
        }
        match toposort(&graph, None) {
            Ok(order) => Ok(order.into_iter().map(|idx| graph[idx].clone()).collect()),
            Err(cycle) => {
                let node = cycle.node_id();
                let parent = graph
                    .neighbors_directed(node, Direction::Incoming)
                    .next()
                    .map_or_else(String::new, |idx| graph[idx].to_string());
                Err(StoreError::TopoSortCycle {
                    path: graph[node].to_string(),
                    parent,
                }
                .into())
            }
        }
    }
}
