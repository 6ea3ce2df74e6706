//!
//! In-memory index store
//! ---------------------
//! Holds both dependency maps in process memory behind a single
//! `parking_lot::RwLock`. Mutating operations take the write lock for the
//! whole check-then-mutate-then-persist sequence, so no reader can observe a
//! half-applied mutation and no two snapshot writebacks can interleave.
//! Queries share the read lock.
//!
//! Persistence is optional: when a snapshot path is configured, every
//! successful mutation rewrites one JSON document of the form
//! `{"forward": {pkg: [deps..]}, "reverse": {pkg: [dependents..]}}`. The
//! rewrite goes through a sibling tmp file and `fs::rename` into place, so a
//! crash mid-write leaves either the old or the new snapshot, never a torn
//! one. A writeback failure is surfaced as an error to the caller; the
//! in-memory graph is already updated at that point and stays authoritative.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::PackageIndex;
use crate::error::IndexError;

/// The dependency graph: `forward` maps a package to the set of packages it
/// depends on, `reverse` maps a package to the set of packages that depend on
/// it. A package is indexed iff it is a `forward` key; a `reverse` entry
/// exists iff its set is non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Graph {
    pub(crate) forward: HashMap<String, BTreeSet<String>>,
    pub(crate) reverse: HashMap<String, BTreeSet<String>>,
}

/// In-memory package index with an optional on-disk JSON snapshot.
#[derive(Debug)]
pub struct MemoryIndex {
    state: RwLock<Graph>,
    snapshot: Option<PathBuf>,
}

impl MemoryIndex {
    /// Create an empty index with no persistence.
    pub fn new() -> Self {
        Self { state: RwLock::new(Graph::default()), snapshot: None }
    }

    /// Create an index backed by a JSON snapshot at `path`.
    ///
    /// An existing snapshot is loaded first; content that does not parse into
    /// the two expected top-level maps aborts startup with
    /// [`IndexError::CorruptSnapshot`] rather than silently starting empty.
    pub fn with_snapshot(path: PathBuf) -> Result<Self> {
        let graph = if path.exists() {
            let bytes = fs::read(&path)
                .map_err(|e| IndexError::Snapshot { path: path.clone(), source: e })?;
            let graph: Graph = serde_json::from_slice(&bytes).map_err(|e| {
                IndexError::CorruptSnapshot { path: path.clone(), reason: e.to_string() }
            })?;
            debug!(target: "deplex::index", "loaded snapshot '{}': {} packages", path.display(), graph.forward.len());
            graph
        } else {
            Graph::default()
        };
        Ok(Self { state: RwLock::new(graph), snapshot: Some(path) })
    }

    /// Rewrite the whole snapshot document. Called with the write lock held,
    /// which is what serializes concurrent writebacks.
    fn write_snapshot(&self, graph: &Graph) -> Result<(), IndexError> {
        let Some(path) = &self.snapshot else { return Ok(()) };
        let to_io = |e: serde_json::Error| std::io::Error::new(std::io::ErrorKind::Other, e);
        let bytes = serde_json::to_vec_pretty(graph)
            .map_err(|e| IndexError::Snapshot { path: path.clone(), source: to_io(e) })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)
            .map_err(|e| IndexError::Snapshot { path: path.clone(), source: e })?;
        fs::rename(&tmp, path)
            .map_err(|e| IndexError::Snapshot { path: path.clone(), source: e })?;
        Ok(())
    }

    /// Clone the current graph. Test support for state-equality assertions.
    #[cfg(test)]
    pub(crate) fn graph(&self) -> Graph {
        self.state.read().clone()
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageIndex for MemoryIndex {
    fn index(&self, package: &str, deps: &[String]) -> Result<bool> {
        let mut state = self.state.write();

        if state.forward.contains_key(package) {
            // Already indexed: succeed without touching the recorded dep set.
            return Ok(true);
        }
        if deps.iter().any(|d| !state.forward.contains_key(d.as_str())) {
            return Ok(false);
        }

        let dep_set: BTreeSet<String> = deps.iter().cloned().collect();
        for dep in &dep_set {
            state.reverse.entry(dep.clone()).or_default().insert(package.to_string());
        }
        state.forward.insert(package.to_string(), dep_set);
        debug!(target: "deplex::index", "indexed '{}' with {} dep(s)", package, deps.len());

        self.write_snapshot(&state)?;
        Ok(true)
    }

    fn remove(&self, package: &str) -> Result<bool> {
        let mut state = self.state.write();

        if !state.forward.contains_key(package) {
            return Ok(true);
        }
        if state.reverse.get(package).is_some_and(|s| !s.is_empty()) {
            return Ok(false);
        }

        if let Some(deps) = state.forward.remove(package) {
            for dep in deps {
                if let Some(dependents) = state.reverse.get_mut(&dep) {
                    dependents.remove(package);
                    if dependents.is_empty() {
                        state.reverse.remove(&dep);
                    }
                }
            }
        }
        state.reverse.remove(package);
        debug!(target: "deplex::index", "removed '{}'", package);

        self.write_snapshot(&state)?;
        Ok(true)
    }

    fn query(&self, package: &str) -> Result<bool> {
        Ok(self.state.read().forward.contains_key(package))
    }
}
