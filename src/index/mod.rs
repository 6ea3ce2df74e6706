//!
//! deplex index store
//! ------------------
//! The dependency graph behind the wire protocol: two mappings keyed by
//! package name, `forward` (package -> its declared dependencies) and
//! `reverse` (package -> the packages that declare it). A package can only be
//! indexed once every dependency it names is itself indexed, and can only be
//! removed once nothing depends on it.
//!
//! Two interchangeable store variants implement the [`PackageIndex`] contract:
//! - [`memory::MemoryIndex`] keeps both maps in process memory, optionally
//!   rewriting a single JSON snapshot after every successful mutation.
//! - [`fs::FilesystemIndex`] persists each package as a small file under
//!   `forward/<c>/` and `reverse/<c>/` bucket directories, suitable for an
//!   index directory shared with other tooling.
//!
//! Every operation returns `Ok(true)` / `Ok(false)` for the protocol OK/FAIL
//! outcomes. `Err` is reserved for real faults (snapshot writeback failure);
//! the filesystem variant maps its runtime I/O errors to `Ok(false)` itself
//! so one bad request cannot poison the connection.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::error::IndexError;

pub mod fs;
pub mod memory;

/// Common contract for the index store variants.
///
/// Implementations must make each operation observationally atomic with
/// respect to every other: no caller may observe a state where `forward` is
/// updated but `reverse` is not.
pub trait PackageIndex: Send + Sync {
    /// Add `package` with its declared dependencies.
    ///
    /// Returns `Ok(true)` if the package was indexed or was already present
    /// (re-indexing is idempotent and keeps the originally recorded
    /// dependency set). Returns `Ok(false)` if any named dependency is not
    /// itself indexed; the store is unchanged in that case. Duplicate names
    /// in `deps` collapse to one edge.
    fn index(&self, package: &str, deps: &[String]) -> Result<bool>;

    /// Remove `package` from the index.
    ///
    /// Returns `Ok(true)` if the package was removed or was never indexed.
    /// Returns `Ok(false)` while any other indexed package depends on it;
    /// the store is unchanged in that case.
    fn remove(&self, package: &str) -> Result<bool>;

    /// Return `Ok(true)` iff `package` is currently indexed.
    fn query(&self, package: &str) -> Result<bool>;
}

/// Shared handle used by the connection server. Construct once, clone freely.
pub type SharedIndex = Arc<dyn PackageIndex>;

/// Store variant selector, parsed from the `-t` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Filesystem,
    Memory,
}

impl std::str::FromStr for IndexKind {
    type Err = IndexError;

    fn from_str(s: &str) -> std::result::Result<Self, IndexError> {
        match s {
            "filesystem" => Ok(IndexKind::Filesystem),
            "memory" => Ok(IndexKind::Memory),
            other => Err(IndexError::UnknownKind(other.to_string())),
        }
    }
}

impl IndexKind {
    /// Construct the selected store variant rooted at `root`.
    ///
    /// The memory variant snapshots to `<root>/index.json`; the filesystem
    /// variant lays out its bucket directories directly under `root`. Both
    /// fail here, before the server binds, when the root is unusable or an
    /// existing snapshot is corrupt.
    pub fn open(self, root: &Path) -> Result<SharedIndex> {
        match self {
            IndexKind::Filesystem => Ok(Arc::new(fs::FilesystemIndex::open(root)?)),
            IndexKind::Memory => {
                Ok(Arc::new(memory::MemoryIndex::with_snapshot(root.join("index.json"))?))
            }
        }
    }
}
