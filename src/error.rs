//! Unified error model for the index store layer.
//! Semantic refusals (missing dependency, extant dependents, absent package) are
//! not errors; they travel as `Ok(false)` through the store API and become
//! `FAIL` on the wire. This enum covers the genuine faults: a corrupt snapshot
//! found at startup, an unusable index root, and snapshot I/O failures.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    /// The persisted snapshot exists but cannot be interpreted. Startup must
    /// abort rather than silently begin from an empty graph.
    #[error("corrupt index snapshot at {}: {reason}", .path.display())]
    CorruptSnapshot { path: PathBuf, reason: String },

    /// The index root directory could not be created or prepared.
    #[error("cannot prepare index root {}: {source}", .path.display())]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading the snapshot at startup, or rewriting it after a successful
    /// mutation, failed. On the rewrite path the in-memory graph is already
    /// updated; the caller treats this as fatal.
    #[error("snapshot i/o failure at {}: {source}", .path.display())]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unrecognized store variant name from configuration.
    #[error("unknown store variant '{0}' (expected 'filesystem' or 'memory')")]
    UnknownKind(String),
}
