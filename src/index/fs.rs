//!
//! Filesystem index store
//! ----------------------
//! Persists the dependency graph as one small file per package, fanned out
//! under single-character bucket directories:
//!
//! ```text
//! <root>/forward/<c>/<package>   body: comma-separated dependency set
//! <root>/reverse/<c>/<package>   body: comma-separated dependent set
//! ```
//!
//! `<c>` is the first byte of the package name. The forward file may be empty
//! (a package with no dependencies); the reverse file exists iff the set is
//! non-empty, so a bare existence check answers "does anything depend on
//! this". Buckets `a`-`z` are precreated at startup; other buckets are
//! created on demand at write time.
//!
//! The index directory is not necessarily private to this process, so the
//! layout stays readable by other tooling. Mutating operations hold one
//! process-wide mutex from the first existence check to the last write;
//! queries are lock-free existence checks. File rewrites go through a tmp
//! file and `fs::rename` so a reverse set is never observable half-written.
//! The on-disk state is still updated file-by-file, not transactionally: a
//! process crash between steps can leave forward/reverse out of step on disk.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, error};

use super::PackageIndex;
use crate::error::IndexError;

/// Names become single path components under the bucket directories, so
/// anything that would traverse or hide (path separators, leading dot) is
/// unusable in this store.
fn is_safe_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.starts_with('.')
}

/// Package index persisted as per-package files under a root directory.
pub struct FilesystemIndex {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FilesystemIndex {
    /// Open (or initialize) an index rooted at `root`.
    ///
    /// Creates the root and the `forward`/`reverse` trees with `a`-`z`
    /// buckets. The directory may already hold an index written by a
    /// previous run or by another indexing server sharing the location.
    pub fn open(root: &Path) -> Result<Self> {
        let root = root.to_path_buf();
        let prepare = |path: &Path| -> std::result::Result<(), IndexError> {
            fs::create_dir_all(path)
                .map_err(|e| IndexError::Root { path: path.to_path_buf(), source: e })
        };
        for side in ["forward", "reverse"] {
            let side_dir = root.join(side);
            prepare(&side_dir)?;
            for c in b'a'..=b'z' {
                prepare(&side_dir.join((c as char).to_string()))?;
            }
        }
        Ok(Self { root, lock: Mutex::new(()) })
    }

    fn bucket(name: &str) -> String {
        name.chars().next().map(|c| c.to_string()).unwrap_or_default()
    }

    /// Path of the forward index file for `package` (the file name is the
    /// package, the body is the comma-separated set of its dependencies).
    fn forward_path(&self, package: &str) -> PathBuf {
        self.root.join("forward").join(Self::bucket(package)).join(package)
    }

    /// Path of the reverse index file for `package` (body is the
    /// comma-separated set of packages depending on it).
    fn reverse_path(&self, package: &str) -> PathBuf {
        self.root.join("reverse").join(Self::bucket(package)).join(package)
    }

    fn read_set(path: &Path) -> io::Result<BTreeSet<String>> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e),
        };
        Ok(content.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
    }

    /// Truncate-write `set` at `path` through a tmp sibling plus rename, so
    /// concurrent readers of a shared index never see a half-written file.
    fn write_set(path: &Path, set: &BTreeSet<String>) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = set.iter().cloned().collect::<Vec<_>>().join(",");
        // Dot-led tmp name cannot collide with a package file: dot-leading
        // names are refused as packages.
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("set");
        let tmp = path.with_file_name(format!(".{file_name}.tmp"));
        fs::write(&tmp, body)?;
        fs::rename(&tmp, path)
    }

    /// Write the forward file for `package` and add it to each dependency's
    /// reverse file. Called with the store mutex held, after all existence
    /// checks have passed.
    fn link(&self, package: &str, deps: &BTreeSet<String>) -> io::Result<()> {
        Self::write_set(&self.forward_path(package), deps)?;
        for dep in deps {
            let rpath = self.reverse_path(dep);
            let mut dependents = Self::read_set(&rpath)?;
            dependents.insert(package.to_string());
            Self::write_set(&rpath, &dependents)?;
        }
        Ok(())
    }

    /// Drop `package` from each dependency's reverse file (deleting a file
    /// whose set becomes empty), then delete the forward file.
    fn unlink(&self, package: &str) -> io::Result<()> {
        let fpath = self.forward_path(package);
        for dep in Self::read_set(&fpath)? {
            let rpath = self.reverse_path(&dep);
            let mut dependents = Self::read_set(&rpath)?;
            dependents.remove(package);
            if dependents.is_empty() {
                match fs::remove_file(&rpath) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            } else {
                Self::write_set(&rpath, &dependents)?;
            }
        }
        fs::remove_file(&fpath)
    }
}

impl PackageIndex for FilesystemIndex {
    fn index(&self, package: &str, deps: &[String]) -> Result<bool> {
        if !is_safe_name(package) || deps.iter().any(|d| !is_safe_name(d)) {
            debug!(target: "deplex::index", "refusing unsafe name in INDEX '{}'", package);
            return Ok(false);
        }

        let _guard = self.lock.lock();

        if self.forward_path(package).exists() {
            return Ok(true);
        }
        if deps.iter().any(|d| !self.forward_path(d).exists()) {
            return Ok(false);
        }

        let dep_set: BTreeSet<String> = deps.iter().cloned().collect();
        match self.link(package, &dep_set) {
            Ok(()) => {
                debug!(target: "deplex::index", "indexed '{}' with {} dep(s)", package, dep_set.len());
                Ok(true)
            }
            Err(e) => {
                error!(target: "deplex::index", "index '{}' failed on disk: {}", package, e);
                Ok(false)
            }
        }
    }

    fn remove(&self, package: &str) -> Result<bool> {
        if !is_safe_name(package) {
            // An unsafe name can never have been indexed, so removal is a no-op.
            return Ok(true);
        }

        let _guard = self.lock.lock();

        if !self.forward_path(package).exists() {
            return Ok(true);
        }
        if self.reverse_path(package).exists() {
            return Ok(false);
        }

        match self.unlink(package) {
            Ok(()) => {
                debug!(target: "deplex::index", "removed '{}'", package);
                Ok(true)
            }
            Err(e) => {
                error!(target: "deplex::index", "remove '{}' failed on disk: {}", package, e);
                Ok(false)
            }
        }
    }

    fn query(&self, package: &str) -> Result<bool> {
        if !is_safe_name(package) {
            return Ok(false);
        }
        Ok(self.forward_path(package).exists())
    }
}
