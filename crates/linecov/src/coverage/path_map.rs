//! Original <-> instrumented path registry
//!
//! Both directions are kept in sync: each original maps to at most one
//! instrumented copy and vice versa. Paths are stored normalized and, when the
//! file exists, symlink-resolved.

use super::fs::{normalize_path, FileSystem};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, warn};

/// Bidirectional path registry
#[derive(Debug)]
pub struct PathMapper {
    fs: Rc<dyn FileSystem>,
    to_temp: HashMap<PathBuf, PathBuf>,
    to_original: HashMap<PathBuf, PathBuf>,
}

impl PathMapper {
    /// Create an empty registry
    #[must_use]
    pub fn new(fs: Rc<dyn FileSystem>) -> Self {
        Self {
            fs,
            to_temp: HashMap::new(),
            to_original: HashMap::new(),
        }
    }

    /// Normalize and resolve symlinks, falling back to the normalized form
    #[must_use]
    pub fn canonical(&self, path: &Path) -> PathBuf {
        let normalized = normalize_path(path);
        match self.fs.canonicalize(&normalized) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(path = %normalized.display(), error = %err, "symlink resolution failed, using normalized path");
                normalized
            }
        }
    }

    /// Register an original/instrumented pair, replacing older pairs for either key
    pub fn register_path_pair(&mut self, original: &Path, instrumented: &Path) {
        let original = self.canonical(original);
        let instrumented = self.canonical(instrumented);

        if let Some(stale_temp) = self.to_temp.remove(&original) {
            self.to_original.remove(&stale_temp);
        }
        if let Some(stale_original) = self.to_original.remove(&instrumented) {
            self.to_temp.remove(&stale_original);
        }

        debug!(original = %original.display(), instrumented = %instrumented.display(), "registered path pair");
        self.to_temp.insert(original.clone(), instrumented.clone());
        self.to_original.insert(instrumented, original);
    }

    /// Original file for an instrumented copy
    #[must_use]
    pub fn get_original_path(&self, instrumented: &Path) -> Option<&Path> {
        Self::lookup(&self.to_original, self.fs.as_ref(), instrumented)
    }

    /// Instrumented copy for an original file
    #[must_use]
    pub fn get_temp_path(&self, original: &Path) -> Option<&Path> {
        Self::lookup(&self.to_temp, self.fs.as_ref(), original)
    }

    /// Whether `path` is a registered instrumented copy
    #[must_use]
    pub fn is_instrumented(&self, path: &Path) -> bool {
        self.get_original_path(path).is_some()
    }

    /// Number of registered pairs
    #[must_use]
    pub fn len(&self) -> usize {
        self.to_temp.len()
    }

    /// True when nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_temp.is_empty()
    }

    /// Iterate `(original, instrumented)` pairs
    pub fn pairs(&self) -> impl Iterator<Item = (&Path, &Path)> {
        self.to_temp
            .iter()
            .map(|(original, temp)| (original.as_path(), temp.as_path()))
    }

    /// Remove every mapping
    pub fn clear(&mut self) {
        self.to_temp.clear();
        self.to_original.clear();
    }

    // The normalized form is tried first so lookups of registered paths
    // never touch the disk.
    fn lookup<'a>(
        map: &'a HashMap<PathBuf, PathBuf>,
        fs: &dyn FileSystem,
        path: &Path,
    ) -> Option<&'a Path> {
        let normalized = normalize_path(path);
        if let Some(found) = map.get(&normalized) {
            return Some(found.as_path());
        }
        match fs.canonicalize(&normalized) {
            Ok(resolved) => map.get(&resolved).map(PathBuf::as_path),
            Err(err) => {
                warn!(path = %normalized.display(), error = %err, "symlink resolution failed during lookup");
                None
            }
        }
    }
}
