//! File-system seam
//!
//! Every disk access the engine makes goes through [`FileSystem`], so raw
//! `std::io::Error`s never escape: they are wrapped into
//! [`CoverageError`] with a short description of what was being attempted.

use crate::result::{CoverageError, CoverageResult};
use std::fmt;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// File-system primitives used by persistence and instrumentation
pub trait FileSystem: fmt::Debug {
    /// Read a whole file; a missing file is `NotFound`
    fn read_to_string(&self, path: &Path) -> CoverageResult<String>;

    /// Read a whole file as raw bytes; a missing file is `NotFound`
    fn read(&self, path: &Path) -> CoverageResult<Vec<u8>>;

    /// Write `contents` to a new, uniquely named file inside `dir`
    fn write_temp(&self, dir: &Path, contents: &str) -> CoverageResult<PathBuf>;

    /// Create or truncate `path` with `contents`
    fn write(&self, path: &Path, contents: &str) -> CoverageResult<()>;

    /// Move `from` over `to`
    fn rename(&self, from: &Path, to: &Path) -> CoverageResult<()>;

    /// Delete a file
    fn remove_file(&self, path: &Path) -> CoverageResult<()>;

    /// Whether `path` exists
    fn exists(&self, path: &Path) -> bool;

    /// Create a directory and its parents
    fn create_dir_all(&self, path: &Path) -> CoverageResult<()>;

    /// Resolve symlinks
    fn canonicalize(&self, path: &Path) -> CoverageResult<PathBuf>;
}

/// [`FileSystem`] backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileSystem;

impl OsFileSystem {
    /// Create the OS file system handle
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn wrap(context: impl FnOnce() -> String, err: std::io::Error) -> CoverageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        CoverageError::not_found(context())
    } else {
        CoverageError::io(context(), err)
    }
}

impl FileSystem for OsFileSystem {
    fn read_to_string(&self, path: &Path) -> CoverageResult<String> {
        std::fs::read_to_string(path).map_err(|e| wrap(|| format!("reading {}", path.display()), e))
    }

    fn read(&self, path: &Path) -> CoverageResult<Vec<u8>> {
        std::fs::read(path).map_err(|e| wrap(|| format!("reading {}", path.display()), e))
    }

    fn write_temp(&self, dir: &Path, contents: &str) -> CoverageResult<PathBuf> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".linecov-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| CoverageError::io(format!("creating temp file in {}", dir.display()), e))?;

        tmp.write_all(contents.as_bytes())
            .map_err(|e| CoverageError::io(format!("writing temp file in {}", dir.display()), e))?;

        tmp.flush()
            .map_err(|e| CoverageError::io(format!("flushing temp file in {}", dir.display()), e))?;

        tmp.into_temp_path()
            .keep()
            .map_err(|e| CoverageError::io(format!("keeping temp file in {}", dir.display()), e.error))
    }

    fn write(&self, path: &Path, contents: &str) -> CoverageResult<()> {
        std::fs::write(path, contents)
            .map_err(|e| CoverageError::io(format!("writing {}", path.display()), e))
    }

    fn rename(&self, from: &Path, to: &Path) -> CoverageResult<()> {
        std::fs::rename(from, to).map_err(|e| {
            CoverageError::io(
                format!("renaming {} to {}", from.display(), to.display()),
                e,
            )
        })
    }

    fn remove_file(&self, path: &Path) -> CoverageResult<()> {
        std::fs::remove_file(path).map_err(|e| wrap(|| format!("removing {}", path.display()), e))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path) -> CoverageResult<()> {
        std::fs::create_dir_all(path)
            .map_err(|e| CoverageError::io(format!("creating directory {}", path.display()), e))
    }

    fn canonicalize(&self, path: &Path) -> CoverageResult<PathBuf> {
        std::fs::canonicalize(path)
            .map_err(|e| wrap(|| format!("resolving {}", path.display()), e))
    }
}

/// Lexically normalize a path: make it absolute and fold `.` and `..`
///
/// Does not touch the disk, so it works for paths that do not exist.
#[must_use]
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::result::ErrorKind;

    #[test]
    fn test_normalize_folds_dots() {
        assert_eq!(
            normalize_path(Path::new("/src/./lib/../a.lua")),
            PathBuf::from("/src/a.lua")
        );
    }

    #[test]
    fn test_normalize_makes_absolute() {
        let normalized = normalize_path(Path::new("a.lua"));
        assert!(normalized.is_absolute());
        assert!(normalized.ends_with("a.lua"));
    }

    #[test]
    fn test_normalize_does_not_escape_root() {
        assert_eq!(normalize_path(Path::new("/../../x")), PathBuf::from("/x"));
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = OsFileSystem
            .read_to_string(&dir.path().join("missing"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_write_temp_then_rename() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFileSystem::new();
        let tmp = fs.write_temp(dir.path(), "hello").unwrap();
        assert!(tmp.starts_with(dir.path()));
        let target = dir.path().join("target.txt");
        fs.rename(&tmp, &target).unwrap();
        assert!(!fs.exists(&tmp));
        assert_eq!(fs.read_to_string(&target).unwrap(), "hello");
    }

    #[test]
    fn test_write_temp_names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let a = OsFileSystem.write_temp(dir.path(), "a").unwrap();
        let b = OsFileSystem.write_temp(dir.path(), "b").unwrap();
        assert_ne!(a, b);
    }
}
