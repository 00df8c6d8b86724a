//! Filesystem path helpers (XDG-aware) for LMDB, the event spool, and local objects.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("unable to determine project directories")]
    MissingProjectDirs,
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Container providing filesystem paths for the application. In production this is
/// rooted at `$XDG_DATA_HOME/docflow`; tests may construct custom instances.
#[derive(Debug, Clone)]
pub struct AppPaths {
    base_dir: PathBuf,
}

impl AppPaths {
    /// Construct paths rooted under `$XDG_DATA_HOME/docflow`.
    pub fn from_project_dirs() -> Result<Self, PathError> {
        let dirs = project_dirs().ok_or(PathError::MissingProjectDirs)?;
        Self::new(dirs.data_dir())
    }

    /// Construct paths rooted under the provided directory, ensuring it exists.
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self, PathError> {
        let base = base.as_ref().to_path_buf();
        ensure_dir(&base)?;
        Ok(Self { base_dir: base })
    }

    /// LMDB environment directory holding records and checkpoints (`.../lmdb`).
    pub fn lmdb_env_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["lmdb"])
    }

    /// Event spool directory (`.../spool`).
    pub fn spool_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["spool"])
    }

    /// Root of the filesystem object store (`.../objects`).
    pub fn objects_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["objects"])
    }

    fn ensure_child(&self, segments: &[&str]) -> Result<PathBuf, PathError> {
        let mut path = self.base_dir.clone();
        for segment in segments {
            path.push(segment);
        }
        ensure_dir(&path)
    }
}

pub(crate) fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "docflow", "docflow")
}

/// Create `path` (and parents) unless it already exists.
pub fn ensure_dir(path: &Path) -> Result<PathBuf, PathError> {
    if let Err(err) = fs::create_dir_all(path) {
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(PathError::CreateDir {
                path: path.to_path_buf(),
                source: err,
            });
        }
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn child_directories_are_created_under_base() {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path().join("root")).expect("app paths");

        let lmdb = paths.lmdb_env_dir().expect("lmdb dir");
        let spool = paths.spool_dir().expect("spool dir");
        let objects = paths.objects_dir().expect("objects dir");

        assert!(lmdb.is_dir());
        assert!(spool.is_dir());
        assert!(objects.is_dir());
        assert!(lmdb.starts_with(temp.path().join("root")));
    }
}
