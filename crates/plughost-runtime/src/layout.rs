//! On-disk layout discovery
//!
//! The project root is the nearest ancestor containing the plugins
//! directory. The canonical module lives directly inside that directory.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::HostError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    root: PathBuf,
    plugins_dir: PathBuf,
    canonical: PathBuf,
}

impl HostLayout {
    /// Use `root` as the project root; `root/<dir_name>` must exist.
    pub fn new(root: impl Into<PathBuf>, dir_name: &str, file_name: &str) -> Result<Self, HostError> {
        let root = root.into();
        let plugins_dir = root.join(dir_name);
        if !plugins_dir.is_dir() {
            return Err(HostError::LayoutNotFound {
                searched_from: root,
                dir_name: dir_name.to_string(),
            });
        }
        let canonical = plugins_dir.join(file_name);
        Ok(Self {
            root,
            plugins_dir,
            canonical,
        })
    }

    /// Walk up from `start` to the first directory containing `dir_name`.
    pub fn discover(start: &Path, dir_name: &str, file_name: &str) -> Result<Self, HostError> {
        let root = Self::find_root(start, dir_name).ok_or_else(|| HostError::LayoutNotFound {
            searched_from: start.to_path_buf(),
            dir_name: dir_name.to_string(),
        })?;
        Self::new(root, dir_name, file_name)
    }

    /// Nearest ancestor of `start` (inclusive) that contains `dir_name`.
    pub fn find_root(start: &Path, dir_name: &str) -> Option<PathBuf> {
        start
            .ancestors()
            .inspect(|candidate| debug!("Looking for {:?} in {:?}", dir_name, candidate))
            .find(|candidate| candidate.join(dir_name).is_dir())
            .map(Path::to_path_buf)
    }

    /// [`find_root`](Self::find_root) from the executable's directory, then
    /// from the working directory.
    pub fn find_root_from_env(dir_name: &str) -> Result<PathBuf, HostError> {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        if let Some(root) = exe_dir
            .as_deref()
            .and_then(|dir| Self::find_root(dir, dir_name))
        {
            return Ok(root);
        }

        let cwd = std::env::current_dir()?;
        Self::find_root(&cwd, dir_name).ok_or(HostError::LayoutNotFound {
            searched_from: cwd,
            dir_name: dir_name.to_string(),
        })
    }

    pub fn discover_from_env(dir_name: &str, file_name: &str) -> Result<Self, HostError> {
        Self::new(Self::find_root_from_env(dir_name)?, dir_name, file_name)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    /// The watched module file. It may not exist yet.
    pub fn canonical_path(&self) -> &Path {
        &self.canonical
    }

    pub fn canonical_file_name(&self) -> &str {
        self.canonical
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}
