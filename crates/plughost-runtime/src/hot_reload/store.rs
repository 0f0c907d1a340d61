//! On-disk module images
//!
//! The canonical module file is the one the build drops into the plugins
//! directory and the one the watcher observes. It is never loaded directly:
//! every load goes through a staged copy with a unique name, so a new build
//! can replace the canonical file while an older copy is still mapped.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::ReloadError;

static COPY_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Unique, ordered token embedded in a staged file name.
///
/// The wall-clock part keeps names readable across restarts; the sequence
/// part makes them unique within the process even when the clock does not
/// advance between two stagings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CopyToken {
    nanos: u128,
    seq: u64,
}

impl CopyToken {
    pub fn next() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self {
            nanos,
            seq: COPY_SEQUENCE.fetch_add(1, Ordering::SeqCst),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for CopyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.nanos, self.seq)
    }
}

/// What happens to staged copies once they are no longer needed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagedRetention {
    /// Keep every staged copy until someone deletes it. Disk usage grows by
    /// one module per reload for the lifetime of the process.
    #[default]
    KeepAll,
    /// Delete a staged copy once its generation has been unloaded, or
    /// immediately if loading it failed.
    DeleteOnRetire,
}

/// One staged build of the plugin.
#[derive(Debug, Clone)]
pub struct ModuleImage {
    canonical: PathBuf,
    staged: PathBuf,
    token: CopyToken,
    digest: String,
    size: u64,
}

impl ModuleImage {
    /// The watched file this image was copied from.
    pub fn canonical_path(&self) -> &Path {
        &self.canonical
    }

    /// The physical file that gets loaded.
    pub fn staged_path(&self) -> &Path {
        &self.staged
    }

    pub fn token(&self) -> CopyToken {
        self.token
    }

    /// Hex SHA-256 of the staged bytes.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// First 12 hex digits of the digest, for log lines.
    pub fn short_digest(&self) -> &str {
        &self.digest[..self.digest.len().min(12)]
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Produces staged copies of the canonical module and cleans them up
/// according to a [`StagedRetention`] policy.
#[derive(Debug, Clone, Default)]
pub struct ModuleStore {
    retention: StagedRetention,
}

impl ModuleStore {
    pub fn new(retention: StagedRetention) -> Self {
        Self { retention }
    }

    pub fn retention(&self) -> StagedRetention {
        self.retention
    }

    /// Staged file name for `canonical`: `<stem>_<token><.ext>` in the same directory.
    pub fn staged_path_for(canonical: &Path, token: CopyToken) -> PathBuf {
        let stem = canonical
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match canonical.extension() {
            Some(ext) => format!("{stem}_{token}.{}", ext.to_string_lossy()),
            None => format!("{stem}_{token}"),
        };
        canonical.with_file_name(name)
    }

    /// Whether `candidate` looks like a staged copy of `canonical`.
    pub fn is_staged_copy(canonical: &Path, candidate: &Path) -> bool {
        if candidate.parent() != canonical.parent() {
            return false;
        }
        let (Some(stem), Some(name)) = (
            canonical.file_stem().and_then(|s| s.to_str()),
            candidate.file_name().and_then(|s| s.to_str()),
        ) else {
            return false;
        };

        let suffix = canonical
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();

        let Some(token) = name
            .strip_prefix(stem)
            .and_then(|rest| rest.strip_prefix('_'))
            .and_then(|rest| rest.strip_suffix(suffix.as_str()))
        else {
            return false;
        };

        let mut parts = token.split('_');
        let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        matches!(
            (parts.next(), parts.next(), parts.next()),
            (Some(nanos), Some(seq), None) if all_digits(nanos) && all_digits(seq)
        )
    }

    /// Copy `canonical` to a fresh staged path.
    ///
    /// The destination is created exclusively, so an existing file is never
    /// overwritten.
    pub fn stage(&self, canonical: &Path) -> Result<ModuleImage, ReloadError> {
        let bytes = fs::read(canonical).map_err(|e| ReloadError::io(canonical, e))?;
        let token = CopyToken::next();
        let staged = Self::staged_path_for(canonical, token);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staged)
            .map_err(|e| ReloadError::Io {
                path: staged.clone(),
                source: e,
            })?;
        if let Err(e) = file.write_all(&bytes).and_then(|_| file.sync_all()) {
            drop(file);
            let _ = fs::remove_file(&staged);
            return Err(ReloadError::Io {
                path: staged,
                source: e,
            });
        }

        let digest = hex::encode(Sha256::digest(&bytes));
        let image = ModuleImage {
            canonical: canonical.to_path_buf(),
            staged,
            token,
            digest,
            size: bytes.len() as u64,
        };

        info!(
            "Staged module {:?} -> {:?} ({} bytes, sha256 {})",
            image.canonical,
            image.staged,
            image.size,
            image.short_digest()
        );
        Ok(image)
    }

    /// Called once a generation built from `image` has been unloaded, or
    /// when loading `image` failed.
    pub fn release(&self, image: &ModuleImage) {
        match self.retention {
            StagedRetention::KeepAll => {
                debug!("Keeping staged module {:?}", image.staged);
            }
            StagedRetention::DeleteOnRetire => match fs::remove_file(&image.staged) {
                Ok(()) => debug!("Removed staged module {:?}", image.staged),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove staged module {:?}: {}", image.staged, e),
            },
        }
    }

    /// Remove staged copies of `canonical` left behind by earlier runs.
    ///
    /// Must run before the first load of this process.
    pub fn purge_stale(&self, canonical: &Path) -> std::io::Result<usize> {
        let Some(dir) = canonical.parent() else {
            return Ok(0);
        };

        let mut removed = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && Self::is_staged_copy(canonical, &path) {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to purge stale staged module {:?}: {}", path, e),
                }
            }
        }

        if removed > 0 {
            info!("Purged {} stale staged module(s) from {:?}", removed, dir);
        }
        Ok(removed)
    }
}
