//! Detection of blobs above the repository's file size limit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::git::{GitReader, ObjectInfo, ObjectKind, ReadParams};
use crate::Error;

/// Hides the `info/alternates` file of an object directory for as long as it lives.
///
/// Git follows alternates even with `GIT_ALTERNATE_OBJECT_DIRECTORIES` unset, so a listing of a
/// quarantine directory would include the whole repository unless the file is out of the way.
/// The file is put back on drop, including during unwinding.
#[derive(Debug)]
pub struct AlternatesExclusion {
    original: PathBuf,
    parked: PathBuf,
    active: bool,
}

impl AlternatesExclusion {
    /// Move `<object_dir>/info/alternates` aside, returning `None` if there is no such file.
    pub fn engage(object_dir: &Path) -> Result<Option<Self>, Error> {
        let original = object_dir.join("info").join("alternates");
        let parked = object_dir
            .join("info")
            .join(format!("alternates.excluded-{}", uuid::Uuid::new_v4().simple()));
        match std::fs::rename(&original, &parked) {
            Ok(()) => Ok(Some(AlternatesExclusion {
                original,
                parked,
                active: true,
            })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Put the file back, reporting failure instead of only logging it.
    pub fn restore(mut self) -> Result<(), Error> {
        self.active = false;
        std::fs::rename(&self.parked, &self.original)?;
        Ok(())
    }
}

impl Drop for AlternatesExclusion {
    fn drop(&mut self) {
        if self.active {
            if let Err(err) = std::fs::rename(&self.parked, &self.original) {
                tracing::error!(path = %self.original.display(), error = %err, "failed to restore alternates");
            }
        }
    }
}

/// Lists the blobs a push adds that exceed a size limit.
#[derive(Clone)]
pub struct OversizeGuard {
    git: Arc<dyn GitReader>,
}

impl OversizeGuard {
    pub fn new(git: Arc<dyn GitReader>) -> Self {
        OversizeGuard { git }
    }

    /// Blobs stored in the quarantine directories that are larger than `limit` bytes.
    ///
    /// A `limit` of zero or less disables the check.
    pub async fn find(&self, params: &ReadParams, quarantine_dirs: &[PathBuf], limit: i64) -> Result<Vec<ObjectInfo>, Error> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let mut oversize = Vec::new();
        for dir in quarantine_dirs {
            let exclusion = AlternatesExclusion::engage(dir)?;
            let listed = self.git.list_objects(params, dir).await;
            if let Some(exclusion) = exclusion {
                exclusion.restore()?;
            }
            oversize.extend(
                listed?
                    .into_iter()
                    .filter(|o| o.kind == ObjectKind::Blob && o.size > limit as u64),
            );
        }
        Ok(oversize)
    }
}

impl std::fmt::Debug for OversizeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OversizeGuard").finish_non_exhaustive()
    }
}
