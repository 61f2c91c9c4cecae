//! Cleanup: delete the extracted intermediates of a finished batch.

use crate::stage::Stage;
use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct CleanupStage;

impl Stage for CleanupStage {
    type Input = Vec<PathBuf>;
    /// Number of files actually removed.
    type Output = usize;
    type Worker = ();

    fn name(&self) -> &str {
        "cleanup"
    }

    fn open(&self, _worker_id: usize) -> Result<()> {
        Ok(())
    }

    fn handle(&self, _: &mut (), batch_index: usize, files: Vec<PathBuf>) -> Result<usize> {
        let mut removed = 0;
        for file in &files {
            if remove_if_exists(file)? {
                removed += 1;
            }
        }
        debug!(batch = batch_index, removed, "cleaned up");
        Ok(removed)
    }
}

/// Delete `path`; an already-missing file is not an error.
///
/// # Errors
/// Any failure other than `NotFound`.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

/// Best-effort removal of a failed batch's intermediates.
pub(crate) fn remove_all(files: &[PathBuf]) {
    let mut removed = 0;
    for file in files {
        match remove_if_exists(file) {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => warn!(file = %file.display(), error = %format!("{e:#}"), "could not remove intermediate"),
        }
    }
    debug!(removed, "removed intermediates of failed batch");
}
