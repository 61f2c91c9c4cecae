//! Extraction: decompress the raw files of a batch.
//!
//! Every extraction worker owns its own rayon pool sized by
//! `extract_parallelism`, independent of how many extraction workers run.
//! All files of a batch are decompressed concurrently on that pool and the
//! worker forwards the batch only once every file is on disk.

use crate::etl::cleanup::remove_all;
use crate::io::compression::{decompress_file, strip_codec_extension};
use crate::stage::Stage;
use anyhow::{Context, Result};
use rayon::ThreadPool;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct ExtractStage {
    in_dir: PathBuf,
    extract_dir: PathBuf,
    parallelism: usize,
}

impl ExtractStage {
    /// Files under `in_dir` are extracted to `out_dir/extract/<relative path>`.
    #[must_use]
    pub fn new(in_dir: impl Into<PathBuf>, out_dir: impl AsRef<Path>, parallelism: usize) -> Self {
        Self { in_dir: in_dir.into(), extract_dir: out_dir.as_ref().join("extract"), parallelism: parallelism.max(1) }
    }

    /// Where `src` lands once decompressed.
    #[must_use]
    pub fn target_path(&self, src: &Path) -> PathBuf {
        let rel = src.strip_prefix(&self.in_dir).map_or_else(
            |_| src.file_name().map_or_else(|| src.to_path_buf(), PathBuf::from),
            Path::to_path_buf,
        );
        self.extract_dir.join(strip_codec_extension(&rel))
    }
}

impl Stage for ExtractStage {
    type Input = Vec<PathBuf>;
    type Output = Vec<PathBuf>;
    type Worker = ThreadPool;

    fn name(&self) -> &str {
        "extract"
    }

    fn open(&self, worker_id: usize) -> Result<ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallelism)
            .thread_name(move |i| format!("extract-{worker_id}-pool-{i}"))
            .build()
            .context("build extraction thread pool")
    }

    fn handle(&self, pool: &mut ThreadPool, batch_index: usize, files: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
        let extracted = pool.install(|| {
            files
                .par_iter()
                .map(|src| {
                    let dst = self.target_path(src);
                    let bytes = decompress_file(src, &dst)?;
                    debug!(batch = batch_index, file = %src.display(), bytes, "extracted");
                    Ok(dst)
                })
                .collect::<Result<Vec<_>>>()
        });
        if extracted.is_err() {
            // Siblings of the failed file may already be on disk.
            remove_all(&files.iter().map(|src| self.target_path(src)).collect::<Vec<_>>());
        }
        extracted.with_context(|| format!("extract batch {batch_index}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_keeps_relative_layout() {
        let stage = ExtractStage::new("/in", "/out", 2);
        assert_eq!(
            stage.target_path(Path::new("/in/works/2024/part_01.jsonl.gz")),
            PathBuf::from("/out/extract/works/2024/part_01.jsonl")
        );
        assert_eq!(stage.target_path(Path::new("/elsewhere/x.jsonl.gz")), PathBuf::from("/out/extract/x.jsonl"));
    }
}
