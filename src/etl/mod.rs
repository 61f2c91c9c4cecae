//! The extract → transform → cleanup pipeline for snapshot files.
//!
//! [`run_etl`] is the whole run: validate the configuration, discover input
//! files, partition them into batches and push the batches through three
//! stages:
//!
//! | stage     | input             | output            |
//! |-----------|-------------------|-------------------|
//! | extract   | raw file paths    | extracted paths   |
//! | transform | extracted paths   | extracted paths   |
//! | cleanup   | extracted paths   | files removed     |
//!
//! Each stage has its own worker count and input queue capacity, so a slow
//! transform holds back extraction instead of filling the disk with
//! decompressed files.

mod cleanup;
mod extract;
mod transform;

pub use cleanup::{CleanupStage, remove_if_exists};
pub use extract::ExtractStage;
pub use transform::{BatchTransform, OutputTable, TransformStage};

use crate::batch::to_batches;
use crate::config::EtlConfig;
use crate::io::glob::discover_files;
use crate::pipeline::{InterruptHandle, PipelineBuilder, RunSummary};
use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Run the full pipeline described by `config` with `transform`.
///
/// # Errors
/// Pre-flight failures (a [`ConfigError`](crate::error::ConfigError) in the
/// chain, an unreadable input directory) and failure to start workers. Batch
/// failures are reported in the returned [`RunSummary`].
pub fn run_etl(config: &EtlConfig, transform: Arc<dyn BatchTransform>, interrupt: InterruptHandle) -> Result<RunSummary> {
    config.validate()?;

    let files = discover_files(&config.in_dir, &config.file_glob)?;
    // Tables and intermediates from an earlier run must not mix with this one.
    for dir in [config.out_dir.join("parquets"), config.out_dir.join("extract")] {
        reset_dir(&dir)?;
    }

    let batches = to_batches(files, config.batch_size, config.max_batches);
    let file_count: usize = batches.iter().map(|b| b.len()).sum();
    info!(
        in_dir = %config.in_dir.display(),
        out_dir = %config.out_dir.display(),
        transform = transform.name(),
        files = file_count,
        batches = batches.len(),
        batch_size = config.batch_size,
        extract_workers = config.extract.workers,
        transform_workers = config.transform.workers,
        cleanup_workers = config.cleanup.workers,
        extract_parallelism = config.extract_parallelism,
        policy = ?config.error_policy,
        "starting ETL run"
    );

    let pipeline = PipelineBuilder::<Vec<PathBuf>, Vec<PathBuf>>::new(config.extract.queue_capacity)
        .stage(
            ExtractStage::new(&config.in_dir, &config.out_dir, config.extract_parallelism),
            config.extract.workers,
            config.transform.queue_capacity,
        )
        .stage(
            TransformStage::new(transform, &config.out_dir, config.low_memory),
            config.transform.workers,
            config.cleanup.queue_capacity,
        )
        .stage(CleanupStage, config.cleanup.workers, 0)
        .error_policy(config.error_policy)
        .poll_interval(config.poll_interval())
        .interrupt(interrupt)
        .progress(config.progress)
        .build()?;

    pipeline.run(batches.into_iter().map(|b| b.into_task()).collect())
}

/// Empty `dir`, creating it if needed.
fn reset_dir(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => info!(dir = %dir.display(), "removed output of a previous run"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("rm -r {}", dir.display())),
    }
    fs::create_dir_all(dir).with_context(|| format!("mkdir -p {}", dir.display()))
}
