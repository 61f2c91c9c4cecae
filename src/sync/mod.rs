//! Bulk sync of Parquet tables into a document index.
//!
//! A [`SyncEngine`] runs a fixed pool of worker threads (`sync-0`, `sync-1`,
//! ...). Files are dealt to workers round-robin when the run starts; there is
//! no shared work queue. Each worker streams its files row batch by row batch,
//! converts rows to upsert actions through an [`ActionConverter`], groups them
//! into size-bounded chunks and submits every chunk through a [`BulkClient`]
//! with retries.
//!
//! Workers share exactly two things: one pair of success/failure counters
//! behind a mutex, and (in measurement mode) a channel of chunk sizes. Error
//! maps stay worker-local and come back through the join handle; the
//! coordinator merges them as workers finish.

pub mod action;
pub mod client;
pub mod errors;
pub mod retry;
pub mod stats;
mod worker;

pub use action::{ActionConverter, BulkAction, Chunk, ChunkBuilder};
pub use client::{BulkClient, BulkResponse, HttpBulkClient, ItemResult};
pub use errors::{ErrorMap, ErrorSample, ErrorSummary, FailureClass};
pub use retry::RetryPolicy;
pub use stats::{ChunkSizeStats, Counts, SharedCounters, SyncSummary};
pub use worker::{SyncMode, WorkerReport};

use crate::config::SyncConfig;
use crate::io::glob::discover_files;
use crate::io::parquet::count_rows;
use crate::pipeline::InterruptHandle;
use anyhow::Result;
use crossbeam_channel::{RecvTimeoutError, unbounded};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use worker::SyncWorker;

/// Split `files` into `workers` lists, file `i` going to worker `i % workers`.
#[must_use]
pub fn assign_round_robin(files: Vec<PathBuf>, workers: usize) -> Vec<Vec<PathBuf>> {
    let workers = workers.max(1);
    let mut out = vec![Vec::new(); workers];
    for (i, f) in files.into_iter().enumerate() {
        out[i % workers].push(f);
    }
    out
}

pub struct SyncEngine {
    config: SyncConfig,
    client: Arc<dyn BulkClient>,
    converter: Arc<dyn ActionConverter>,
    interrupt: InterruptHandle,
}

impl SyncEngine {
    #[must_use]
    pub fn new(config: SyncConfig, client: Arc<dyn BulkClient>, converter: Arc<dyn ActionConverter>) -> Self {
        Self { config, client, converter, interrupt: InterruptHandle::new() }
    }

    #[must_use]
    pub fn interrupt(mut self, handle: InterruptHandle) -> Self {
        self.interrupt = handle;
        self
    }

    /// Sync every `*.parquet` file under `in_dir`, recursively.
    ///
    /// # Errors
    /// See [`sync_files`](Self::sync_files).
    pub fn sync_dir(&self, index: &str, in_dir: &Path) -> Result<SyncSummary> {
        crate::config::validate_directory(in_dir, &[])?;
        let files = discover_files(in_dir, "**/*.parquet")?;
        self.sync_files(index, files)
    }

    /// Sync `files` into `index`.
    ///
    /// # Errors
    /// Invalid configuration or unreadable Parquet footers, both detected
    /// before any worker starts. Per-document failures are reported in the
    /// [`SyncSummary`].
    pub fn sync_files(&self, index: &str, files: Vec<PathBuf>) -> Result<SyncSummary> {
        self.config.validate()?;
        let start = Instant::now();
        let mode = SyncMode::from_config(&self.config);

        let mut total_records = 0u64;
        for f in &files {
            total_records += count_rows(f)?;
        }
        let workers = self.config.workers.min(files.len()).max(1);
        let merged_cap = self.config.max_error_samples * workers;
        info!(
            index,
            files = files.len(),
            records = total_records,
            workers,
            chunk_size = self.config.chunk_size,
            max_chunk_bytes = self.config.max_chunk_bytes,
            mode = ?mode,
            "starting bulk sync"
        );

        let counters = Arc::new(SharedCounters::new());
        let (sizes_tx, sizes_rx) = unbounded();
        let mut summary = SyncSummary {
            index: index.to_string(),
            files: files.len(),
            dry_run: mode == SyncMode::DryRun,
            ..SyncSummary::default()
        };
        let mut chunk_stats = ChunkSizeStats::default();

        let mut handles: Vec<(usize, JoinHandle<WorkerReport>)> = Vec::with_capacity(workers);
        for (worker_id, assigned) in assign_round_robin(files, workers).into_iter().enumerate() {
            if assigned.is_empty() {
                continue;
            }
            let w = SyncWorker {
                worker_id,
                files: assigned,
                index: index.to_string(),
                mode,
                chunk_size: self.config.chunk_size,
                read_rows: self.config.read_batch_rows,
                max_chunk_bytes: self.config.max_chunk_bytes,
                max_error_samples: self.config.max_error_samples,
                start_delay: if self.config.staggered_start {
                    self.config.stagger_delay() * u32::try_from(worker_id).unwrap_or(u32::MAX)
                } else {
                    Duration::ZERO
                },
                policy: RetryPolicy::from_config(&self.config),
                client: Arc::clone(&self.client),
                converter: Arc::clone(&self.converter),
                counters: Arc::clone(&counters),
                chunk_sizes: sizes_tx.clone(),
                interrupt: self.interrupt.clone(),
            };
            match thread::Builder::new().name(format!("sync-{worker_id}")).spawn(move || w.run()) {
                Ok(h) => handles.push((worker_id, h)),
                Err(e) => {
                    error!(worker = worker_id, error = %e, "failed to spawn sync worker");
                    summary.worker_errors.push(format!("sync-{worker_id}: spawn failed: {e}"));
                }
            }
        }
        drop(sizes_tx);

        let bar = self.progress_bar(total_records);
        while !handles.is_empty() {
            let (finished, running): (Vec<_>, Vec<_>) = handles.into_iter().partition(|(_, h)| h.is_finished());
            handles = running;
            for (worker_id, h) in finished {
                match h.join() {
                    Ok(report) => {
                        debug!(worker = worker_id, failures = report.errors.total(), "sync worker finished");
                        summary.errors.merge(report.errors, merged_cap);
                        summary.worker_errors.extend(report.file_errors);
                    }
                    Err(_) => {
                        error!(worker = worker_id, "sync worker panicked");
                        summary.worker_errors.push(format!("sync-{worker_id}: panicked"));
                    }
                }
            }

            let counts = counters.get();
            bar.set_position(counts.success + counts.failure);
            if mode == SyncMode::Measure && chunk_stats.chunks > 0 {
                bar.set_message(format!("avg chunk {:.2} MiB", chunk_stats.mean / (1024.0 * 1024.0)));
            }
            if handles.is_empty() {
                break;
            }
            // Waiting on chunk sizes doubles as the poll sleep.
            match sizes_rx.recv_timeout(self.config.poll_interval()) {
                Ok(bytes) => {
                    chunk_stats.observe(bytes);
                    sizes_rx.try_iter().for_each(|b| chunk_stats.observe(b));
                }
                Err(RecvTimeoutError::Timeout) => {}
                // Workers are exiting; their handles report finished momentarily.
                Err(RecvTimeoutError::Disconnected) => thread::sleep(Duration::from_millis(10)),
            }
        }
        sizes_rx.try_iter().for_each(|b| chunk_stats.observe(b));
        bar.finish_and_clear();

        let counts = counters.get();
        summary.success = counts.success;
        summary.failure = counts.failure;
        summary.elapsed = start.elapsed();
        summary.interrupted = self.interrupt.is_triggered();
        summary.chunk_sizes = (mode == SyncMode::Measure).then_some(chunk_stats);
        self.log_summary(&summary);
        Ok(summary)
    }

    fn log_summary(&self, s: &SyncSummary) {
        info!(
            index = %s.index,
            total = s.success + s.failure,
            success = s.success,
            failure = s.failure,
            docs_per_sec = s.docs_per_sec().round() as u64,
            elapsed_secs = s.elapsed.as_secs_f64(),
            "bulk sync complete"
        );
        if let Some(c) = s.chunk_sizes {
            info!(chunks = c.chunks, min_bytes = c.min, max_bytes = c.max, avg_bytes = c.mean.round() as u64, "chunk sizes");
        }
        if !s.errors.is_empty() {
            let errors = serde_json::to_string(&s.errors).unwrap_or_default();
            warn!(classes = s.errors.len(), failures = s.errors.total(), errors = %errors, "bulk sync errors");
        }
        if s.interrupted {
            warn!("bulk sync was interrupted");
        }
    }

    fn progress_bar(&self, total: u64) -> ProgressBar {
        if !self.config.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::stderr());
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} docs ({per_sec}, {eta})")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_spreads_files() {
        let files: Vec<PathBuf> = (0..5).map(|i| PathBuf::from(format!("f{i}"))).collect();
        let parts = assign_round_robin(files, 2);
        assert_eq!(parts[0], vec![PathBuf::from("f0"), PathBuf::from("f2"), PathBuf::from("f4")]);
        assert_eq!(parts[1], vec![PathBuf::from("f1"), PathBuf::from("f3")]);
    }
}
