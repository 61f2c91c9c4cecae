//! One sync worker: stream its files, chunk the actions, submit.

use crate::config::SyncConfig;
use crate::io::parquet::stream_rows;
use crate::pipeline::InterruptHandle;
use crate::sync::action::{ActionConverter, Chunk, ChunkBuilder};
use crate::sync::client::BulkClient;
use crate::sync::errors::{ErrorMap, ErrorSample, FailureClass};
use crate::sync::retry::{RetryPolicy, sleep_unless_interrupted, submit_chunk};
use crate::sync::stats::SharedCounters;
use crossbeam_channel::Sender;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What each worker does with a finished chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    Index,
    /// Count every action as a success without sending anything.
    DryRun,
    /// Report serialized chunk sizes without sending anything.
    Measure,
}

impl SyncMode {
    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        if config.dry_run {
            Self::DryRun
        } else if config.measure_chunk_size {
            Self::Measure
        } else {
            Self::Index
        }
    }
}

/// Everything a worker returns to the coordinator over its join handle.
#[derive(Debug, Default)]
pub struct WorkerReport {
    pub errors: ErrorMap,
    /// Files that could not be read to the end.
    pub file_errors: Vec<String>,
}

pub(crate) struct SyncWorker {
    pub worker_id: usize,
    pub files: Vec<PathBuf>,
    pub index: String,
    pub mode: SyncMode,
    pub chunk_size: usize,
    /// Parquet rows decoded per read.
    pub read_rows: usize,
    pub max_chunk_bytes: usize,
    pub max_error_samples: usize,
    pub start_delay: std::time::Duration,
    pub policy: RetryPolicy,
    pub client: Arc<dyn BulkClient>,
    pub converter: Arc<dyn ActionConverter>,
    pub counters: Arc<SharedCounters>,
    pub chunk_sizes: Sender<u64>,
    pub interrupt: InterruptHandle,
}

impl SyncWorker {
    pub(crate) fn run(self) -> WorkerReport {
        let mut report = WorkerReport::default();
        if !self.start_delay.is_zero() {
            debug!(worker = self.worker_id, delay_secs = self.start_delay.as_secs(), "staggered start");
            if !sleep_unless_interrupted(self.start_delay, &self.interrupt) {
                return report;
            }
        }

        let columns = self.converter.columns();
        for file in &self.files {
            if self.interrupt.is_triggered() {
                info!(worker = self.worker_id, "interrupted, skipping remaining files");
                break;
            }
            debug!(worker = self.worker_id, file = %file.display(), mode = ?self.mode, "syncing file");
            if let Err(e) = self.sync_file(file, columns.as_deref(), &mut report.errors) {
                error!(worker = self.worker_id, file = %file.display(), error = %format!("{e:#}"), "file sync failed");
                report.file_errors.push(format!("{}: {e:#}", file.display()));
            }
        }
        report
    }

    fn sync_file(&self, file: &Path, columns: Option<&[String]>, errors: &mut ErrorMap) -> anyhow::Result<()> {
        let mut builder = ChunkBuilder::new(self.chunk_size, self.max_chunk_bytes);
        let mut read_error = None;
        for (row_no, row) in stream_rows(file, columns, self.read_rows)?.enumerate() {
            if self.interrupt.is_triggered() {
                break;
            }
            let row = match row {
                Ok(r) => r,
                Err(e) => {
                    read_error = Some(e);
                    break;
                }
            };
            let action = match self.converter.to_action(&self.index, row) {
                Ok(a) => a,
                Err(e) => {
                    self.conversion_failure(file, row_no, &e.to_string(), errors);
                    continue;
                }
            };
            let id = action.id.clone();
            match builder.push(action) {
                Ok(Some(chunk)) => self.dispatch(chunk, errors),
                Ok(None) => {}
                Err(e) => self.conversion_failure(file, row_no, &format!("{id}: {e}"), errors),
            }
        }
        // Rows converted before a read error are still submitted and counted.
        if let Some(chunk) = builder.finish() {
            self.dispatch(chunk, errors);
        }
        read_error.map_or(Ok(()), Err)
    }

    fn conversion_failure(&self, file: &Path, row_no: usize, detail: &str, errors: &mut ErrorMap) {
        warn!(worker = self.worker_id, file = %file.display(), row = row_no, error = detail, "row conversion failed");
        self.counters.add(0, 1);
        errors.record(
            FailureClass::Conversion,
            ErrorSample { doc_id: format!("{}#{row_no}", file.display()), detail: json!(detail) },
            self.max_error_samples,
        );
    }

    fn dispatch(&self, chunk: Chunk, errors: &mut ErrorMap) {
        match self.mode {
            SyncMode::DryRun => self.counters.add(chunk.len() as u64, 0),
            SyncMode::Measure => {
                if self.chunk_sizes.send(chunk.byte_len() as u64).is_err() {
                    debug!(worker = self.worker_id, bytes = chunk.byte_len(), "chunk size dropped, coordinator gone");
                }
                self.counters.add(chunk.len() as u64, 0);
            }
            SyncMode::Index => {
                let outcome = submit_chunk(self.client.as_ref(), chunk, &self.policy, &self.interrupt);
                self.counters.add(outcome.acknowledged, outcome.failures.len() as u64);
                for f in outcome.failures {
                    errors.record(f.class, f.sample, self.max_error_samples);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::FieldIdConverter;
    use crate::testing::{InMemoryIndex, write_numbered_parquet};
    use std::time::Duration;

    #[test]
    fn measuring_survives_a_departed_coordinator() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = write_numbered_parquet(dir.path(), "works", 0, 7)?;
        let (sizes_tx, sizes_rx) = crossbeam_channel::unbounded();
        drop(sizes_rx);
        let counters = Arc::new(SharedCounters::new());
        let index = Arc::new(InMemoryIndex::new());

        let worker = SyncWorker {
            worker_id: 0,
            files: vec![file],
            index: "works".into(),
            mode: SyncMode::Measure,
            chunk_size: 3,
            read_rows: 3,
            max_chunk_bytes: usize::MAX,
            max_error_samples: 2,
            start_delay: Duration::ZERO,
            policy: RetryPolicy::from_config(&SyncConfig::default()),
            client: Arc::clone(&index) as _,
            converter: Arc::new(FieldIdConverter::new("id")),
            counters: Arc::clone(&counters),
            chunk_sizes: sizes_tx,
            interrupt: InterruptHandle::new(),
        };
        let report = worker.run();

        assert!(report.file_errors.is_empty());
        assert_eq!(counters.get().success, 7);
        assert_eq!(index.request_count(), 0);
        Ok(())
    }
}
