//! Shared counters and the end-of-sync summary.

use crate::sync::errors::ErrorMap;
use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Success and failure totals shared by every sync worker, behind one lock.
#[derive(Debug, Default)]
pub struct SharedCounters {
    inner: Mutex<Counts>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub success: u64,
    pub failure: u64,
}

impl SharedCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, success: u64, failure: u64) {
        let mut c = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        c.success += success;
        c.failure += failure;
    }

    #[must_use]
    pub fn get(&self) -> Counts {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Min / mean / max serialized chunk size, in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ChunkSizeStats {
    pub chunks: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    #[serde(skip)]
    total: u128,
}

impl ChunkSizeStats {
    pub fn observe(&mut self, bytes: u64) {
        if self.chunks == 0 {
            self.min = bytes;
            self.max = bytes;
        } else {
            self.min = self.min.min(bytes);
            self.max = self.max.max(bytes);
        }
        self.chunks += 1;
        self.total += u128::from(bytes);
        self.mean = self.total as f64 / self.chunks as f64;
    }
}

/// Final report of a sync run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SyncSummary {
    pub index: String,
    pub files: usize,
    pub success: u64,
    pub failure: u64,
    #[serde(serialize_with = "as_secs_f64")]
    pub elapsed: Duration,
    pub chunk_sizes: Option<ChunkSizeStats>,
    pub errors: ErrorMap,
    pub interrupted: bool,
    pub dry_run: bool,
    /// Workers that ended with an error instead of an error map.
    pub worker_errors: Vec<String>,
}

fn as_secs_f64<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl SyncSummary {
    #[must_use]
    pub fn docs_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { (self.success + self.failure) as f64 / secs } else { 0.0 }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failure == 0 && !self.interrupted && self.worker_errors.is_empty()
    }
}

const MIB: f64 = 1024.0 * 1024.0;

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Bulk sync summary for index '{}'", self.index)?;
        writeln!(f, "  files:       {}", self.files)?;
        writeln!(f, "  success:     {}", self.success)?;
        writeln!(f, "  failure:     {}", self.failure)?;
        writeln!(f, "  duration:    {:.1}s", self.elapsed.as_secs_f64())?;
        writeln!(f, "  throughput:  {:.1} docs/s", self.docs_per_sec())?;
        if self.dry_run {
            writeln!(f, "  (dry run, nothing was sent)")?;
        }
        if self.interrupted {
            writeln!(f, "  (interrupted)")?;
        }
        if let Some(s) = self.chunk_sizes {
            writeln!(
                f,
                "  chunk size:  min {:.2} MiB, avg {:.2} MiB, max {:.2} MiB over {} chunks",
                s.min as f64 / MIB,
                s.mean / MIB,
                s.max as f64 / MIB,
                s.chunks
            )?;
        }
        for e in &self.worker_errors {
            writeln!(f, "  worker error: {e}")?;
        }
        if !self.errors.is_empty() {
            let json = serde_json::to_string_pretty(&self.errors).map_err(|_| fmt::Error)?;
            writeln!(f, "  errors:\n{json}")?;
        }
        Ok(())
    }
}
