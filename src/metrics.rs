//! Per-stage counters for pipeline runs.
//!
//! Every stage gets a [`StageMetrics`] shared by its workers. The counters are
//! plain atomics; they are only read for progress reporting and for the
//! end-of-run summary, so relaxed ordering is enough.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for one stage.
#[derive(Debug, Default)]
pub struct StageMetrics {
    name: String,
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl StageMetrics {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StageSnapshot {
        StageSnapshot {
            stage: self.name.clone(),
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a stage's counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StageSnapshot {
    pub stage: String,
    /// Handler invocations begun.
    pub started: u64,
    /// Handler invocations that succeeded and were forwarded.
    pub completed: u64,
    /// Handler invocations that returned an error or panicked.
    pub failed: u64,
    /// Tasks discarded without running because the pipeline was stopping.
    pub dropped: u64,
}

/// Counters of every stage in a pipeline, in chain order.
#[derive(Clone, Debug, Default)]
pub struct PipelineMetrics {
    stages: Vec<Arc<StageMetrics>>,
}

impl PipelineMetrics {
    pub(crate) fn register(&mut self, name: &str) -> Arc<StageMetrics> {
        let m = Arc::new(StageMetrics::new(name));
        self.stages.push(Arc::clone(&m));
        m
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<StageSnapshot> {
        self.stages.iter().map(|s| s.snapshot()).collect()
    }
}

/// Render stage snapshots plus the run duration as JSON.
#[must_use]
pub fn to_json(stages: &[StageSnapshot], elapsed: Duration) -> Value {
    json!({
        "execution_time_ms": elapsed.as_millis() as u64,
        "stages": stages,
    })
}

/// Save stage snapshots to a JSON file.
///
/// # Errors
/// Returns an error if the file cannot be created or written.
pub fn save_to_file(stages: &[StageSnapshot], elapsed: Duration, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let formatted = serde_json::to_string_pretty(&to_json(stages, elapsed))?;
    let mut file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    file.write_all(formatted.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let mut pm = PipelineMetrics::default();
        let s = pm.register("transform");
        s.record_started();
        s.record_started();
        s.record_completed();
        s.record_failed();
        let snap = pm.snapshot();
        assert_eq!(
            snap,
            vec![StageSnapshot { stage: "transform".into(), started: 2, completed: 1, failed: 1, dropped: 0 }]
        );
        let v = to_json(&snap, Duration::from_millis(1500));
        assert_eq!(v["execution_time_ms"], 1500);
        assert_eq!(v["stages"][0]["failed"], 1);
    }
}
