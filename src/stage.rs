//! Stage handlers and the worker loop that drives them.
//!
//! A pipeline stage is a value implementing [`Stage`]. The pipeline runs N
//! workers per stage; each worker:
//!
//! 1. opens its worker-local state ([`Stage::open`]),
//! 2. repeatedly dequeues with a timeout, so it notices a stopping pipeline
//!    even when its queue is idle,
//! 3. calls [`Stage::handle`] for every task and forwards the result,
//! 4. on its [`Message::Shutdown`] closes its state ([`Stage::close`]) and exits.
//!
//! Workers never re-send the stop signal. The orchestrator delivers exactly one
//! per worker.
//!
//! Handler errors and panics are contained at the worker boundary: the failure
//! is logged with the batch index and reported to the orchestrator, then the
//! [`ErrorPolicy`] decides whether only this batch is lost or the whole run is
//! aborted. A worker never retries a batch.

use crate::config::ErrorPolicy;
use crate::metrics::StageMetrics;
use crate::queue::{Message, Queue, Recv, SendFailure, Task};
use anyhow::{Result, anyhow};
use crossbeam_channel::Sender;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// A typed pipeline stage.
///
/// `Worker` is per-worker state created when a worker starts and handed back to
/// [`close`](Stage::close) when it receives its stop signal: a thread pool, an
/// open connection, scratch buffers. Stages without such state use `()`.
pub trait Stage: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;
    type Worker: Send;

    /// Short name used for thread names, logs and metrics.
    fn name(&self) -> &str;

    /// Create the worker-local state for worker `worker_id`.
    ///
    /// # Errors
    /// A failure here is fatal for the run: the pipeline is aborted.
    fn open(&self, worker_id: usize) -> Result<Self::Worker>;

    /// Process one batch.
    ///
    /// # Errors
    /// Handled according to the pipeline's [`ErrorPolicy`].
    fn handle(
        &self,
        worker: &mut Self::Worker,
        batch_index: usize,
        input: Self::Input,
    ) -> Result<Self::Output>;

    /// Release worker-local state.
    ///
    /// # Errors
    /// Logged; never affects the run outcome.
    fn close(&self, worker: Self::Worker) -> Result<()> {
        drop(worker);
        Ok(())
    }
}

/// A batch whose handler failed in some stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchFailure {
    pub stage: String,
    pub batch_index: usize,
    pub error: String,
}

/// What workers tell the orchestrator besides forwarding results.
#[derive(Debug)]
pub(crate) enum StageEvent {
    Failed(BatchFailure),
    Dropped { stage: String, batch_index: usize },
    WorkerFailed { stage: String, worker_id: usize, error: String },
}

/// Shared run state between the orchestrator and every worker.
pub(crate) struct RunControl {
    abort: AtomicBool,
    stopping: AtomicBool,
    policy: ErrorPolicy,
    poll_interval: Duration,
    events: Sender<StageEvent>,
}

impl RunControl {
    pub(crate) fn new(policy: ErrorPolicy, poll_interval: Duration, events: Sender<StageEvent>) -> Self {
        Self {
            abort: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            policy,
            poll_interval,
            events,
        }
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub(crate) fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// No new handler invocations start once this is set.
    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst) || self.is_aborted()
    }

    pub(crate) fn begin_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    fn report(&self, event: StageEvent) {
        // The orchestrator owns the receiver for the whole run.
        let _ = self.events.send(event);
    }

    fn fail(&self, failure: BatchFailure) {
        let abort = self.policy == ErrorPolicy::Abort;
        self.report(StageEvent::Failed(failure));
        if abort {
            self.abort();
        }
    }
}

/// Body of one worker thread.
pub(crate) fn run_worker<S: Stage>(
    stage: Arc<S>,
    worker_id: usize,
    input: Queue<S::Input>,
    output: Queue<S::Output>,
    ctl: Arc<RunControl>,
    metrics: Arc<StageMetrics>,
) {
    let name = stage.name().to_string();
    debug!(stage = %name, worker = worker_id, "worker running");

    let mut state = match stage.open(worker_id) {
        Ok(state) => Some(state),
        Err(e) => {
            error!(stage = %name, worker = worker_id, error = %format!("{e:#}"), "worker failed to start");
            ctl.report(StageEvent::WorkerFailed {
                stage: name.clone(),
                worker_id,
                error: format!("{e:#}"),
            });
            ctl.abort();
            None
        }
    };

    loop {
        let task = match input.get_timeout(ctl.poll_interval()) {
            Recv::Idle => {
                trace!(stage = %name, worker = worker_id, "waiting for task");
                continue;
            }
            Recv::Closed => {
                warn!(stage = %name, worker = worker_id, "input queue closed without a stop signal");
                break;
            }
            Recv::Message(Message::Shutdown) => {
                debug!(stage = %name, worker = worker_id, "received stop signal");
                break;
            }
            Recv::Message(Message::Task(task)) => task,
        };

        let idx = task.batch_index;
        let Some(st) = state.as_mut().filter(|_| !ctl.is_stopping()) else {
            debug!(stage = %name, batch = idx, "pipeline stopping, dropping batch");
            metrics.record_dropped();
            ctl.report(StageEvent::Dropped { stage: name.clone(), batch_index: idx });
            continue;
        };

        metrics.record_started();
        debug!("[{:<10}] start batch={idx}", name.to_uppercase());
        let result = catch_unwind(AssertUnwindSafe(|| stage.handle(st, idx, task.payload)))
            .unwrap_or_else(|panic| Err(anyhow!("handler panicked: {}", panic_message(&panic))));

        match result {
            Ok(out) => {
                if forward(&output, Task::new(idx, out), &ctl) {
                    metrics.record_completed();
                    debug!("[{:<10}] end   batch={idx}", name.to_uppercase());
                } else {
                    debug!(stage = %name, batch = idx, "pipeline stopping, result not forwarded");
                    metrics.record_dropped();
                    ctl.report(StageEvent::Dropped { stage: name.clone(), batch_index: idx });
                }
            }
            Err(e) => {
                error!(stage = %name, batch = idx, error = %format!("{e:#}"), "error processing batch");
                metrics.record_failed();
                ctl.fail(BatchFailure { stage: name.clone(), batch_index: idx, error: format!("{e:#}") });
            }
        }
    }

    if let Some(st) = state
        && let Err(e) = stage.close(st)
    {
        warn!(stage = %name, worker = worker_id, error = %format!("{e:#}"), "worker teardown failed");
    }
    debug!(stage = %name, worker = worker_id, "worker shutdown");
}

/// Enqueue downstream, giving up only when the pipeline is stopping.
fn forward<T>(output: &Queue<T>, task: Task<T>, ctl: &RunControl) -> bool {
    let mut msg = Message::Task(task);
    loop {
        match output.put_timeout(msg, ctl.poll_interval()) {
            Ok(()) => return true,
            Err(SendFailure::Full(m)) => {
                if ctl.is_stopping() {
                    return false;
                }
                trace!("output queue full, waiting");
                msg = m;
            }
            Err(SendFailure::Closed(_)) => return false,
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
