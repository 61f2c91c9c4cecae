//! Multi-stage pipeline orchestration.
//!
//! A [`Pipeline`] is a linear chain of [`Stage`]s joined by bounded
//! [`Queue`]s. Every stage runs on its own pool of worker threads, so while
//! batch *k* is being transformed, batch *k+1* can already be extracting and
//! batch *k-1* cleaning up.
//!
//! ```text
//!  feed ─▶ [q0] ─▶ stage A × N ─▶ [q1] ─▶ stage B × M ─▶ [q2] ─▶ completions
//! ```
//!
//! The chain is assembled with [`PipelineBuilder`], whose type parameters
//! track the input type of the first stage and the output type of the last,
//! so adjacent stages must agree on the payload type at compile time.
//!
//! [`Pipeline::run`] drives one run end to end:
//!
//! 1. start every worker (threads are named `"{stage}-{i}"`),
//! 2. feed all tasks into the first queue, blocking on backpressure,
//! 3. wait until every batch has either left the last stage or failed,
//!    or until the run is aborted or interrupted,
//! 4. stop the stages in chain order, delivering exactly one stop signal per
//!    worker and joining each stage before moving on to the next,
//! 5. return a [`RunSummary`].

use crate::config::ErrorPolicy;
use crate::metrics::{PipelineMetrics, StageMetrics, StageSnapshot};
use crate::queue::{Message, Queue, SendFailure, Task};
use crate::stage::{BatchFailure, RunControl, Stage, StageEvent, run_worker};
use anyhow::{Result, bail};
use crossbeam_channel::{Receiver, select, unbounded};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A cheap, clonable flag that asks a running pipeline or sync to stop.
///
/// Triggering it is what a Ctrl-C handler does: no new batches are started,
/// in-flight work finishes, workers are shut down and joined.
#[derive(Clone, Debug, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one pipeline run.
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    /// Batches submitted.
    pub total: usize,
    /// Indices of batches that passed every stage, ascending.
    pub completed: Vec<usize>,
    /// Batches whose handler failed, in the order the failures were reported.
    pub failures: Vec<BatchFailure>,
    /// Batches discarded unprocessed while the pipeline was stopping.
    pub dropped: usize,
    /// Workers that could not start.
    pub worker_errors: Vec<String>,
    pub aborted: bool,
    pub interrupted: bool,
    pub elapsed: Duration,
    pub stages: Vec<StageSnapshot>,
}

impl RunSummary {
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.aborted
            && !self.interrupted
            && self.failures.is_empty()
            && self.worker_errors.is_empty()
            && self.completed.len() == self.total
    }

    #[must_use]
    pub fn failed_batches(&self) -> Vec<usize> {
        let mut idx: Vec<usize> = self.failures.iter().map(|f| f.batch_index).collect();
        idx.sort_unstable();
        idx.dedup();
        idx
    }
}

type SpawnFn = Box<dyn Fn(usize, Arc<RunControl>) -> io::Result<JoinHandle<()>> + Send>;
type StopFn = Box<dyn Fn(Duration) -> StopDelivery + Send>;

enum StopDelivery {
    Sent,
    Full,
    Closed,
}

/// One stage, type-erased so the pipeline can hold a heterogeneous chain.
struct StageSlot {
    name: String,
    workers: usize,
    spawn: SpawnFn,
    stop: StopFn,
}

/// Assembles a [`Pipeline`] stage by stage.
///
/// `In` is the payload type fed into the first queue; `Out` is the payload
/// type leaving the most recently added stage.
pub struct PipelineBuilder<In, Out> {
    input: Queue<In>,
    output: Queue<Out>,
    slots: Vec<StageSlot>,
    metrics: PipelineMetrics,
    policy: ErrorPolicy,
    poll_interval: Duration,
    interrupt: InterruptHandle,
    progress: bool,
    _marker: PhantomData<fn(In) -> Out>,
}

impl<In: Send + 'static> PipelineBuilder<In, In> {
    /// Start a chain whose first queue holds at most `capacity` tasks (`0` = unbounded).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let q = Queue::new(capacity);
        Self {
            input: q.clone(),
            output: q,
            slots: Vec::new(),
            metrics: PipelineMetrics::default(),
            policy: ErrorPolicy::default(),
            poll_interval: Duration::from_secs(1),
            interrupt: InterruptHandle::new(),
            progress: false,
            _marker: PhantomData,
        }
    }
}

impl<In: Send + 'static, Out: Send + 'static> PipelineBuilder<In, Out> {
    /// Append a stage run by `workers` threads. Its results go to a new queue
    /// of `output_capacity` (`0` = unbounded).
    #[must_use]
    pub fn stage<S>(mut self, stage: S, workers: usize, output_capacity: usize) -> PipelineBuilder<In, S::Output>
    where
        S: Stage<Input = Out>,
    {
        let name = stage.name().to_string();
        let metrics = self.metrics.register(&name);
        let next: Queue<S::Output> = Queue::new(output_capacity);
        let stage = Arc::new(stage);

        let spawn: SpawnFn = {
            let input = self.output.clone();
            let output = next.clone();
            let name = name.clone();
            Box::new(move |worker_id, ctl| {
                spawn_worker(
                    &name,
                    worker_id,
                    Arc::clone(&stage),
                    input.clone(),
                    output.clone(),
                    ctl,
                    Arc::clone(&metrics),
                )
            })
        };
        let stop: StopFn = {
            let input = self.output.clone();
            Box::new(move |timeout| match input.put_timeout(Message::Shutdown, timeout) {
                Ok(()) => StopDelivery::Sent,
                Err(SendFailure::Full(_)) => StopDelivery::Full,
                Err(SendFailure::Closed(_)) => StopDelivery::Closed,
            })
        };
        self.slots.push(StageSlot { name, workers, spawn, stop });

        PipelineBuilder {
            input: self.input,
            output: next,
            slots: self.slots,
            metrics: self.metrics,
            policy: self.policy,
            poll_interval: self.poll_interval,
            interrupt: self.interrupt,
            progress: self.progress,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// How long workers and the orchestrator block before re-checking for a stop.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn interrupt(mut self, handle: InterruptHandle) -> Self {
        self.interrupt = handle;
        self
    }

    /// Draw a progress bar on stderr while running.
    #[must_use]
    pub fn progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    /// Finish the chain.
    ///
    /// # Errors
    /// Fails if no stage was added, a stage has zero workers, or the poll
    /// interval is zero.
    pub fn build(self) -> Result<Pipeline<In, Out>> {
        if self.slots.is_empty() {
            bail!("pipeline has no stages");
        }
        if let Some(slot) = self.slots.iter().find(|s| s.workers == 0) {
            bail!("stage '{}' must have at least one worker", slot.name);
        }
        if self.poll_interval.is_zero() {
            bail!("poll interval must be greater than zero");
        }
        Ok(Pipeline {
            input: self.input,
            output: self.output,
            slots: self.slots,
            metrics: self.metrics,
            policy: self.policy,
            poll_interval: self.poll_interval,
            interrupt: self.interrupt,
            progress: self.progress,
        })
    }
}

fn spawn_worker<S: Stage>(
    name: &str,
    worker_id: usize,
    stage: Arc<S>,
    input: Queue<S::Input>,
    output: Queue<S::Output>,
    ctl: Arc<RunControl>,
    metrics: Arc<StageMetrics>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("{name}-{worker_id}"))
        .spawn(move || run_worker(stage, worker_id, input, output, ctl, metrics))
}

/// A ready-to-run stage chain. See the [module docs](self).
pub struct Pipeline<In, Out> {
    input: Queue<In>,
    output: Queue<Out>,
    slots: Vec<StageSlot>,
    metrics: PipelineMetrics,
    policy: ErrorPolicy,
    poll_interval: Duration,
    interrupt: InterruptHandle,
    progress: bool,
}

/// Running tally kept by the orchestrator.
#[derive(Default)]
struct Tally {
    completed: Vec<usize>,
    failures: Vec<BatchFailure>,
    dropped: usize,
    worker_errors: Vec<String>,
}

impl Tally {
    fn settled(&self) -> usize {
        self.completed.len() + self.failures.len()
    }

    /// Record `event`; true when it settles a batch.
    fn on_event(&mut self, event: StageEvent) -> bool {
        match event {
            StageEvent::Failed(f) => {
                self.failures.push(f);
                true
            }
            StageEvent::Dropped { stage, batch_index } => {
                debug!(stage = %stage, batch = batch_index, "batch dropped");
                self.dropped += 1;
                false
            }
            StageEvent::WorkerFailed { stage, worker_id, error } => {
                self.worker_errors.push(format!("{stage}-{worker_id}: {error}"));
                false
            }
        }
    }
}

impl<In: Send + 'static, Out: Send + 'static> Pipeline<In, Out> {
    /// Counters for every stage, live while the pipeline runs.
    #[must_use]
    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Run all `tasks` through the chain, discarding final outputs.
    ///
    /// # Errors
    /// Only fails if worker threads cannot be spawned. Batch failures,
    /// aborts and interrupts are reported in the [`RunSummary`].
    pub fn run(self, tasks: Vec<Task<In>>) -> Result<RunSummary> {
        self.run_with(tasks, |_| {})
    }

    /// Run all `tasks`, handing each output of the last stage to `on_complete`.
    ///
    /// # Errors
    /// See [`run`](Self::run).
    pub fn run_with<F>(self, tasks: Vec<Task<In>>, mut on_complete: F) -> Result<RunSummary>
    where
        F: FnMut(Task<Out>),
    {
        let start = Instant::now();
        let total = tasks.len();
        let poll = self.poll_interval;
        let (events_tx, events_rx) = unbounded();
        let ctl = Arc::new(RunControl::new(self.policy, poll, events_tx));
        let mut tally = Tally::default();

        info!(batches = total, stages = self.slots.len(), "pipeline starting");

        // Start workers, remembering per stage how many actually started.
        let mut handles: Vec<Vec<JoinHandle<()>>> = Vec::with_capacity(self.slots.len());
        let mut spawn_error = None;
        for slot in &self.slots {
            let mut started = Vec::with_capacity(slot.workers);
            if spawn_error.is_none() {
                for worker_id in 0..slot.workers {
                    match (slot.spawn)(worker_id, Arc::clone(&ctl)) {
                        Ok(h) => started.push(h),
                        Err(e) => {
                            error!(stage = %slot.name, worker = worker_id, error = %e, "failed to spawn worker");
                            spawn_error = Some(e);
                            ctl.abort();
                            break;
                        }
                    }
                }
            }
            handles.push(started);
        }

        let bar = self.progress_bar(total);

        // Feed.
        let mut fed = 0;
        'feed: for task in tasks {
            let mut msg = Message::Task(task);
            loop {
                if self.interrupt.is_triggered() || ctl.is_aborted() {
                    break 'feed;
                }
                match self.input.put_timeout(msg, poll) {
                    Ok(()) => break,
                    Err(SendFailure::Full(m)) => {
                        msg = m;
                        self.drain_ready(&events_rx, &mut tally, &mut on_complete, &bar);
                    }
                    Err(SendFailure::Closed(_)) => break 'feed,
                }
            }
            fed += 1;
            self.drain_ready(&events_rx, &mut tally, &mut on_complete, &bar);
        }
        debug!(fed, "all batches submitted");

        // Wait.
        while tally.settled() < fed && !ctl.is_aborted() && !self.interrupt.is_triggered() {
            select! {
                recv(self.output.receiver()) -> msg => {
                    if let Ok(Message::Task(t)) = msg {
                        tally.completed.push(t.batch_index);
                        on_complete(t);
                        bar.inc(1);
                    }
                }
                recv(events_rx) -> ev => {
                    if let Ok(ev) = ev
                        && tally.on_event(ev)
                    {
                        bar.inc(1);
                    }
                }
                default(poll) => {}
            }
        }

        let interrupted = self.interrupt.is_triggered();
        let aborted = ctl.is_aborted();
        if interrupted || aborted {
            warn!(interrupted, aborted, "stopping pipeline before all batches finished");
            ctl.begin_stopping();
        }

        // Stop stages in chain order so upstream results are in place before
        // downstream workers get their stop signal.
        for (slot, workers) in self.slots.iter().zip(handles) {
            let n = workers.len();
            let mut sent = 0;
            while sent < n {
                match (slot.stop)(poll) {
                    StopDelivery::Sent => sent += 1,
                    // Workers that failed to open never drain their queue.
                    StopDelivery::Full if workers.iter().all(JoinHandle::is_finished) => break,
                    StopDelivery::Full => {
                        warn!(stage = %slot.name, "queue full, retrying shutdown");
                        self.drain_ready(&events_rx, &mut tally, &mut on_complete, &bar);
                    }
                    StopDelivery::Closed => break,
                }
            }
            for h in workers {
                let tname = h.thread().name().unwrap_or("worker").to_string();
                if h.join().is_err() {
                    error!(thread = %tname, "worker thread panicked");
                }
            }
            debug!(stage = %slot.name, "stage stopped");
        }

        // Late arrivals from the last stage and any trailing events.
        while let Some(msg) = self.output.try_get() {
            if let Message::Task(t) = msg {
                tally.completed.push(t.batch_index);
                on_complete(t);
            }
        }
        while let Ok(ev) = events_rx.try_recv() {
            tally.on_event(ev);
        }
        bar.finish_and_clear();

        if let Some(e) = spawn_error {
            return Err(anyhow::Error::new(e).context("failed to start pipeline workers"));
        }

        tally.completed.sort_unstable();
        let summary = RunSummary {
            total,
            completed: tally.completed,
            failures: tally.failures,
            dropped: tally.dropped,
            worker_errors: tally.worker_errors,
            aborted,
            interrupted,
            elapsed: start.elapsed(),
            stages: self.metrics.snapshot(),
        };
        info!(
            total = summary.total,
            completed = summary.completed.len(),
            failed = summary.failures.len(),
            dropped = summary.dropped,
            aborted,
            interrupted,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "pipeline finished"
        );
        Ok(summary)
    }

    fn drain_ready<F: FnMut(Task<Out>)>(
        &self,
        events: &Receiver<StageEvent>,
        tally: &mut Tally,
        on_complete: &mut F,
        bar: &ProgressBar,
    ) {
        while let Some(msg) = self.output.try_get() {
            if let Message::Task(t) = msg {
                tally.completed.push(t.batch_index);
                on_complete(t);
                bar.inc(1);
            }
        }
        while let Ok(ev) = events.try_recv() {
            if tally.on_event(ev) {
                bar.inc(1);
            }
        }
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::stderr());
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} batches ({eta})")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar
    }
}
