use anyhow::{Result, bail};
use snapflow::{ErrorPolicy, InterruptHandle, PipelineBuilder, Stage, Task};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(10);

fn tasks(n: usize) -> Vec<Task<usize>> {
    (0..n).map(|i| Task::new(i, i)).collect()
}

/// Counts how many batches it has started.
struct Counting {
    started: Arc<AtomicUsize>,
}

impl Stage for Counting {
    type Input = usize;
    type Output = usize;
    type Worker = ();

    fn name(&self) -> &str {
        "count"
    }

    fn open(&self, _: usize) -> Result<()> {
        Ok(())
    }

    fn handle(&self, _: &mut (), _: usize, input: usize) -> Result<usize> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(input)
    }
}

/// Blocks every batch until the gate opens.
struct Gated {
    open: Arc<AtomicBool>,
}

impl Stage for Gated {
    type Input = usize;
    type Output = usize;
    type Worker = ();

    fn name(&self) -> &str {
        "gated"
    }

    fn open(&self, _: usize) -> Result<()> {
        Ok(())
    }

    fn handle(&self, _: &mut (), _: usize, input: usize) -> Result<usize> {
        while !self.open.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
        Ok(input)
    }
}

struct Sleepy(Duration);

impl Stage for Sleepy {
    type Input = usize;
    type Output = usize;
    type Worker = ();

    fn name(&self) -> &str {
        "sleepy"
    }

    fn open(&self, _: usize) -> Result<()> {
        Ok(())
    }

    fn handle(&self, _: &mut (), _: usize, input: usize) -> Result<usize> {
        thread::sleep(self.0);
        Ok(input)
    }
}

/// Fails on one batch and panics on another.
struct Flaky {
    fail_on: Option<usize>,
    panic_on: Option<usize>,
}

impl Stage for Flaky {
    type Input = usize;
    type Output = usize;
    type Worker = ();

    fn name(&self) -> &str {
        "flaky"
    }

    fn open(&self, _: usize) -> Result<()> {
        Ok(())
    }

    fn handle(&self, _: &mut (), batch_index: usize, input: usize) -> Result<usize> {
        if self.fail_on == Some(batch_index) {
            bail!("bad batch {batch_index}");
        }
        if self.panic_on == Some(batch_index) {
            panic!("boom on {batch_index}");
        }
        Ok(input)
    }
}

struct NeverOpens;

impl Stage for NeverOpens {
    type Input = usize;
    type Output = usize;
    type Worker = ();

    fn name(&self) -> &str {
        "broken"
    }

    fn open(&self, worker_id: usize) -> Result<()> {
        bail!("no resources for worker {worker_id}")
    }

    fn handle(&self, _: &mut (), _: usize, input: usize) -> Result<usize> {
        Ok(input)
    }
}

#[test]
fn every_batch_passes_every_stage() -> Result<()> {
    let started = Arc::new(AtomicUsize::new(0));
    let pipeline = PipelineBuilder::new(2)
        .stage(Counting { started: Arc::clone(&started) }, 3, 2)
        .stage(Sleepy(Duration::from_millis(1)), 2, 0)
        .poll_interval(POLL)
        .build()?;

    let summary = pipeline.run(tasks(20))?;

    assert!(summary.is_success());
    assert_eq!(summary.completed, (0..20).collect::<Vec<_>>());
    assert_eq!(started.load(Ordering::SeqCst), 20);
    assert_eq!(summary.stages.len(), 2);
    assert!(summary.stages.iter().all(|s| s.completed == 20 && s.failed == 0));
    Ok(())
}

#[test]
fn full_queue_holds_back_the_producer() -> Result<()> {
    let started = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(AtomicBool::new(false));

    let runner = {
        let started = Arc::clone(&started);
        let gate = Arc::clone(&gate);
        thread::spawn(move || -> Result<_> {
            PipelineBuilder::new(1)
                .stage(Counting { started }, 1, 1)
                .stage(Gated { open: gate }, 1, 0)
                .poll_interval(POLL)
                .build()?
                .run(tasks(10))
        })
    };

    thread::sleep(Duration::from_millis(300));
    // One batch held by the blocked stage, one queued, one waiting to be forwarded.
    assert!(started.load(Ordering::SeqCst) <= 3, "producer ran ahead: {}", started.load(Ordering::SeqCst));

    gate.store(true, Ordering::SeqCst);
    let summary = runner.join().map_err(|_| anyhow::anyhow!("runner panicked"))??;
    assert!(summary.is_success());
    assert_eq!(started.load(Ordering::SeqCst), 10);
    Ok(())
}

#[test]
fn interrupt_stops_all_workers() -> Result<()> {
    let interrupt = InterruptHandle::new();
    let pipeline = PipelineBuilder::new(4)
        .stage(Sleepy(Duration::from_millis(20)), 2, 4)
        .stage(Sleepy(Duration::from_millis(20)), 2, 0)
        .poll_interval(POLL)
        .interrupt(interrupt.clone())
        .build()?;

    let trigger = {
        let interrupt = interrupt.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            interrupt.trigger();
        })
    };

    let start = Instant::now();
    let summary = pipeline.run(tasks(200))?;
    trigger.join().map_err(|_| anyhow::anyhow!("trigger panicked"))?;

    assert!(summary.interrupted);
    assert!(!summary.is_success());
    assert!(summary.completed.len() < 200);
    assert!(summary.completed.len() + summary.failures.len() + summary.dropped <= 200);
    assert!(start.elapsed() < Duration::from_secs(5), "shutdown took {:?}", start.elapsed());
    Ok(())
}

#[test]
fn skip_policy_keeps_going() -> Result<()> {
    let pipeline = PipelineBuilder::new(2)
        .stage(Flaky { fail_on: Some(3), panic_on: None }, 2, 2)
        .error_policy(ErrorPolicy::SkipBatch)
        .poll_interval(POLL)
        .build()?;

    let summary = pipeline.run(tasks(8))?;

    assert!(!summary.aborted);
    assert_eq!(summary.failed_batches(), vec![3]);
    assert_eq!(summary.failures[0].stage, "flaky");
    assert!(summary.failures[0].error.contains("bad batch 3"));
    assert_eq!(summary.completed, vec![0, 1, 2, 4, 5, 6, 7]);
    assert!(!summary.is_success());
    Ok(())
}

#[test]
fn abort_policy_stops_the_run() -> Result<()> {
    let pipeline = PipelineBuilder::new(1)
        .stage(Flaky { fail_on: Some(0), panic_on: None }, 1, 1)
        .stage(Sleepy(Duration::from_millis(5)), 1, 0)
        .error_policy(ErrorPolicy::Abort)
        .poll_interval(POLL)
        .build()?;

    let summary = pipeline.run(tasks(50))?;

    assert!(summary.aborted);
    assert_eq!(summary.failed_batches(), vec![0]);
    assert!(summary.completed.len() < 50);
    Ok(())
}

#[test]
fn panicking_handler_is_a_failed_batch() -> Result<()> {
    let pipeline = PipelineBuilder::new(2)
        .stage(Flaky { fail_on: None, panic_on: Some(2) }, 1, 0)
        .poll_interval(POLL)
        .build()?;

    let summary = pipeline.run(tasks(5))?;

    assert_eq!(summary.failed_batches(), vec![2]);
    assert!(summary.failures[0].error.contains("boom on 2"));
    assert_eq!(summary.completed, vec![0, 1, 3, 4]);
    Ok(())
}

#[test]
fn worker_that_cannot_open_aborts_the_run() -> Result<()> {
    let pipeline = PipelineBuilder::new(1)
        .stage(NeverOpens, 2, 0)
        .poll_interval(POLL)
        .build()?;

    let summary = pipeline.run(tasks(5))?;

    assert!(summary.aborted);
    assert_eq!(summary.worker_errors.len(), 2);
    assert!(summary.worker_errors[0].contains("no resources"));
    assert!(summary.completed.is_empty());
    Ok(())
}
