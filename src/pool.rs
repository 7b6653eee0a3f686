//! Bounded pool of worker processes.
//!
//! Each job runs in its own OS process so native decoder state and plugin
//! accumulators never leak between shards. Jobs are queued upfront; outcomes
//! are consumed in completion order, so downstream aggregation must not
//! depend on arrival order. Shutdown is forceful: close the queue, kill live
//! children, join the worker threads. It runs on every exit path and never
//! propagates errors past the teardown boundary.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, warn};

use crate::shard::ShardDescriptor;

/// One unit of pool work: either the map phase over a shard or the
/// partition-level reduce phase over a saved day file.
#[derive(Debug, Clone)]
pub enum Job {
    Map(ShardDescriptor),
    Reduce(PathBuf),
}

impl Job {
    /// The file this job touches, for logs and failure reports.
    pub fn path(&self) -> &Path {
        match self {
            Self::Map(shard) => &shard.path,
            Self::Reduce(path) => path,
        }
    }
}

/// Explicit per-job result. Failures carry a reason instead of silently
/// vanishing; the orchestrator surfaces them in the final report.
#[derive(Debug)]
pub enum JobOutcome {
    Completed { job: Job, payload: Vec<u8> },
    Failed { job: Job, reason: String },
}

type Launcher = dyn Fn(&Job) -> Command + Send + Sync;
type ChildSlot = Arc<Mutex<Option<Child>>>;

/// Fixed-size worker-process pool. One thread per pool slot supervises one
/// child process at a time.
pub struct WorkerPool {
    jobs_tx: Option<Sender<Job>>,
    outcomes_rx: Receiver<JobOutcome>,
    handles: Vec<JoinHandle<()>>,
    slots: Vec<ChildSlot>,
    stopping: Arc<AtomicBool>,
}

/// Default pool size: three quarters of available parallelism, at least one.
pub fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism().map_or(1, usize::from);
    (cores * 3 / 4).max(1)
}

impl WorkerPool {
    /// Spawn `worker_count` supervisor threads. `launcher` builds the child
    /// command for a job; the pool pipes its stdout and inherits stderr.
    pub fn spawn(
        worker_count: usize,
        launcher: impl Fn(&Job) -> Command + Send + Sync + 'static,
    ) -> Result<Self> {
        let launcher: Arc<Launcher> = Arc::new(launcher);
        let (jobs_tx, jobs_rx) = unbounded::<Job>();
        let (outcomes_tx, outcomes_rx) = unbounded();
        let stopping = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(worker_count);
        let mut slots = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let slot: ChildSlot = Arc::new(Mutex::new(None));
            slots.push(Arc::clone(&slot));

            let jobs_rx = jobs_rx.clone();
            let outcomes_tx = outcomes_tx.clone();
            let launcher = Arc::clone(&launcher);
            let stopping = Arc::clone(&stopping);

            let handle = std::thread::Builder::new()
                .name(format!("pool-worker-{worker_id}"))
                .spawn(move || {
                    worker_loop(jobs_rx, outcomes_tx, slot, launcher, stopping);
                })
                .context("spawning pool worker thread")?;
            handles.push(handle);
        }

        Ok(Self {
            jobs_tx: Some(jobs_tx),
            outcomes_rx,
            handles,
            slots,
            stopping,
        })
    }

    /// Queue a job. Fails once the pool is shut down.
    pub fn submit(&self, job: Job) -> Result<()> {
        self.jobs_tx
            .as_ref()
            .context("pool is shut down")?
            .send(job)
            .context("pool workers exited")?;
        Ok(())
    }

    /// Block until the next job finishes, in completion order.
    pub fn next_outcome(&self) -> Result<JobOutcome> {
        self.outcomes_rx
            .recv()
            .context("worker pool closed while draining outcomes")
    }

    /// Number of child processes currently alive.
    pub fn live_children(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| lock(slot).is_some())
            .count()
    }

    /// Forceful teardown: stop accepting work, kill live children, join the
    /// supervisor threads. Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.jobs_tx.take();

        for slot in &self.slots {
            if let Some(child) = lock(slot).as_mut() {
                if let Err(err) = child.kill() {
                    debug!(%err, "killing worker child");
                }
            }
        }

        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("pool worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock(slot: &ChildSlot) -> std::sync::MutexGuard<'_, Option<Child>> {
    slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn worker_loop(
    jobs_rx: Receiver<Job>,
    outcomes_tx: Sender<JobOutcome>,
    slot: ChildSlot,
    launcher: Arc<Launcher>,
    stopping: Arc<AtomicBool>,
) {
    for job in jobs_rx.iter() {
        if stopping.load(Ordering::SeqCst) {
            break;
        }

        let outcome = match run_job(&job, &slot, launcher.as_ref(), &stopping) {
            Ok(payload) => JobOutcome::Completed { job, payload },
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(reason, "worker job failed");
                JobOutcome::Failed { job, reason }
            }
        };

        if outcomes_tx.send(outcome).is_err() {
            // Orchestrator is gone; nothing left to report to.
            break;
        }
    }
}

fn run_job(
    job: &Job,
    slot: &ChildSlot,
    launcher: &Launcher,
    stopping: &AtomicBool,
) -> Result<Vec<u8>> {
    if stopping.load(Ordering::SeqCst) {
        bail!("pool is stopping");
    }

    let mut command = launcher(job);
    command.stdin(Stdio::null()).stdout(Stdio::piped());

    debug!(path = %job.path().display(), "starting worker job");
    let mut child = command.spawn().context("spawning worker process")?;
    let mut stdout = child.stdout.take().context("worker stdout not piped")?;
    *lock(slot) = Some(child);

    // The shutdown kill sweep may have raced the spawn above.
    if stopping.load(Ordering::SeqCst) {
        if let Some(child) = lock(slot).as_mut() {
            let _ = child.kill();
        }
    }

    // Draining stdout doubles as completion wait: EOF arrives when the
    // child exits or is killed.
    let mut payload = Vec::new();
    let read = std::io::Read::read_to_end(&mut stdout, &mut payload);

    let mut child = lock(slot).take().context("worker child vanished")?;
    let status = child.wait().context("waiting for worker process")?;

    read.context("reading worker output")?;
    if !status.success() {
        bail!("worker exited with {status}");
    }
    Ok(payload)
}
