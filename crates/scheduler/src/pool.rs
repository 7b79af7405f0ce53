//! Draw worker pool shared by all cells.
//!
//! The pool owns a fixed set of worker threads, each with its own FIFO
//! queue. Jobs are routed by a stable hash of the cell key, so every job of
//! one cell runs on the same worker in submission order while different
//! cells spread across the pool. The number of concurrently running
//! rasterizations is capped at the worker count no matter how many cells
//! exist.
//!
//! Resizing detaches the current worker set: its queues close, its workers
//! finish whatever they already hold and then exit on their own. A fresh set
//! is spawned lazily on the next submission. Routing changes with the size,
//! so ordering between a cell's jobs is only guaranteed within one
//! configuration; jobs from before a resize are still generation-checked.

use crate::config::SchedulerConfig;
use crate::error::PoolError;
use crate::job::{panic_message, RenderJob, RenderOutcome};
use crossbeam_channel::{Receiver, Sender};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex, PoisonError, RwLock,
};
use std::thread::{self, JoinHandle};

/// Default number of draw workers
pub const DEFAULT_WORKER_COUNT: usize = 16;

/// Default worker thread name prefix
pub const DEFAULT_THREAD_NAME: &str = "danmaku-draw";

static NEXT_CELL_KEY: AtomicU64 = AtomicU64::new(1);

/// Identity of a cell, used for worker routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey(u64);

impl CellKey {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// A process-unique key
    pub fn next() -> Self {
        Self(NEXT_CELL_KEY.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.0)
    }
}

/// Receives the lifecycle of a submitted job, on the worker thread
pub trait JobListener: Send {
    /// Called right before the job executes
    fn started(&self, _job: &RenderJob) {}

    /// Called with the job's outcome once it has executed
    fn completed(self: Box<Self>, job: &RenderJob, outcome: RenderOutcome);
}

impl<F> JobListener for F
where
    F: FnOnce(RenderOutcome) + Send,
{
    fn completed(self: Box<Self>, _job: &RenderJob, outcome: RenderOutcome) {
        (*self)(outcome)
    }
}

/// Snapshot of pool counters
///
/// Counters accumulate across reconfigurations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Jobs accepted by `submit`
    pub jobs_submitted: u64,

    /// Jobs that finished cleanly
    pub jobs_finished: u64,

    /// Jobs that finished but were stale at the final check
    pub jobs_stale: u64,

    /// Jobs aborted before producing a usable surface
    pub jobs_aborted: u64,

    /// Number of times the worker set was torn down by a resize
    pub rebuilds: u64,

    /// Configured worker count
    pub worker_count: usize,
}

impl PoolStats {
    /// Jobs that have executed, whatever their outcome
    pub fn jobs_completed(&self) -> u64 {
        self.jobs_finished + self.jobs_stale + self.jobs_aborted
    }

    /// Jobs submitted but not yet executed
    pub fn in_flight(&self) -> u64 {
        self.jobs_submitted.saturating_sub(self.jobs_completed())
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    finished: AtomicU64,
    stale: AtomicU64,
    aborted: AtomicU64,
    rebuilds: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &RenderOutcome) {
        let counter = match outcome {
            RenderOutcome::Finished(_) => &self.finished,
            RenderOutcome::Stale(_) => &self.stale,
            RenderOutcome::Aborted => &self.aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Task {
    job: RenderJob,
    listener: Box<dyn JobListener>,
}

/// One generation of worker threads
struct WorkerSet {
    epoch: u64,
    queues: Vec<Sender<Task>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerSet {
    fn spawn(
        epoch: u64,
        count: usize,
        thread_name: &str,
        counters: &Arc<Counters>,
    ) -> Result<Self, PoolError> {
        let mut queues = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for index in 0..count {
            let (sender, receiver) = crossbeam_channel::unbounded();
            let counters = counters.clone();
            let handle = thread::Builder::new()
                .name(format!("{thread_name}-{epoch}-{index}"))
                .spawn(move || run_worker(epoch, index, receiver, counters))
                .inspect_err(|err| {
                    tracing::warn!(epoch, index, %err, "failed to spawn draw worker");
                })?;
            queues.push(sender);
            handles.push(handle);
        }

        tracing::debug!(epoch, workers = count, "draw workers started");
        Ok(Self {
            epoch,
            queues,
            handles,
        })
    }

    /// Close the queues and wait for the workers to drain them
    fn join(self) {
        let WorkerSet {
            epoch,
            queues,
            handles,
        } = self;
        drop(queues);
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!(epoch, "draw worker exited by panic");
            }
        }
    }
}

/// Worker loop
///
/// Runs until every sender for the queue is gone and the queue is empty, so
/// a detached worker set still finishes the jobs it was handed.
fn run_worker(epoch: u64, index: usize, receiver: Receiver<Task>, counters: Arc<Counters>) {
    for Task { job, listener } in receiver.iter() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            listener.started(&job);
            job.execute()
        }))
        .unwrap_or_else(|payload| {
            tracing::warn!(
                cell = %job.key(),
                worker = index,
                panic = %panic_message(&payload),
                "draw job panicked"
            );
            RenderOutcome::Aborted
        });
        counters.record(&outcome);

        tracing::debug!(
            cell = %job.key(),
            generation = job.generation(),
            outcome = outcome.kind(),
            worker = index,
            "draw job done"
        );

        if panic::catch_unwind(AssertUnwindSafe(|| listener.completed(&job, outcome))).is_err() {
            tracing::warn!(cell = %job.key(), worker = index, "job listener panicked");
        }
    }
    tracing::debug!(epoch, worker = index, "draw worker exiting");
}

struct PoolInner {
    thread_name: String,
    worker_count: AtomicUsize,
    workers: RwLock<Option<WorkerSet>>,
    epoch: AtomicU64,
    shut_down: AtomicBool,
    counters: Arc<Counters>,
    // serializes resizes against lazy creation
    resize: Mutex<()>,
}

/// Bounded pool of draw workers shared across cells
///
/// Cloning is cheap and yields another handle onto the same workers. The
/// pool is built explicitly by the host and handed to every orchestrator.
///
/// # Example
///
/// ```
/// use danmaku_scheduler::{CellKey, WorkerPool};
///
/// let pool = WorkerPool::new(4).unwrap();
/// assert_eq!(pool.worker_count(), 4);
///
/// // same cell, same worker
/// let key = CellKey::new(42);
/// assert_eq!(pool.worker_index(key), pool.worker_index(key));
///
/// // setting the current size again is a no-op
/// assert!(!pool.set_worker_count(4).unwrap());
/// ```
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool with `worker_count` workers
    ///
    /// Threads are not started until the first job is submitted.
    pub fn new(worker_count: usize) -> Result<Self, PoolError> {
        Self::with_thread_name(worker_count, DEFAULT_THREAD_NAME)
    }

    /// Create a pool whose threads are named `<thread_name>-<epoch>-<index>`
    pub fn with_thread_name(
        worker_count: usize,
        thread_name: impl Into<String>,
    ) -> Result<Self, PoolError> {
        if worker_count == 0 {
            return Err(PoolError::InvalidWorkerCount(worker_count));
        }
        Ok(Self::build(worker_count, thread_name.into()))
    }

    fn build(worker_count: usize, thread_name: String) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                thread_name,
                worker_count: AtomicUsize::new(worker_count),
                workers: RwLock::new(None),
                epoch: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
                counters: Arc::new(Counters::default()),
                resize: Mutex::new(()),
            }),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Result<Self, PoolError> {
        Self::with_thread_name(config.worker_count, config.thread_name.clone())
    }

    /// Configured number of workers
    pub fn worker_count(&self) -> usize {
        self.inner.worker_count.load(Ordering::Acquire)
    }

    /// Whether worker threads are currently running
    pub fn is_started(&self) -> bool {
        self.inner
            .workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Worker a cell's jobs are routed to under the current size
    pub fn worker_index(&self, key: CellKey) -> usize {
        route(key, self.worker_count())
    }

    /// Queue `job` for `key`'s worker
    ///
    /// Never blocks on the job itself. Returns the index of the worker the
    /// job was routed to. `listener` is driven on that worker.
    pub fn submit<L>(&self, key: CellKey, job: RenderJob, listener: L) -> Result<usize, PoolError>
    where
        L: JobListener + 'static,
    {
        let task = Task {
            job,
            listener: Box::new(listener),
        };

        let task = {
            let guard = self
                .inner
                .workers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(set) => return self.dispatch(set, key, task),
                None => task,
            }
        };

        let _resize = self
            .inner
            .resize
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut guard = self
            .inner
            .workers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_shut_down() {
            return Err(PoolError::ShutDown);
        }
        if guard.is_none() {
            let epoch = self.inner.epoch.fetch_add(1, Ordering::AcqRel) + 1;
            *guard = Some(WorkerSet::spawn(
                epoch,
                self.worker_count(),
                &self.inner.thread_name,
                &self.inner.counters,
            )?);
        }
        match guard.as_ref() {
            Some(set) => self.dispatch(set, key, task),
            None => Err(PoolError::Disconnected),
        }
    }

    fn dispatch(&self, set: &WorkerSet, key: CellKey, task: Task) -> Result<usize, PoolError> {
        if self.is_shut_down() {
            return Err(PoolError::ShutDown);
        }
        let index = route(key, set.queues.len());
        let generation = task.job.generation();

        let submitted = &self.inner.counters.submitted;
        submitted.fetch_add(1, Ordering::Relaxed);
        if set.queues[index].send(task).is_err() {
            submitted.fetch_sub(1, Ordering::Relaxed);
            return Err(PoolError::Disconnected);
        }

        tracing::debug!(
            cell = %key,
            generation,
            worker = index,
            epoch = set.epoch,
            "draw job queued"
        );
        Ok(index)
    }

    /// Change the number of workers
    ///
    /// Setting the current value is a no-op and returns `Ok(false)`.
    /// Otherwise the running workers are detached (they drain their queues
    /// and exit without being joined) and `Ok(true)` is returned; new workers
    /// start with the next submission.
    pub fn set_worker_count(&self, worker_count: usize) -> Result<bool, PoolError> {
        if worker_count == 0 {
            return Err(PoolError::InvalidWorkerCount(worker_count));
        }
        let _resize = self
            .inner
            .resize
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let previous = self.inner.worker_count.load(Ordering::Acquire);
        if previous == worker_count {
            return Ok(false);
        }

        let detached = {
            let mut guard = self
                .inner
                .workers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            self.inner
                .worker_count
                .store(worker_count, Ordering::Release);
            guard.take()
        };
        self.inner.counters.rebuilds.fetch_add(1, Ordering::Relaxed);

        if let Some(set) = detached {
            tracing::debug!(epoch = set.epoch, previous, worker_count, "detaching draw workers");
            // dropping the senders lets the old workers drain and exit
            drop(set);
        }
        Ok(true)
    }

    /// Stop accepting jobs, let workers drain their queues and join them
    ///
    /// Blocks until every worker has exited. Intended for host teardown,
    /// never for the presentation thread mid-frame.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        let set = self
            .inner
            .workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(set) = set {
            tracing::debug!(epoch = set.epoch, "shutting down draw workers");
            set.join();
        }
    }

    pub fn stats(&self) -> PoolStats {
        let counters = &self.inner.counters;
        PoolStats {
            jobs_submitted: counters.submitted.load(Ordering::Relaxed),
            jobs_finished: counters.finished.load(Ordering::Relaxed),
            jobs_stale: counters.stale.load(Ordering::Relaxed),
            jobs_aborted: counters.aborted.load(Ordering::Relaxed),
            rebuilds: counters.rebuilds.load(Ordering::Relaxed),
            worker_count: self.worker_count(),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::build(DEFAULT_WORKER_COUNT, DEFAULT_THREAD_NAME.to_string())
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("thread_name", &self.inner.thread_name)
            .field("worker_count", &self.worker_count())
            .field("started", &self.is_started())
            .finish()
    }
}

/// Stable worker index for a cell
fn route(key: CellKey, worker_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % worker_count.max(1) as u64) as usize
}
