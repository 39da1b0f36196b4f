//! Worker offload for the rill streaming runtime: a pool of OS worker
//! threads behind the [`TaskRunner`] seam, capped at the machine's
//! concurrency, with seize semantics for callers that need a dedicated
//! worker.

use crossbeam::channel::{self, Sender};
use derive_more::{Display, Error};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Display, Error)]
pub enum PoolError {
    #[display(fmt = "worker pool is finalized")]
    Finalized,
    #[display(fmt = "worker task failed: {}", _0)]
    Task(#[error(ignore)] String),
    #[display(fmt = "worker disappeared before responding")]
    WorkerGone,
    #[display(fmt = "failed to spawn worker: {}", _0)]
    Spawn(#[error(ignore)] String),
}

/// The seam the coroutine operator talks to. The thread-backed
/// [`WorkerPool`] is the production implementation, [`InProcessRunner`]
/// the in-process backend for unit tests.
pub trait TaskRunner: Send + Sync {
    type In: Send + 'static;
    type Out: Send + 'static;

    fn run(&self, input: Self::In) -> BoxFuture<'static, Result<Self::Out, PoolError>>;
}

type TaskFn<In, Out> = Arc<dyn Fn(In) -> anyhow::Result<Out> + Send + Sync>;

struct Job<In, Out> {
    id: u64,
    input: In,
    respond: oneshot::Sender<Result<Out, PoolError>>,
}

struct Worker<In, Out> {
    id: u64,
    tasks: Sender<Job<In, Out>>,
}

struct PoolState<In, Out> {
    idle: Vec<Worker<In, Out>>,
    waiting: VecDeque<oneshot::Sender<Worker<In, Out>>>,
    spawned: usize,
    finalized: bool,
}

struct PoolInner<In, Out> {
    task_fn: TaskFn<In, Out>,
    capacity: usize,
    state: Mutex<PoolState<In, Out>>,
    next_worker_id: AtomicU64,
    next_task_id: AtomicU64,
}

/// Pool of isolated worker threads, spawned lazily up to the capacity.
/// Tasks queue once every worker is busy; each task gets a fresh id and a
/// worker that is returned to the pool whatever the outcome.
pub struct WorkerPool<In, Out> {
    inner: Arc<PoolInner<In, Out>>,
}

impl<In, Out> Clone for WorkerPool<In, Out> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

enum Checkout<In, Out> {
    Ready(Worker<In, Out>),
    Spawn,
    Wait(oneshot::Receiver<Worker<In, Out>>),
    Refused,
}

impl<In: Send + 'static, Out: Send + 'static> WorkerPool<In, Out> {
    /// Capacity defaults to the machine's concurrency, with a floor of
    /// [`DEFAULT_CONCURRENCY`] workers when it cannot be determined.
    pub fn new(task_fn: impl Fn(In) -> anyhow::Result<Out> + Send + Sync + 'static) -> Self {
        let capacity = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(DEFAULT_CONCURRENCY);
        Self::with_concurrency(capacity, task_fn)
    }

    pub fn with_concurrency(
        capacity: usize,
        task_fn: impl Fn(In) -> anyhow::Result<Out> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                task_fn: Arc::new(task_fn),
                capacity: capacity.max(1),
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    waiting: VecDeque::new(),
                    spawned: 0,
                    finalized: false,
                }),
                next_worker_id: AtomicU64::new(0),
                next_task_id: AtomicU64::new(0),
            }),
        }
    }

    /// Run one task on the next available worker.
    pub async fn process(&self, input: In) -> Result<Out, PoolError> {
        let worker = checkout(&self.inner).await?;
        let result = run_on(&self.inner, &worker, input).await;
        checkin(&self.inner, worker);
        result
    }

    /// Dedicate one worker to the caller until the guard is released.
    pub async fn seize(&self) -> Result<SeizedWorker<In, Out>, PoolError> {
        let worker = checkout(&self.inner).await?;
        Ok(SeizedWorker {
            inner: self.inner.clone(),
            worker: Some(worker),
        })
    }

    /// Terminate all idle workers and refuse new tasks; busy workers are
    /// terminated as soon as their current task finishes.
    pub fn finalize(&self) {
        let (idle, waiting) = {
            let mut state = self.inner.state.lock();
            state.finalized = true;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiting),
            )
        };
        debug!(workers = idle.len(), "finalizing worker pool");
        // dropping the task senders ends the worker threads; dropping the
        // waiters rejects queued checkouts
        drop(idle);
        drop(waiting);
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

async fn checkout<In: Send + 'static, Out: Send + 'static>(
    inner: &Arc<PoolInner<In, Out>>,
) -> Result<Worker<In, Out>, PoolError> {
    let action = {
        let mut state = inner.state.lock();
        if state.finalized {
            Checkout::Refused
        } else if let Some(worker) = state.idle.pop() {
            Checkout::Ready(worker)
        } else if state.spawned < inner.capacity {
            state.spawned += 1;
            Checkout::Spawn
        } else {
            let (tx, rx) = oneshot::channel();
            state.waiting.push_back(tx);
            Checkout::Wait(rx)
        }
    };
    match action {
        Checkout::Ready(worker) => Ok(worker),
        Checkout::Spawn => match spawn_worker(inner) {
            Ok(worker) => Ok(worker),
            Err(err) => {
                inner.state.lock().spawned -= 1;
                Err(err)
            }
        },
        Checkout::Wait(rx) => rx.await.map_err(|_| PoolError::Finalized),
        Checkout::Refused => Err(PoolError::Finalized),
    }
}

fn checkin<In, Out>(inner: &Arc<PoolInner<In, Out>>, worker: Worker<In, Out>) {
    let mut worker = worker;
    loop {
        let waiter = {
            let mut state = inner.state.lock();
            if state.finalized {
                // terminated instead of returned
                state.spawned -= 1;
                return;
            }
            match state.waiting.pop_front() {
                Some(waiter) => waiter,
                None => {
                    state.idle.push(worker);
                    return;
                }
            }
        };
        match waiter.send(worker) {
            Ok(()) => return,
            // the waiter gave up; try the next one
            Err(returned) => worker = returned,
        }
    }
}

async fn run_on<In: Send + 'static, Out: Send + 'static>(
    inner: &Arc<PoolInner<In, Out>>,
    worker: &Worker<In, Out>,
    input: In,
) -> Result<Out, PoolError> {
    let id = inner.next_task_id.fetch_add(1, Ordering::Relaxed);
    trace!(task = id, worker = worker.id, "dispatching task");
    let (tx, rx) = oneshot::channel();
    if worker
        .tasks
        .send(Job {
            id,
            input,
            respond: tx,
        })
        .is_err()
    {
        warn!(worker = worker.id, "worker channel closed");
        return Err(PoolError::WorkerGone);
    }
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(PoolError::WorkerGone),
    }
}

fn spawn_worker<In: Send + 'static, Out: Send + 'static>(
    inner: &Arc<PoolInner<In, Out>>,
) -> Result<Worker<In, Out>, PoolError> {
    let id = inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = channel::unbounded::<Job<In, Out>>();
    let task_fn = inner.task_fn.clone();
    thread::Builder::new()
        .name(format!("rill-pool-{}", id))
        .spawn(move || {
            for job in rx.iter() {
                trace!(task = job.id, worker = id, "running task");
                let result =
                    (task_fn)(job.input).map_err(|err| PoolError::Task(format!("{:#}", err)));
                if job.respond.send(result).is_err() {
                    debug!(task = job.id, "task response dropped");
                }
            }
            debug!(worker = id, "worker thread exiting");
        })
        .map_err(|err| PoolError::Spawn(err.to_string()))?;
    Ok(Worker { id, tasks: tx })
}

impl<In: Send + 'static, Out: Send + 'static> TaskRunner for WorkerPool<In, Out> {
    type In = In;
    type Out = Out;

    fn run(&self, input: In) -> BoxFuture<'static, Result<Out, PoolError>> {
        let pool = self.clone();
        async move { pool.process(input).await }.boxed()
    }
}

/// Guard for a dedicated worker; dropped or released, the worker returns
/// to the pool.
pub struct SeizedWorker<In, Out> {
    inner: Arc<PoolInner<In, Out>>,
    worker: Option<Worker<In, Out>>,
}

impl<In: Send + 'static, Out: Send + 'static> SeizedWorker<In, Out> {
    pub async fn process(&self, input: In) -> Result<Out, PoolError> {
        match self.worker.as_ref() {
            Some(worker) => run_on(&self.inner, worker, input).await,
            None => Err(PoolError::WorkerGone),
        }
    }

    pub fn release(mut self) {
        if let Some(worker) = self.worker.take() {
            checkin(&self.inner, worker);
        }
    }
}

impl<In, Out> Drop for SeizedWorker<In, Out> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            checkin(&self.inner, worker);
        }
    }
}

/// Runs tasks inline on the calling task; the unit-test backend.
pub struct InProcessRunner<In, Out> {
    task_fn: TaskFn<In, Out>,
}

impl<In: Send + 'static, Out: Send + 'static> InProcessRunner<In, Out> {
    pub fn new(task_fn: impl Fn(In) -> anyhow::Result<Out> + Send + Sync + 'static) -> Self {
        Self {
            task_fn: Arc::new(task_fn),
        }
    }
}

impl<In: Send + 'static, Out: Send + 'static> TaskRunner for InProcessRunner<In, Out> {
    type In = In;
    type Out = Out;

    fn run(&self, input: In) -> BoxFuture<'static, Result<Out, PoolError>> {
        let task_fn = self.task_fn.clone();
        async move { (task_fn)(input).map_err(|err| PoolError::Task(format!("{:#}", err))) }
            .boxed()
    }
}
