//! A fixed-size worker pool for batched jobs.

use std::fmt::{self, Debug, Display, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_queue::SegQueue;
use futures::future::join_all;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

use crate::error::{panic_message, JobError};
use crate::job::{JobCompleter, JobDependency, JobHandle, JobResult};

type QueuedJob = Box<dyn FnOnce() + Send + 'static>;

struct ExecutorInner {
    pool: ThreadPool,
    queue: SegQueue<QueuedJob>,
    shutdown: AtomicBool,
}

impl ExecutorInner {
    /// Run one queued job. Each enqueue spawns exactly one of these.
    fn run_one(&self) {
        if let Some(job) = self.queue.pop() {
            if self.shutdown.load(Ordering::Acquire) {
                // Dropping the job resolves its handle as cancelled.
                return;
            }

            job();
        }
    }
}

/// Executes jobs on a fixed pool of worker threads.
///
/// Jobs wait in a queue until a worker is free. A job which panics or fails
/// resolves its handle with an error; the worker carries on.
///
/// Cloning the executor produces another handle onto the same pool.
#[derive(Clone)]
pub struct JobExecutor {
    inner: Arc<ExecutorInner>,
}

impl JobExecutor {
    /// Start an executor with `worker_threads` workers (at least one).
    pub fn new(worker_threads: usize) -> Result<JobExecutor, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(worker_threads.max(1))
            .thread_name(|idx| format!("stepped-worker-{}", idx))
            .build()?;
        log::debug!("started job executor with {} workers", pool.current_num_threads());

        Ok(JobExecutor {
            inner: Arc::new(ExecutorInner {
                pool,
                queue: SegQueue::new(),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// Get the number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.inner.pool.current_num_threads()
    }

    /// Get the number of jobs waiting for a worker.
    pub fn pending_jobs(&self) -> usize {
        self.inner.queue.len()
    }

    /// Returns true once `shutdown` has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting jobs and drop every queued job.
    ///
    /// Jobs already running finish; queued and future jobs resolve with
    /// `JobError::Cancelled`.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);

        let mut dropped = 0;
        while self.inner.queue.pop().is_some() {
            dropped += 1;
        }
        log::debug!("job executor shut down, dropped {} pending jobs", dropped);
    }

    fn enqueue(&self, job: QueuedJob) {
        if self.is_shut_down() {
            return;
        }

        self.inner.queue.push(job);
        let inner = self.inner.clone();
        self.inner.pool.spawn(move || inner.run_one());
    }

    /// Queue a job and return a handle to its result.
    pub fn schedule<T, F>(&self, job: F) -> JobHandle<T>
        where T: Send + 'static,
              F: FnOnce() -> T + Send + 'static,
    {
        self.schedule_fallible(move || Ok::<T, std::convert::Infallible>(job()))
    }

    /// Queue a job which may fail; an `Err` resolves the handle with
    /// `JobError::Failed`.
    pub fn schedule_fallible<T, E, F>(&self, job: F) -> JobHandle<T>
        where T: Send + 'static,
              E: Display,
              F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let (handle, completer) = JobHandle::new();
        self.enqueue(Box::new(move || {
            let result = match catch_unwind(AssertUnwindSafe(job)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(JobError::Failed(err.to_string())),
                Err(payload) => Err(JobError::Panicked(panic_message(&*payload))),
            };

            if let Err(err) = &result {
                log::warn!("{}", err);
            }
            completer.complete(result);
        }));
        handle
    }

    /// Queue a job which starts only after every dependency has finished.
    ///
    /// This suspends the calling task, not a worker, until the dependencies
    /// resolve. Dependencies which failed still count as finished.
    pub async fn schedule_with_dependencies<T, F>(&self, dependencies: Vec<JobDependency>, job: F) -> JobHandle<T>
        where T: Send + 'static,
              F: FnOnce() -> T + Send + 'static,
    {
        join_all(dependencies.into_iter().map(JobDependency::wait)).await;
        self.schedule(job)
    }

    /// Run `op` over every item, split into contiguous batches of
    /// `batch_size`, one job per batch.
    ///
    /// The handle resolves once every batch has run. If any batch panics the
    /// handle carries the first panic; the other batches still run. A batch
    /// size of zero is treated as one.
    pub fn schedule_parallel<T, F>(&self, items: Vec<T>, batch_size: usize, op: F) -> JobHandle<()>
        where T: Send + Sync + 'static,
              F: Fn(&T) + Send + Sync + 'static,
    {
        if items.is_empty() {
            return JobHandle::completed(Ok(()));
        }

        let batch_size = batch_size.max(1);
        let len = items.len();
        let batches = (len + batch_size - 1) / batch_size;

        let (handle, completer) = JobHandle::new();
        let items = Arc::new(items);
        let op = Arc::new(op);
        let group = Arc::new(BatchGroup::new(batches, completer));

        for batch in 0..batches {
            let start = batch * batch_size;
            let end = (start + batch_size).min(len);
            let items = items.clone();
            let op = op.clone();
            let group = group.clone();

            self.enqueue(Box::new(move || {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    items[start..end].iter().for_each(|item| (*op)(item));
                }));
                if let Err(payload) = result {
                    group.fail(JobError::Panicked(panic_message(&*payload)));
                }
                group.finish_one();
            }));
        }

        handle
    }

    /// Run `op` over borrowed items on the worker pool, blocking until every
    /// batch is done.
    ///
    /// Unlike `schedule_parallel` the items need not be `'static`. A panic in
    /// `op` is propagated to the caller once all batches have finished.
    pub fn for_each_batch<T, F>(&self, items: &[T], batch_size: usize, op: F)
        where T: Sync,
              F: Fn(&T) + Sync,
    {
        let batch_size = batch_size.max(1);
        let op = &op;
        self.inner.pool.scope(|scope| {
            for chunk in items.chunks(batch_size) {
                scope.spawn(move |_| chunk.iter().for_each(op));
            }
        });
    }
}

impl Debug for JobExecutor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobExecutor")
            .field("workers", &self.worker_count())
            .field("pending", &self.pending_jobs())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Tracks the batches of one `schedule_parallel` call.
///
/// If the executor drops some batches, the group is dropped unresolved
/// and the completer reports cancellation.
struct BatchGroup {
    remaining: AtomicUsize,
    failure: Mutex<Option<JobError>>,
    completer: Mutex<Option<JobCompleter<()>>>,
}

impl BatchGroup {
    fn new(batches: usize, completer: JobCompleter<()>) -> BatchGroup {
        BatchGroup {
            remaining: AtomicUsize::new(batches),
            failure: Mutex::new(None),
            completer: Mutex::new(Some(completer)),
        }
    }

    fn fail(&self, err: JobError) {
        log::warn!("{}", err);
        self.failure.lock().unwrap().get_or_insert(err);
    }

    fn finish_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let result: JobResult<()> = match self.failure.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        if let Some(completer) = self.completer.lock().unwrap().take() {
            completer.complete(result);
        }
    }
}
