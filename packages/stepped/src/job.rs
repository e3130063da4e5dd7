//! Job completion handles.

use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};

use crate::error::JobError;

/// The outcome of a job.
pub type JobResult<T> = Result<T, JobError>;

/// A handle to a job's eventual result.
///
/// `complete` suspends until the job has run; `is_completed` polls without
/// blocking. Dropping the handle does not cancel the job.
pub struct JobHandle<T> {
    result: oneshot::Receiver<JobResult<T>>,
    dependency: JobDependency,
    taken: bool,
}

impl<T> JobHandle<T> {
    /// Create a handle and the completer which resolves it.
    pub(crate) fn new() -> (JobHandle<T>, JobCompleter<T>) {
        let (result_tx, result) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let finished = Arc::new(AtomicBool::new(false));

        let handle = JobHandle {
            result,
            dependency: JobDependency {
                finished: finished.clone(),
                signal: done_rx.shared(),
            },
            taken: false,
        };
        let completer = JobCompleter {
            channels: Some((result_tx, done_tx)),
            finished,
        };
        (handle, completer)
    }

    /// Create a handle which has already resolved.
    pub fn completed(result: JobResult<T>) -> JobHandle<T> {
        let (handle, completer) = JobHandle::new();
        completer.complete(result);
        handle
    }

    /// Returns true once the job has produced its result.
    pub fn is_completed(&self) -> bool {
        self.dependency.is_completed()
    }

    /// Get a dependency token other jobs can wait on.
    pub fn dependency(&self) -> JobDependency {
        self.dependency.clone()
    }

    /// Wait for the job to finish and return its result.
    pub async fn complete(self) -> JobResult<T> {
        self.result.await.unwrap_or(Err(JobError::Cancelled))
    }

    /// Block the current thread until the job finishes.
    ///
    /// Must not be called from inside an async task; use `complete` there.
    pub fn wait(self) -> JobResult<T> {
        futures::executor::block_on(self.complete())
    }

    /// Take the result if it is ready, without blocking.
    ///
    /// Returns `None` while the job is pending and after the result has been
    /// taken. Once taken, `complete` and `wait` report `JobError::Cancelled`.
    pub fn try_take(&mut self) -> Option<JobResult<T>> {
        if self.taken {
            return None;
        }

        let result = match self.result.try_recv() {
            Ok(result) => result?,
            Err(_) => Err(JobError::Cancelled),
        };
        self.taken = true;
        Some(result)
    }
}

impl<T> Debug for JobHandle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// A cloneable, type-erased token which resolves when a job finishes,
/// whatever its outcome.
#[derive(Clone)]
pub struct JobDependency {
    finished: Arc<AtomicBool>,
    signal: Shared<oneshot::Receiver<()>>,
}

impl JobDependency {
    /// Returns true once the job has finished.
    pub fn is_completed(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Wait for the job to finish.
    pub async fn wait(self) {
        // A dropped sender also means the job will never run.
        let _ = self.signal.await;
    }
}

impl Debug for JobDependency {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDependency")
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// The sending half of a `JobHandle`.
///
/// Dropping a completer without calling `complete` resolves the handle
/// with `JobError::Cancelled`.
pub(crate) struct JobCompleter<T> {
    channels: Option<(oneshot::Sender<JobResult<T>>, oneshot::Sender<()>)>,
    finished: Arc<AtomicBool>,
}

impl<T> JobCompleter<T> {
    /// Resolve the handle.
    pub fn complete(mut self, result: JobResult<T>) {
        self.resolve(result);
    }

    fn resolve(&mut self, result: JobResult<T>) {
        if let Some((result_tx, done_tx)) = self.channels.take() {
            // The handle may have been dropped; nobody is waiting then.
            let _ = result_tx.send(result);
            self.finished.store(true, Ordering::Release);
            let _ = done_tx.send(());
        }
    }
}

impl<T> Drop for JobCompleter<T> {
    fn drop(&mut self) {
        self.resolve(Err(JobError::Cancelled));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_complete() {
        let (handle, completer) = JobHandle::new();
        let dependency = handle.dependency();
        assert!(!handle.is_completed());

        completer.complete(Ok(7));
        assert!(handle.is_completed());
        assert!(dependency.is_completed());
        assert_eq!(handle.wait(), Ok(7));
    }

    #[test]
    fn test_dropped_completer_cancels() {
        let (mut handle, completer) = JobHandle::<u32>::new();
        assert_eq!(handle.try_take(), None);

        drop(completer);
        assert!(handle.is_completed());
        assert_eq!(handle.try_take(), Some(Err(JobError::Cancelled)));
    }

    #[test]
    fn test_dependency_resolves() {
        let (handle, completer) = JobHandle::<u32>::new();
        let dependency = handle.dependency();
        completer.complete(Err(JobError::Failed("nope".into())));

        futures::executor::block_on(dependency.wait());
        assert_eq!(handle.wait(), Err(JobError::Failed("nope".into())));
    }

    #[test]
    fn test_take_once() {
        let (mut handle, completer) = JobHandle::new();
        completer.complete(Ok(3u8));

        assert_eq!(handle.try_take(), Some(Ok(3)));
        assert_eq!(handle.try_take(), None);
        assert!(handle.is_completed());
    }

    #[test]
    fn test_already_completed() {
        let handle = JobHandle::completed(Ok("done"));
        assert!(handle.is_completed());
        assert_eq!(handle.wait(), Ok("done"));
    }
}
