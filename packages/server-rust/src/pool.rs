//! Bounded worker pool for per-event tasks.
//!
//! Caps fan-out against the bus and the remote store. Submission never
//! blocks the caller: every task is spawned immediately and then waits for
//! one of `capacity` semaphore permits, so over-capacity work queues inside
//! the runtime instead of failing. The permit is an RAII guard, released
//! when the task finishes or panics.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// Bounded-parallelism task pool with drain support.
#[derive(Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    runtime: Handle,
    capacity: usize,
}

impl WorkerPool {
    /// Creates a pool running at most `capacity` tasks at once on the
    /// current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            tracker: TaskTracker::new(),
            runtime: Handle::current(),
            capacity,
        }
    }

    /// Submits a task. Returns immediately; the task starts once a permit is free.
    pub fn submit<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let tracked = self.tracker.track_future(async move {
            // The semaphore is never closed, so acquisition only fails if it is;
            // run the task regardless rather than drop it.
            let _permit = permits.acquire_owned().await.ok();
            task.await
        });
        self.runtime.spawn(tracked)
    }

    /// Maximum number of concurrently running tasks.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of submitted tasks that have not finished yet.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Waits for every submitted task to finish. Tasks submitted after
    /// this call starts are also awaited.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
