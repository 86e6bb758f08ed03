//! Bounded worker pool for run walks and retry continuations.
//!
//! Jobs are tokio tasks gated by a semaphore, so at most `size` jobs make
//! progress at once. Delayed jobs sleep without holding a permit and only
//! queue for one once their timer fires.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::warn;

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            tracker: TaskTracker::new(),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of submitted jobs that have not finished, including delayed
    /// jobs still waiting on their timer.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Run `job` as soon as a worker is free.
    pub fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        self.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!("Worker pool closed, dropping job");
                return;
            };
            job.await;
        });
    }

    /// Run `job` on a worker once `delay` has elapsed.
    pub fn submit_after<F>(&self, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        self.tracker.spawn(async move {
            tokio::time::sleep(delay).await;
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!("Worker pool closed, dropping delayed job");
                return;
            };
            job.await;
        });
    }

    /// Wait until every submitted job, delayed ones included, has finished.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
