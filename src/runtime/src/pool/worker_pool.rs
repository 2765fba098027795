//! WorkerPool: fixed set of tasks draining a bounded job queue.
//!
//! Each submitted job gets its own result channel, so callers await
//! individual outcomes while total concurrency stays bounded by the
//! number of workers.
//!
//! # Usage
//!
//! ```ignore
//! let pool = WorkerPool::new(4);
//! let handle = pool.submit(&cancel, async { upload().await }).await?;
//! handle.wait(&cancel).await?;
//! pool.shutdown().await;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use imgsync_core::error::{Result, SyncError};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A queued unit of work. Owns its result sender.
type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Default wait for a free queue slot before reporting `QueueFull`.
pub const DEFAULT_QUEUE_WAIT: Duration = Duration::from_secs(600);

/// Bounded pool of worker tasks.
pub struct WorkerPool {
    /// Number of workers.
    size: usize,
    /// Job queue sender; the queue holds `2 * size` jobs.
    tx: mpsc::Sender<Job>,
    /// Stops workers from picking up further jobs.
    shutdown: CancellationToken,
    /// Worker task handles, drained by `shutdown`.
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    /// Longest wait for a queue slot.
    queue_wait: Duration,
}

impl WorkerPool {
    /// Start `size` workers (at least one). Must be called inside a tokio runtime.
    pub fn new(size: usize) -> Self {
        Self::with_queue_wait(size, DEFAULT_QUEUE_WAIT)
    }

    /// Start a pool whose submissions give up with `QueueFull` after `queue_wait`.
    pub fn with_queue_wait(size: usize, queue_wait: Duration) -> Self {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel::<Job>(size * 2);
        let rx = Arc::new(Mutex::new(rx));
        let shutdown = CancellationToken::new();

        let workers = (0..size)
            .map(|id| tokio::spawn(worker_loop(id, Arc::clone(&rx), shutdown.clone())))
            .collect();

        Self {
            size,
            tx,
            shutdown,
            workers: parking_lot::Mutex::new(workers),
            queue_wait,
        }
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue `job` and return a handle to its result.
    ///
    /// Waits for a free queue slot. Fails with `Cancelled` if `cancel` fires
    /// first, `PoolShutdown` if the pool stops, or `QueueFull` once the
    /// queue wait elapses. A job whose `cancel` fires before a worker picks
    /// it up is dropped without running and reports `Cancelled`.
    pub async fn submit<F, T>(&self, cancel: &CancellationToken, job: F) -> Result<JobHandle<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(SyncError::PoolShutdown);
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(SyncError::Cancelled("job submission cancelled".to_string()));
            }
            _ = self.shutdown.cancelled() => return Err(SyncError::PoolShutdown),
            reserved = tokio::time::timeout(self.queue_wait, self.tx.reserve()) => match reserved {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(SyncError::PoolShutdown),
                Err(_) => {
                    return Err(SyncError::QueueFull(format!(
                        "no free slot among {} queued jobs after {:?}",
                        self.size * 2,
                        self.queue_wait
                    )));
                }
            },
        };

        let (result_tx, result_rx) = oneshot::channel();
        let job_cancel = cancel.clone();
        permit.send(Box::pin(async move {
            let result = if job_cancel.is_cancelled() {
                Err(SyncError::Cancelled(
                    "job cancelled before it started".to_string(),
                ))
            } else {
                job.await
            };
            // The submitter may have stopped waiting.
            let _ = result_tx.send(result);
        }));

        Ok(JobHandle { rx: result_rx })
    }

    /// Stop dispatching and wait for jobs already picked up to finish.
    ///
    /// Jobs still queued are dropped; their handles resolve to `PoolShutdown`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Worker task ended abnormally");
            }
        }
        tracing::debug!(workers = self.size, "Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    shutdown: CancellationToken,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                job = rx.recv() => job,
            }
        };

        match job {
            Some(job) => job.await,
            None => break,
        }
    }
    tracing::trace!(worker = id, "Worker exiting");
}

/// Result channel for one submitted job.
#[derive(Debug)]
pub struct JobHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> JobHandle<T> {
    /// Wait for the job's result.
    pub async fn join(self) -> Result<T> {
        self.rx.await.map_err(|_| SyncError::PoolShutdown)?
    }

    /// Wait for the job's result, giving up with `Cancelled` when `cancel` fires.
    /// The job itself keeps running if a worker already picked it up.
    pub async fn wait(self, cancel: &CancellationToken) -> Result<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled(
                "stopped waiting for job".to_string(),
            )),
            result = self.join() => result,
        }
    }
}
