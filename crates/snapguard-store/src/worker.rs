//! Bounded worker pool for blocking ingestion and restore jobs.
//!
//! At most `size` jobs run at once, each on tokio's blocking pool. Jobs get a
//! cancellation token and are expected to check it between units of work.

use crate::error::{StoreError, StoreResult};
use std::io;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Fixed-size pool with a shared shutdown token.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Pool running at most `size` jobs concurrently.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            shutdown: CancellationToken::new(),
        }
    }

    /// Maximum concurrent jobs.
    pub fn size(&self) -> usize {
        self.size
    }

    /// A token cancelled by either the caller or pool shutdown.
    pub fn job_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// True once [`WorkerPool::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run every job and return their results in submission order.
    ///
    /// Submission waits for a free slot. Jobs not yet started when `token` is
    /// cancelled are skipped and report `Cancelled`; running jobs see the
    /// cancellation through their token.
    pub async fn run_all<T, F>(&self, jobs: Vec<F>, token: &CancellationToken) -> Vec<StoreResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> StoreResult<T> + Send + 'static,
    {
        let total = jobs.len();
        let mut handles = Vec::with_capacity(total);
        for job in jobs {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                permit = self.permits.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                handles.push(None);
                continue;
            };
            let job_token = token.clone();
            handles.push(Some(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                job(job_token)
            })));
        }

        let mut results = Vec::with_capacity(total);
        for handle in handles {
            let result = match handle {
                None => Err(StoreError::Cancelled),
                Some(handle) => match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(error = %e, "worker job panicked");
                        Err(StoreError::Io(io::Error::other(format!("worker job failed: {e}"))))
                    }
                },
            };
            results.push(result);
        }
        debug!(jobs = total, workers = self.size, "worker batch complete");
        results
    }

    /// Cancel outstanding work and wait for running jobs to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Ok(all) = self.permits.acquire_many(self.size as u32).await {
            all.forget();
        }
        self.permits.close();
        debug!("worker pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_in_submission_order() {
        let pool = WorkerPool::new(3);
        let jobs: Vec<_> = (0..10u64)
            .map(|i| {
                move |_t: CancellationToken| {
                    std::thread::sleep(Duration::from_millis(10 - i));
                    Ok(i)
                }
            })
            .collect();
        let results = pool.run_all(jobs, &pool.job_token()).await;
        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let jobs: Vec<_> = (0..8)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                move |_t: CancellationToken| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .collect();
        for r in pool.run_all(jobs, &pool.job_token()).await {
            r.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancelled_jobs_are_skipped() {
        let pool = WorkerPool::new(1);
        let token = pool.job_token();
        token.cancel();
        let jobs: Vec<_> = (0..3).map(|_| |_t: CancellationToken| Ok(1)).collect();
        let results = pool.run_all(jobs, &token).await;
        assert!(results.iter().all(|r| matches!(r, Err(StoreError::Cancelled))));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_job_tokens() {
        let pool = WorkerPool::new(2);
        let token = pool.job_token();
        pool.shutdown().await;
        assert!(token.is_cancelled());
        assert!(pool.is_shut_down());
    }

    #[tokio::test]
    async fn test_job_error_is_returned() {
        let pool = WorkerPool::new(2);
        let jobs: Vec<Box<dyn FnOnce(CancellationToken) -> StoreResult<u8> + Send>> = vec![
            Box::new(|_| Ok(1)),
            Box::new(|_| Err(StoreError::Cancelled)),
        ];
        let results = pool.run_all(jobs, &pool.job_token()).await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
