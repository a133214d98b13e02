//! Per-queue worker pools. A worker pulls a job, runs its handler, and
//! reports the outcome back to the queue for retry bookkeeping. Handler
//! failures and panics are contained at this boundary; they never take the
//! pool down.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{Job, JobError, JobQueue};

/// Pull cadence while the queue is empty or paused; also bounds how late a
/// delayed job can be promoted.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Maximum random jitter added to a retry backoff.
const RETRY_JITTER_MS: u64 = 250;

/// A job handler. Must tolerate at-least-once execution of the same logical
/// job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn process(&self, job: &Job) -> Result<(), JobError>;
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `concurrency` workers over the queue.
    pub fn start(queue: Arc<JobQueue>, handler: Arc<dyn JobHandler>, concurrency: usize) -> Self {
        let handles = (0..concurrency.max(1))
            .map(|_| {
                let queue = Arc::clone(&queue);
                let handler = Arc::clone(&handler);
                tokio::spawn(run_worker(queue, handler))
            })
            .collect();
        WorkerPool { handles }
    }

    pub fn shutdown(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_worker(queue: Arc<JobQueue>, handler: Arc<dyn JobHandler>) {
    loop {
        let Some(job) = queue.try_pop() else {
            tokio::time::sleep(IDLE_POLL).await;
            continue;
        };
        execute(&queue, handler.as_ref(), job).await;
    }
}

async fn execute(queue: &JobQueue, handler: &dyn JobHandler, job: Job) {
    let attempt = job.attempts_made + 1;
    debug!(queue = %queue.name(), kind = %job.kind, job_id = %job.id, attempt, "executing job");

    let outcome = AssertUnwindSafe(handler.process(&job)).catch_unwind().await;
    match outcome {
        Ok(Ok(())) => {
            queue.finish(&job);
        }
        Ok(Err(JobError::Recoverable(message))) => {
            if attempt < job.retry.max_attempts {
                let delay = job.retry.backoff(attempt) + jitter();
                warn!(
                    queue = %queue.name(), kind = %job.kind, job_id = %job.id,
                    attempt, delay_ms = delay.as_millis() as u64, %message,
                    "job failed, retrying"
                );
                queue.requeue_for_retry(job, delay);
            } else {
                error!(
                    queue = %queue.name(), kind = %job.kind, job_id = %job.id,
                    attempt, %message, "job failed, attempts exhausted"
                );
                queue.record_failure(job, message);
            }
        }
        Ok(Err(JobError::Terminal(message))) => {
            error!(
                queue = %queue.name(), kind = %job.kind, job_id = %job.id,
                payload = %job.payload, %message, "job failed terminally"
            );
            queue.record_failure(job, message);
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            error!(
                queue = %queue.name(), kind = %job.kind, job_id = %job.id,
                payload = %job.payload, %message, "job handler panicked"
            );
            queue.record_failure(job, message);
        }
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::rng().random_range(0..RETRY_JITTER_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EnqueueOptions, QueueName, RetryPolicy};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn process(&self, _job: &Job) -> Result<(), JobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(JobError::Recoverable("transient".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl JobHandler for PanickingHandler {
        async fn process(&self, _job: &Job) -> Result<(), JobError> {
            panic!("boom");
        }
    }

    async fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..(deadline_ms / 10) {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn recoverable_failures_are_retried_to_success() {
        let queue = Arc::new(JobQueue::new(QueueName::UserJobs));
        let handler = Arc::new(CountingHandler { calls: AtomicUsize::new(0), fail_first: 2 });
        let _pool = WorkerPool::start(Arc::clone(&queue), handler.clone(), 2);

        queue.enqueue(
            "flaky",
            json!({}),
            EnqueueOptions {
                retry: RetryPolicy { max_attempts: 3, backoff_base: Duration::from_millis(10) },
                ..Default::default()
            },
        );
        assert!(
            wait_until(5_000, || handler.calls.load(Ordering::SeqCst) == 3).await,
            "expected exactly three attempts"
        );
        assert!(queue.failed_jobs().is_empty());
    }

    #[tokio::test]
    async fn attempts_are_bounded_and_failure_is_retained() {
        let queue = Arc::new(JobQueue::new(QueueName::UserJobs));
        let handler = Arc::new(CountingHandler { calls: AtomicUsize::new(0), fail_first: usize::MAX });
        let _pool = WorkerPool::start(Arc::clone(&queue), handler.clone(), 1);

        queue.enqueue(
            "always-failing",
            json!({}),
            EnqueueOptions {
                retry: RetryPolicy { max_attempts: 2, backoff_base: Duration::from_millis(10) },
                ..Default::default()
            },
        );
        assert!(wait_until(5_000, || queue.failed_jobs().len() == 1).await);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn handler_panic_does_not_kill_the_pool() {
        let queue = Arc::new(JobQueue::new(QueueName::UserJobs));
        let _pool = WorkerPool::start(Arc::clone(&queue), Arc::new(PanickingHandler), 1);

        queue.enqueue("panicking", json!({}), EnqueueOptions::default());
        assert!(wait_until(5_000, || queue.failed_jobs().len() == 1).await);
        assert_eq!(queue.failed_jobs()[0].error, "boom");

        // The same worker still serves the next job.
        queue.enqueue("panicking", json!({}), EnqueueOptions::default());
        assert!(wait_until(5_000, || queue.failed_jobs().len() == 2).await);
    }
}
