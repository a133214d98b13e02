//! Named FIFO job queues with identity/dedup keys, delayed and bulk enqueue,
//! pausing, and bounded failure retention. Workers live in [`worker`].

pub mod job;
pub mod worker;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

pub use job::{
    Dedup, EnqueueOptions, EnqueueOutcome, FailedJob, Job, JobError, QueueName, RetryPolicy,
};

const DEFAULT_KEEP_FAILED: usize = 100;

struct DedupState {
    window_ends: Instant,
    retry_scheduled: bool,
}

#[derive(Default)]
struct QueueInner {
    pending: VecDeque<Job>,
    delayed: Vec<(Instant, Job)>,
    /// Identity keys of jobs that are pending, delayed or running.
    identities: HashSet<String>,
    dedup: HashMap<String, DedupState>,
    failed: VecDeque<FailedJob>,
    keep_failed: usize,
}

/// One named queue. Internals are guarded by a plain mutex; the lock is
/// never held across an await.
pub struct JobQueue {
    name: QueueName,
    inner: Mutex<QueueInner>,
    pause_count: AtomicUsize,
}

impl JobQueue {
    pub fn new(name: QueueName) -> Self {
        JobQueue {
            name,
            inner: Mutex::new(QueueInner {
                keep_failed: DEFAULT_KEEP_FAILED,
                ..Default::default()
            }),
            pause_count: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> QueueName {
        self.name
    }

    pub fn enqueue(&self, kind: &str, payload: Value, opts: EnqueueOptions) -> EnqueueOutcome {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("queue lock");
        if let Some(keep) = opts.keep_failed {
            inner.keep_failed = keep;
        }

        if let Some(key) = &opts.identity_key {
            if inner.identities.contains(key) {
                debug!(queue = %self.name, kind, identity = %key, "identity key held, enqueue is a no-op");
                return EnqueueOutcome::Coalesced;
            }
        }

        let mut dedup_retry = false;
        let mut delay = opts.delay;
        if let Some(dedup) = &opts.dedup {
            match inner.dedup.get_mut(&dedup.key) {
                Some(state) if now < state.window_ends => {
                    if state.retry_scheduled {
                        debug!(queue = %self.name, kind, dedup = %dedup.key, "dedup retry already scheduled, dropping trigger");
                        return EnqueueOutcome::Coalesced;
                    }
                    state.retry_scheduled = true;
                    dedup_retry = true;
                    delay = Some(state.window_ends.saturating_duration_since(now));
                }
                _ => {
                    inner.dedup.insert(
                        dedup.key.clone(),
                        DedupState { window_ends: now + dedup.window, retry_scheduled: false },
                    );
                }
            }
        }

        let job = Job {
            id: Uuid::new_v4(),
            queue: self.name,
            kind: kind.to_string(),
            payload,
            attempts_made: 0,
            enqueued_at: Utc::now(),
            identity_key: opts.identity_key,
            dedup_key: opts.dedup.map(|d| d.key),
            dedup_retry,
            retry: opts.retry,
        };
        if let Some(key) = &job.identity_key {
            inner.identities.insert(key.clone());
        }
        match delay {
            Some(delay) => {
                inner.delayed.push((now + delay, job));
                if dedup_retry {
                    EnqueueOutcome::RetryScheduled
                } else {
                    EnqueueOutcome::Delayed
                }
            }
            None => {
                inner.pending.push_back(job);
                EnqueueOutcome::Queued
            }
        }
    }

    /// Atomic batch insert; used to fan one decision out into thousands of
    /// per-user jobs without interleaving.
    pub fn enqueue_many(&self, kind: &str, payloads: Vec<Value>, retry: RetryPolicy) -> usize {
        let mut inner = self.inner.lock().expect("queue lock");
        let count = payloads.len();
        for payload in payloads {
            inner.pending.push_back(Job {
                id: Uuid::new_v4(),
                queue: self.name,
                kind: kind.to_string(),
                payload,
                attempts_made: 0,
                enqueued_at: Utc::now(),
                identity_key: None,
                dedup_key: None,
                dedup_retry: false,
                retry: retry.clone(),
            });
        }
        count
    }

    /// Pauses the queue until the returned guard drops. In-flight jobs
    /// finish; no new job is handed to a worker while any guard is alive.
    pub fn pause(&self) -> PauseGuard<'_> {
        self.pause_count.fetch_add(1, Ordering::SeqCst);
        debug!(queue = %self.name, "queue paused");
        PauseGuard { queue: self }
    }

    pub fn is_paused(&self) -> bool {
        self.pause_count.load(Ordering::SeqCst) > 0
    }

    /// Hands out the next runnable job, promoting due delayed jobs first.
    /// Returns `None` while paused or empty.
    pub(crate) fn try_pop(&self) -> Option<Job> {
        if self.is_paused() {
            return None;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("queue lock");
        self.promote_due(&mut inner, now);
        inner.pending.pop_front()
    }

    fn promote_due(&self, inner: &mut QueueInner, now: Instant) {
        if inner.delayed.is_empty() {
            return;
        }
        let mut still_delayed = Vec::with_capacity(inner.delayed.len());
        let mut due: Vec<(Instant, Job)> = Vec::new();
        for entry in inner.delayed.drain(..) {
            if entry.0 <= now {
                due.push(entry);
            } else {
                still_delayed.push(entry);
            }
        }
        inner.delayed = still_delayed;
        due.sort_by_key(|(ready_at, _)| *ready_at);
        for (_, job) in due {
            if job.dedup_retry {
                // The window is over once its retry runs; later triggers
                // open a fresh window.
                if let Some(key) = &job.dedup_key {
                    inner.dedup.remove(key);
                }
            }
            inner.pending.push_back(job);
        }
    }

    /// Releases the job's identity key after a success or terminal failure.
    pub(crate) fn finish(&self, job: &Job) {
        let mut inner = self.inner.lock().expect("queue lock");
        if let Some(key) = &job.identity_key {
            inner.identities.remove(key);
        }
    }

    /// Re-queues a recoverable failure for a later attempt. The identity key
    /// stays held so duplicates keep coalescing while the job retries.
    pub(crate) fn requeue_for_retry(&self, mut job: Job, delay: Duration) {
        job.attempts_made += 1;
        let mut inner = self.inner.lock().expect("queue lock");
        inner.delayed.push((Instant::now() + delay, job));
    }

    pub(crate) fn record_failure(&self, job: Job, error: String) {
        let mut inner = self.inner.lock().expect("queue lock");
        if let Some(key) = &job.identity_key {
            inner.identities.remove(key);
        }
        let keep = inner.keep_failed;
        inner.failed.push_back(FailedJob { job, error, failed_at: Utc::now() });
        while inner.failed.len() > keep {
            inner.failed.pop_front();
        }
    }

    /// Terminal failures retained for inspection, oldest first.
    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        self.inner.lock().expect("queue lock").failed.iter().cloned().collect()
    }

    /// Jobs waiting or delayed (excludes running jobs).
    pub fn depth(&self) -> usize {
        let inner = self.inner.lock().expect("queue lock");
        inner.pending.len() + inner.delayed.len()
    }
}

/// The fixed set of queues the orchestration engine runs on.
pub struct QueueSet {
    queues: HashMap<QueueName, std::sync::Arc<JobQueue>>,
}

impl Default for QueueSet {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueSet {
    pub fn new() -> Self {
        let queues = QueueName::ALL
            .iter()
            .map(|name| (*name, std::sync::Arc::new(JobQueue::new(*name))))
            .collect();
        QueueSet { queues }
    }

    pub fn get(&self, name: QueueName) -> std::sync::Arc<JobQueue> {
        std::sync::Arc::clone(&self.queues[&name])
    }
}

pub struct PauseGuard<'a> {
    queue: &'a JobQueue,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.queue.pause_count.fetch_sub(1, Ordering::SeqCst);
        debug!(queue = %self.queue.name, "queue resumed");
    }
}
