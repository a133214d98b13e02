//! Recurring trigger scheduler. Each task owns a single-flight guard: a tick
//! that lands while the previous run is still in flight logs and returns, it
//! is not queued or retried. One live process owns a given task; there is no
//! cross-process coordination.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::queue::{EnqueueOptions, JobQueue};

/// Typed identifiers for every recurring task in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskId {
    NodeHealthCheck,
    RecordUserUsage,
    RecordOutboundUsage,
    ReviewUsers,
    ResetRollingTraffic,
    ResetCalendarTraffic,
    ResetNodeTraffic,
    NotifyThresholds,
}

impl TaskId {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskId::NodeHealthCheck => "node-health-check",
            TaskId::RecordUserUsage => "record-user-usage",
            TaskId::RecordOutboundUsage => "record-outbound-usage",
            TaskId::ReviewUsers => "review-users",
            TaskId::ResetRollingTraffic => "reset-rolling-traffic",
            TaskId::ResetCalendarTraffic => "reset-calendar-traffic",
            TaskId::ResetNodeTraffic => "reset-node-traffic",
            TaskId::NotifyThresholds => "notify-thresholds",
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

enum TaskAction {
    Inline(TaskFn),
    Enqueue {
        queue: Arc<JobQueue>,
        kind: &'static str,
        payload: Value,
        options: fn() -> EnqueueOptions,
    },
}

struct ScheduledTask {
    id: TaskId,
    every: Duration,
    action: TaskAction,
}

/// Releases the task's single-flight flag on every exit path, including
/// unwinds.
struct FlightGuard {
    flag: Arc<AtomicBool>,
}

impl FlightGuard {
    fn try_acquire(flag: &Arc<AtomicBool>) -> Option<FlightGuard> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { flag: Arc::clone(flag) })
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    tasks: Vec<ScheduledTask>,
    guards: Arc<DashMap<TaskId, Arc<AtomicBool>>>,
    handles: Vec<JoinHandle<()>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler { tasks: Vec::new(), guards: Arc::new(DashMap::new()), handles: Vec::new() }
    }

    pub fn register_inline<F, Fut>(&mut self, id: TaskId, every: Duration, action: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let action: TaskFn = Arc::new(move || Box::pin(action()) as TaskFuture);
        self.tasks.push(ScheduledTask { id, every, action: TaskAction::Inline(action) });
    }

    pub fn register_enqueue(
        &mut self,
        id: TaskId,
        every: Duration,
        queue: Arc<JobQueue>,
        kind: &'static str,
        payload: Value,
        options: fn() -> EnqueueOptions,
    ) {
        self.tasks.push(ScheduledTask {
            id,
            every,
            action: TaskAction::Enqueue { queue, kind, payload, options },
        });
    }

    /// True while a run of the task is in flight.
    pub fn is_running(&self, id: TaskId) -> bool {
        self.guards.get(&id).is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Spawns one loop per registered task. The first tick fires immediately.
    pub fn start(&mut self) {
        for task in self.tasks.drain(..) {
            let flag = Arc::new(AtomicBool::new(false));
            self.guards.insert(task.id, Arc::clone(&flag));
            self.handles.push(tokio::spawn(run_task(task, flag)));
        }
    }

    pub fn shutdown(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_task(task: ScheduledTask, flag: Arc<AtomicBool>) {
    let mut interval = tokio::time::interval(task.every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(guard) = FlightGuard::try_acquire(&flag) else {
            debug!(
                task = %task.id,
                next_in_secs = task.every.as_secs(),
                "previous run still in flight, skipping tick"
            );
            continue;
        };
        match &task.action {
            TaskAction::Inline(action) => {
                if AssertUnwindSafe(action()).catch_unwind().await.is_err() {
                    error!(task = %task.id, "scheduled task panicked");
                }
            }
            TaskAction::Enqueue { queue, kind, payload, options } => {
                let outcome = queue.enqueue(kind, payload.clone(), options());
                debug!(task = %task.id, queue = %queue.name(), kind, ?outcome, "trigger enqueued");
            }
        }
        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn slow_task_skips_overlapping_ticks() {
        let entries = Arc::new(AtomicUsize::new(0));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let mut scheduler = Scheduler::new();
        {
            let entries = Arc::clone(&entries);
            let concurrent = Arc::clone(&concurrent);
            let max_concurrent = Arc::clone(&max_concurrent);
            scheduler.register_inline(TaskId::ReviewUsers, Duration::from_millis(20), move || {
                let entries = Arc::clone(&entries);
                let concurrent = Arc::clone(&concurrent);
                let max_concurrent = Arc::clone(&max_concurrent);
                async move {
                    entries.fetch_add(1, Ordering::SeqCst);
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_concurrent.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(70)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                }
            });
        }
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.shutdown();

        assert!(max_concurrent.load(Ordering::SeqCst) <= 1, "single-flight guard violated");
        let ran = entries.load(Ordering::SeqCst);
        assert!(ran >= 2, "expected multiple runs, got {ran}");
        // Ten ticks elapsed; overlapped ones must have been skipped.
        assert!(ran <= 4, "expected skipped ticks, got {ran}");
    }

    #[tokio::test]
    async fn enqueue_task_feeds_the_queue() {
        let queue = Arc::new(JobQueue::new(crate::queue::QueueName::FleetRestart));
        let mut scheduler = Scheduler::new();
        scheduler.register_enqueue(
            TaskId::NodeHealthCheck,
            Duration::from_millis(10),
            Arc::clone(&queue),
            "probe-fleet",
            json!({}),
            EnqueueOptions::default,
        );
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.shutdown();
        assert!(queue.depth() >= 2);
    }

    #[tokio::test]
    async fn panicking_task_releases_its_guard() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        {
            let runs = Arc::clone(&runs);
            scheduler.register_inline(TaskId::NotifyThresholds, Duration::from_millis(15), move || {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    panic!("tick failure");
                }
            });
        }
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let ran = runs.load(Ordering::SeqCst);
        scheduler.shutdown();
        assert!(ran >= 3, "guard not released after panic, only {ran} runs");
    }
}
