use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// The queue set is fixed and domain-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    /// Single-node start sequences; paused while a fleet restart runs.
    StartNode,
    /// Single-node stop/disable/delete sequences.
    StopNode,
    /// Fleet-wide and profile-wide restart triggers.
    FleetRestart,
    /// Per-user add/remove membership pushes.
    NodeUsers,
    /// User lifecycle work fanned out from bulk decisions.
    UserJobs,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::StartNode,
        QueueName::StopNode,
        QueueName::FleetRestart,
        QueueName::NodeUsers,
        QueueName::UserJobs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::StartNode => "start-node",
            QueueName::StopNode => "stop-node",
            QueueName::FleetRestart => "fleet-restart",
            QueueName::NodeUsers => "node-users",
            QueueName::UserJobs => "user-jobs",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded-attempt retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { max_attempts: 3, backoff_base: Duration::from_secs(1) }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempts_made + 1`, without jitter.
    pub fn backoff(&self, attempts_made: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempts_made.saturating_sub(1))
    }
}

/// Coalescing key: triggers sharing a key inside the window collapse into
/// the in-flight execution plus at most one delayed retry.
#[derive(Debug, Clone)]
pub struct Dedup {
    pub key: String,
    pub window: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Re-enqueue with the same key while a job carrying it is pending,
    /// delayed or running is a no-op.
    pub identity_key: Option<String>,
    pub dedup: Option<Dedup>,
    pub delay: Option<Duration>,
    pub retry: RetryPolicy,
    /// Terminal failures retained for inspection, per queue.
    pub keep_failed: Option<usize>,
}

impl EnqueueOptions {
    pub fn with_identity(key: impl Into<String>) -> Self {
        EnqueueOptions { identity_key: Some(key.into()), ..Default::default() }
    }

    pub fn with_dedup(key: impl Into<String>, window: Duration) -> Self {
        EnqueueOptions {
            dedup: Some(Dedup { key: key.into(), window }),
            ..Default::default()
        }
    }
}

/// One unit of queued work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub queue: QueueName,
    pub kind: String,
    pub payload: Value,
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
    pub(crate) identity_key: Option<String>,
    pub(crate) dedup_key: Option<String>,
    /// Set on the delayed duplicate scheduled at window expiry.
    pub(crate) dedup_retry: bool,
    pub(crate) retry: RetryPolicy,
}

/// Handler outcome classification. Recoverable failures are retried with
/// backoff up to the job's attempt bound; terminal failures are logged and
/// kept for inspection.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("recoverable: {0}")]
    Recoverable(String),
    #[error("terminal: {0}")]
    Terminal(String),
}

/// Result of an enqueue attempt, observable for idempotence checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    Delayed,
    /// Collapsed into an already-queued job (identity or dedup suppression).
    Coalesced,
    /// Dedup collision: a single retry was scheduled at window expiry.
    RetryScheduled,
}

/// Terminal failure retained in the queue's bounded failure ring.
#[derive(Debug, Clone)]
pub struct FailedJob {
    pub job: Job,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}
