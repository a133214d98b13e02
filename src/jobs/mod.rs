//! Queue job kinds, payloads and handlers.
//!
//! Handlers are thin: they deserialize the payload, call the owning service
//! and translate the outcome into the queue's retry classification. Payload
//! decode failures are terminal; agent-side failures are recoverable.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::{DomainEvent, EventSubscriber};
use crate::queue::worker::JobHandler;
use crate::queue::{EnqueueOptions, Job, JobError, QueueName, QueueSet};
use crate::services::{NodeService, ServiceError, UserService};

pub mod kinds {
    pub const START_NODE: &str = "start-node";
    pub const STOP_NODE: &str = "stop-node";
    pub const RESTART_FLEET: &str = "restart-fleet";
    pub const RESTART_PROFILE: &str = "restart-profile";
    pub const ADD_USER: &str = "add-user-to-nodes";
    pub const REMOVE_USER: &str = "remove-user-from-nodes";
    pub const FINALIZE_LIMITED: &str = "finalize-limited";
    pub const FINALIZE_EXPIRED: &str = "finalize-expired";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeJobPayload {
    pub node_id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileJobPayload {
    pub profile_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserJobPayload {
    pub user_id: Uuid,
    pub username: String,
}

fn decode<T: serde::de::DeserializeOwned>(job: &Job) -> Result<T, JobError> {
    serde_json::from_value(job.payload.clone())
        .map_err(|e| JobError::Terminal(format!("undecodable {} payload: {e}", job.kind)))
}

fn classify(err: ServiceError) -> JobError {
    match err {
        ServiceError::Repository(e) => JobError::Recoverable(e.to_string()),
        ServiceError::Agent(e) => JobError::Recoverable(e.to_string()),
        ServiceError::PartialFanout { .. } => JobError::Recoverable(err.to_string()),
    }
}

/// Handles `start-node`.
pub struct StartNodeHandler {
    pub nodes: Arc<NodeService>,
}

#[async_trait]
impl JobHandler for StartNodeHandler {
    async fn process(&self, job: &Job) -> Result<(), JobError> {
        let payload: NodeJobPayload = decode(job)?;
        self.nodes.start_node(payload.node_id).await.map_err(classify)
    }
}

/// Handles `stop-node`.
pub struct StopNodeHandler {
    pub nodes: Arc<NodeService>,
}

#[async_trait]
impl JobHandler for StopNodeHandler {
    async fn process(&self, job: &Job) -> Result<(), JobError> {
        let payload: NodeJobPayload = decode(job)?;
        self.nodes.stop_node(payload.node_id).await.map_err(classify)
    }
}

/// Handles `restart-fleet` and `restart-profile`.
pub struct FleetRestartHandler {
    pub nodes: Arc<NodeService>,
}

#[async_trait]
impl JobHandler for FleetRestartHandler {
    async fn process(&self, job: &Job) -> Result<(), JobError> {
        match job.kind.as_str() {
            kinds::RESTART_FLEET => self.nodes.start_all().await.map_err(classify),
            kinds::RESTART_PROFILE => {
                let payload: ProfileJobPayload = decode(job)?;
                self.nodes.start_all_by_profile(payload.profile_id).await.map_err(classify)
            }
            other => Err(JobError::Terminal(format!("unknown restart kind {other}"))),
        }
    }
}

/// Handles `add-user-to-nodes` and `remove-user-from-nodes`.
pub struct NodeUsersHandler {
    pub users: Arc<UserService>,
}

#[async_trait]
impl JobHandler for NodeUsersHandler {
    async fn process(&self, job: &Job) -> Result<(), JobError> {
        let payload: UserJobPayload = decode(job)?;
        match job.kind.as_str() {
            kinds::ADD_USER => {
                self.users.add_user_to_nodes(payload.user_id).await.map_err(classify)
            }
            kinds::REMOVE_USER => {
                self.users.remove_user_from_nodes(&payload.username).await.map_err(classify)
            }
            other => Err(JobError::Terminal(format!("unknown membership kind {other}"))),
        }
    }
}

/// Handles `finalize-limited` and `finalize-expired`: the per-user tail of a
/// bulk status transition, fanned out so the review tick stays cheap.
pub struct UserLifecycleHandler {
    pub users: Arc<UserService>,
}

#[async_trait]
impl JobHandler for UserLifecycleHandler {
    async fn process(&self, job: &Job) -> Result<(), JobError> {
        let payload: UserJobPayload = decode(job)?;
        let event = match job.kind.as_str() {
            kinds::FINALIZE_LIMITED => DomainEvent::UserLimited {
                user_id: payload.user_id,
                username: payload.username.clone(),
            },
            kinds::FINALIZE_EXPIRED => DomainEvent::UserExpired {
                user_id: payload.user_id,
                username: payload.username.clone(),
            },
            other => return Err(JobError::Terminal(format!("unknown lifecycle kind {other}"))),
        };
        self.users.finalize_transition(event).await;
        Ok(())
    }
}

/// Keeps node membership in sync with user lifecycle events by enqueueing
/// the matching membership job. Runs inside the synchronous event dispatch,
/// so the enqueue is ordered with the mutation that raised the event.
pub struct MembershipJobEnqueuer {
    queues: Arc<QueueSet>,
}

impl MembershipJobEnqueuer {
    pub fn new(queues: Arc<QueueSet>) -> Self {
        MembershipJobEnqueuer { queues }
    }

    fn enqueue(&self, kind: &str, user_id: Uuid, username: &str) {
        let payload = UserJobPayload { user_id, username: username.to_string() };
        let value = match serde_json::to_value(&payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(kind, %user_id, "failed to serialize membership payload: {e}");
                return;
            }
        };
        let outcome = self.queues.get(QueueName::NodeUsers).enqueue(
            kind,
            value,
            EnqueueOptions::with_identity(format!("{kind}:{user_id}")),
        );
        debug!(kind, %user_id, ?outcome, "membership job enqueued");
    }
}

#[async_trait]
impl EventSubscriber for MembershipJobEnqueuer {
    fn name(&self) -> &'static str {
        "membership-job-enqueuer"
    }

    async fn handle(&self, event: &DomainEvent) {
        match event {
            DomainEvent::UserCreated { user_id, username }
            | DomainEvent::UserEnabled { user_id, username } => {
                self.enqueue(kinds::ADD_USER, *user_id, username);
            }
            // Deletion removes from nodes inline before the event fires.
            DomainEvent::UserDisabled { user_id, username }
            | DomainEvent::UserLimited { user_id, username }
            | DomainEvent::UserExpired { user_id, username } => {
                self.enqueue(kinds::REMOVE_USER, *user_id, username);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    #[tokio::test]
    async fn lifecycle_events_map_to_membership_jobs() {
        let queues = Arc::new(QueueSet::new());
        let mut bus = EventBus::new();
        bus.subscribe(Arc::new(MembershipJobEnqueuer::new(Arc::clone(&queues))));

        let id = Uuid::new_v4();
        bus.emit(DomainEvent::UserCreated { user_id: id, username: "ada".into() }).await;
        bus.emit(DomainEvent::UserLimited { user_id: id, username: "ada".into() }).await;
        bus.emit(DomainEvent::NodeCreated { node_id: 1, name: "n".into() }).await;

        let queue = queues.get(QueueName::NodeUsers);
        assert_eq!(queue.depth(), 2);
        let add = queue.try_pop().unwrap();
        assert_eq!(add.kind, kinds::ADD_USER);
        let remove = queue.try_pop().unwrap();
        assert_eq!(remove.kind, kinds::REMOVE_USER);
    }

    #[tokio::test]
    async fn duplicate_lifecycle_events_coalesce() {
        let queues = Arc::new(QueueSet::new());
        let enqueuer = MembershipJobEnqueuer::new(Arc::clone(&queues));

        let id = Uuid::new_v4();
        enqueuer
            .handle(&DomainEvent::UserEnabled { user_id: id, username: "ada".into() })
            .await;
        enqueuer
            .handle(&DomainEvent::UserEnabled { user_id: id, username: "ada".into() })
            .await;

        assert_eq!(queues.get(QueueName::NodeUsers).depth(), 1);
    }
}
