//! User lifecycle: account CRUD, the recurring limit/expiry review, traffic
//! resets and threshold notifications.
//!
//! Bulk decisions stay set-based in the repository; the per-user tail (node
//! membership pushes, notifications) is fanned out through the queues so a
//! review tick over a large registry stays cheap.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{NodeAgentClient, UserPayload};
use crate::config::Config;
use crate::db::entities::user;
use crate::db::enums::{TrafficResetStrategy, UserStatus};
use crate::events::{DomainEvent, EventBus};
use crate::fanout::fan_out;
use crate::jobs::{kinds, UserJobPayload};
use crate::queue::{EnqueueOptions, QueueName, QueueSet, RetryPolicy};
use crate::repository::{NewUser, NodeRepository, UsageRepository, UserRepository};
use crate::services::{agent_addr, shares_inbound, ServiceError, ServiceResult};

pub struct UserService {
    users: Arc<dyn UserRepository>,
    nodes: Arc<dyn NodeRepository>,
    usage: Arc<dyn UsageRepository>,
    agent: Arc<dyn NodeAgentClient>,
    queues: Arc<QueueSet>,
    events: Arc<EventBus>,
    config: Arc<Config>,
}

impl UserService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        nodes: Arc<dyn NodeRepository>,
        usage: Arc<dyn UsageRepository>,
        agent: Arc<dyn NodeAgentClient>,
        queues: Arc<QueueSet>,
        events: Arc<EventBus>,
        config: Arc<Config>,
    ) -> Self {
        UserService { users, nodes, usage, agent, queues, events, config }
    }

    pub async fn create_user(&self, new: NewUser) -> ServiceResult<user::Model> {
        let user = self.users.insert(new).await?;
        info!(user_id = %user.id, username = %user.username, "user created");
        self.events
            .emit(DomainEvent::UserCreated { user_id: user.id, username: user.username.clone() })
            .await;
        Ok(user)
    }

    pub async fn enable_user(&self, user_id: Uuid) -> ServiceResult<()> {
        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or(crate::repository::RepositoryError::UserNotFound(user_id))?;
        self.users.set_status(user_id, UserStatus::Active).await?;
        self.events
            .emit(DomainEvent::UserEnabled { user_id, username: user.username })
            .await;
        Ok(())
    }

    pub async fn disable_user(&self, user_id: Uuid) -> ServiceResult<()> {
        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or(crate::repository::RepositoryError::UserNotFound(user_id))?;
        self.users.set_status(user_id, UserStatus::Disabled).await?;
        self.events
            .emit(DomainEvent::UserDisabled { user_id, username: user.username })
            .await;
        Ok(())
    }

    /// Deletes the account: node-side removal first, so a crash between the
    /// two steps never leaves a deleted account with fleet access. A node
    /// missed here is reconciled by its next config push.
    pub async fn delete_user(&self, user_id: Uuid) -> ServiceResult<()> {
        let Some(user) = self.users.get(user_id).await? else {
            return Ok(());
        };
        if let Err(e) = self.remove_user_from_nodes(&user.username).await {
            warn!(username = %user.username, "removal incomplete during delete: {e}");
        }
        self.users.delete(user_id).await?;
        self.events
            .emit(DomainEvent::UserDeleted { user_id, username: user.username.clone() })
            .await;
        info!(user_id = %user_id, username = %user.username, "user deleted");
        Ok(())
    }

    /// Recurring limit/expiry review. Both checks run every tick; either can
    /// fire independently, and a failure in one never blocks the other.
    pub async fn review_tick(&self) {
        match self.users.transition_exceeded().await {
            Ok(rows) if !rows.is_empty() => {
                info!(count = rows.len(), "users over traffic limit");
                self.reconcile_bulk(rows, kinds::FINALIZE_LIMITED).await;
            }
            Ok(_) => {}
            Err(e) => warn!("limit review failed: {e}"),
        }
        match self.users.transition_expired(Utc::now()).await {
            Ok(rows) if !rows.is_empty() => {
                info!(count = rows.len(), "users past expiry");
                self.reconcile_bulk(rows, kinds::FINALIZE_EXPIRED).await;
            }
            Ok(_) => {}
            Err(e) => warn!("expiry review failed: {e}"),
        }
    }

    /// Per-user tail of a bulk transition. Above the cutoff the per-user
    /// work would swamp the queues, so the fleet is restarted instead and
    /// per-user notifications are skipped.
    async fn reconcile_bulk(&self, rows: Vec<user::Model>, kind: &'static str) {
        if rows.len() > self.config.bulk_transition_cutoff {
            warn!(
                count = rows.len(),
                kind, "bulk transition above cutoff, falling back to fleet restart"
            );
            self.queues.get(QueueName::FleetRestart).enqueue(
                kinds::RESTART_FLEET,
                Value::Null,
                EnqueueOptions::with_dedup("restart-fleet", self.config.restart_dedup_window),
            );
            return;
        }
        let payloads: Vec<Value> = rows
            .iter()
            .filter_map(|u| {
                serde_json::to_value(UserJobPayload {
                    user_id: u.id,
                    username: u.username.clone(),
                })
                .ok()
            })
            .collect();
        let queued =
            self.queues.get(QueueName::UserJobs).enqueue_many(kind, payloads, RetryPolicy::default());
        info!(queued, kind, "bulk transition scheduled");
    }

    /// Emits the event finishing one bulk transition row. Subscribers take
    /// it from there (notification plus node-side removal).
    pub async fn finalize_transition(&self, event: DomainEvent) {
        self.events.emit(event).await;
    }

    /// Pushes one account to every connected node serving its inbounds.
    pub async fn add_user_to_nodes(&self, user_id: Uuid) -> ServiceResult<()> {
        let Some(user) = self.users.get(user_id).await? else {
            debug!(%user_id, "push skipped, user no longer exists");
            return Ok(());
        };
        if !user.status.is_pushable() {
            debug!(%user_id, status = %user.status, "push skipped, user is not active");
            return Ok(());
        }
        let targets: Vec<_> = self
            .nodes
            .list_enabled()
            .await?
            .into_iter()
            .filter(|n| n.is_connected && shares_inbound(n, &user))
            .collect();
        if targets.is_empty() {
            return Ok(());
        }
        let payload = UserPayload::for_user(&user);
        let agent = Arc::clone(&self.agent);
        let outcomes = fan_out(
            targets,
            self.config.user_fanout,
            self.config.agent_timeout,
            |node| {
                let agent = Arc::clone(&agent);
                let payload = payload.clone();
                async move { agent.add_user(&agent_addr(&node), &payload).await }
            },
        )
        .await;
        self.check_membership_outcomes(&user.username, "add", outcomes)
    }

    /// Removes one account from every connected node. Removal is pushed
    /// everywhere: a node's inbound set may have changed since the add.
    pub async fn remove_user_from_nodes(&self, username: &str) -> ServiceResult<()> {
        let targets: Vec<_> = self
            .nodes
            .list_enabled()
            .await?
            .into_iter()
            .filter(|n| n.is_connected)
            .collect();
        if targets.is_empty() {
            return Ok(());
        }
        let payload = UserPayload::removal(username);
        let agent = Arc::clone(&self.agent);
        let outcomes = fan_out(
            targets,
            self.config.user_fanout,
            self.config.agent_timeout,
            |node| {
                let agent = Arc::clone(&agent);
                let payload = payload.clone();
                async move { agent.remove_user(&agent_addr(&node), &payload).await }
            },
        )
        .await;
        self.check_membership_outcomes(username, "remove", outcomes)
    }

    fn check_membership_outcomes<T>(
        &self,
        username: &str,
        op: &str,
        outcomes: Vec<crate::fanout::NodeOutcome<T>>,
    ) -> ServiceResult<()> {
        let total = outcomes.len();
        let mut failed = 0usize;
        let mut first_error: Option<String> = None;
        for outcome in outcomes {
            if let Err(failure) = outcome.result {
                failed += 1;
                debug!(username, node_id = outcome.node_id, op, "membership push failed: {failure}");
                first_error.get_or_insert(failure.message);
            }
        }
        if failed > 0 {
            warn!(username, op, failed, total, "membership push incomplete");
            return Err(ServiceError::PartialFanout {
                failed,
                total,
                first_error: first_error.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Resets users whose rolling window has elapsed.
    pub async fn reset_rolling_tick(&self) {
        let now = Utc::now();
        for strategy in [
            TrafficResetStrategy::Day,
            TrafficResetStrategy::Week,
            TrafficResetStrategy::Month,
            TrafficResetStrategy::Year,
        ] {
            match self.users.due_for_rolling_reset(strategy, now).await {
                Ok(due) => {
                    for user in due {
                        self.reset_one(&user).await;
                    }
                }
                Err(e) => warn!(?strategy, "rolling reset scan failed: {e}"),
            }
        }
    }

    /// Resets users on the first tick of a new calendar month. Running the
    /// tick again in the same month finds nothing due.
    pub async fn reset_calendar_tick(&self) {
        match self.users.due_for_calendar_reset(Utc::now()).await {
            Ok(due) => {
                for user in due {
                    self.reset_one(&user).await;
                }
            }
            Err(e) => warn!("calendar reset scan failed: {e}"),
        }
    }

    /// Zeroes one user's period counter, archives the pre-reset value and
    /// lifts a limit-induced suspension.
    async fn reset_one(&self, user: &user::Model) {
        let now = Utc::now();
        let pre_reset = match self.users.reset_traffic(user.id, now).await {
            Ok(pre) => pre,
            Err(e) => {
                warn!(username = %user.username, "traffic reset failed: {e}");
                return;
            }
        };
        if let Err(e) = self.usage.record_reset(user.id, pre_reset, now).await {
            warn!(username = %user.username, "reset history write failed: {e}");
        }
        if user.status == UserStatus::Limited {
            if let Err(e) = self.users.set_status(user.id, UserStatus::Active).await {
                warn!(username = %user.username, "reactivation failed: {e}");
                return;
            }
            self.events
                .emit(DomainEvent::UserEnabled {
                    user_id: user.id,
                    username: user.username.clone(),
                })
                .await;
        }
        debug!(username = %user.username, pre_reset_bytes = pre_reset, "traffic counter reset");
    }

    /// Advances threshold watermarks and notifies each crossing once. A
    /// batch over the cutoff still advances watermarks (so nothing fires
    /// twice later) but its notifications are dropped wholesale.
    pub async fn threshold_tick(&self) {
        let crossings = match self.users.advance_thresholds(&self.config.notify_thresholds).await {
            Ok(c) => c,
            Err(e) => {
                warn!("threshold scan failed: {e}");
                return;
            }
        };
        if crossings.is_empty() {
            return;
        }
        if crossings.len() > self.config.threshold_notify_cutoff {
            warn!(
                count = crossings.len(),
                cutoff = self.config.threshold_notify_cutoff,
                "threshold batch above cutoff, suppressing notifications"
            );
            return;
        }
        for crossing in crossings {
            self.events
                .emit(DomainEvent::UserThresholdReached {
                    user_id: crossing.user_id,
                    username: crossing.username,
                    percent: crossing.percent,
                })
                .await;
        }
    }
}
