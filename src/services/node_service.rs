//! Node lifecycle: registration, start/stop sequences, fleet-wide restarts
//! and the recurring health check.
//!
//! A start sequence is the only path that marks a node connected: it pushes
//! the node's engine configuration, applies the resulting connectivity patch
//! and re-pushes the node's share of active users. The health check only
//! observes; when it finds a node unhealthy it records the fact and enqueues
//! a start sequence to heal it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{ConfigBuilder, NodeAgentClient, UserPayload};
use crate::config::Config;
use crate::db::entities::{node, user};
use crate::events::{DomainEvent, EventBus};
use crate::fanout::fan_out;
use crate::jobs::{kinds, NodeJobPayload, ProfileJobPayload};
use crate::queue::{EnqueueOptions, EnqueueOutcome, QueueName, QueueSet};
use crate::repository::{ConnectivityPatch, NewNode, NodeRepository, UserRepository};
use crate::services::{agent_addr, effective_inbounds, shares_inbound, ServiceError, ServiceResult};

pub struct NodeService {
    nodes: Arc<dyn NodeRepository>,
    users: Arc<dyn UserRepository>,
    agent: Arc<dyn NodeAgentClient>,
    builder: Arc<dyn ConfigBuilder>,
    queues: Arc<QueueSet>,
    events: Arc<EventBus>,
    config: Arc<Config>,
    /// The first health tick starts the whole fleet instead of probing it.
    cold_start_done: AtomicBool,
}

impl NodeService {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        users: Arc<dyn UserRepository>,
        agent: Arc<dyn NodeAgentClient>,
        builder: Arc<dyn ConfigBuilder>,
        queues: Arc<QueueSet>,
        events: Arc<EventBus>,
        config: Arc<Config>,
    ) -> Self {
        NodeService {
            nodes,
            users,
            agent,
            builder,
            queues,
            events,
            config,
            cold_start_done: AtomicBool::new(false),
        }
    }

    /// Registers a node and schedules its first start sequence.
    pub async fn create_node(&self, new: NewNode) -> ServiceResult<node::Model> {
        let node = self.nodes.insert(new).await?;
        info!(node_id = node.id, name = %node.name, "node registered");
        self.events
            .emit(DomainEvent::NodeCreated { node_id: node.id, name: node.name.clone() })
            .await;
        self.enqueue_start(node.id);
        Ok(node)
    }

    fn enqueue_start(&self, node_id: i32) -> EnqueueOutcome {
        let payload = serde_json::to_value(NodeJobPayload { node_id })
            .unwrap_or(Value::Null);
        self.queues.get(QueueName::StartNode).enqueue(
            kinds::START_NODE,
            payload,
            EnqueueOptions::with_identity(format!("start-node:{node_id}")),
        )
    }

    fn enqueue_stop(&self, node_id: i32) -> EnqueueOutcome {
        let payload = serde_json::to_value(NodeJobPayload { node_id })
            .unwrap_or(Value::Null);
        self.queues.get(QueueName::StopNode).enqueue(
            kinds::STOP_NODE,
            payload,
            EnqueueOptions::with_identity(format!("stop-node:{node_id}")),
        )
    }

    /// Full start sequence for one node. A node already mid-start or
    /// administratively disabled is skipped, not an error.
    pub async fn start_node(&self, node_id: i32) -> ServiceResult<()> {
        let Some(node) = self.nodes.get(node_id).await? else {
            debug!(node_id, "start skipped, node no longer exists");
            return Ok(());
        };
        if node.is_disabled {
            debug!(node_id, "start skipped, node is disabled");
            return Ok(());
        }
        if node.is_connecting {
            debug!(node_id, "start skipped, another start is in progress");
            return Ok(());
        }
        self.nodes.set_connecting(node_id, true).await?;
        let result = self.run_start_sequence(&node).await;
        if result.is_err() {
            // A failed connectivity write leaves the flag set, which would
            // hide the node from every later health tick. Clear it here.
            if let Err(e) = self.nodes.set_connecting(node_id, false).await {
                warn!(node_id, "could not clear connecting flag: {e}");
            }
        }
        result
    }

    async fn run_start_sequence(&self, node: &node::Model) -> ServiceResult<()> {
        let node_id = node.id;
        let was_connected = node.is_connected;
        let addr = agent_addr(node);
        let config = self.builder.build_config(&node.excluded_inbounds);
        match self.agent.push_config(&addr, &config).await {
            Ok(info) => {
                self.nodes
                    .apply_connectivity(
                        node_id,
                        ConnectivityPatch::online(info.xray_version)
                            .with_hardware(info.cpu_count, info.mem_total_bytes),
                    )
                    .await?;
                if !was_connected {
                    self.events
                        .emit(DomainEvent::NodeConnectionRestored {
                            node_id,
                            name: node.name.clone(),
                        })
                        .await;
                }
                let users = self.users.list_active().await?;
                self.push_users_to(node, &users).await;
                info!(node_id, name = %node.name, "node started");
                Ok(())
            }
            Err(failure) => {
                warn!(node_id, name = %node.name, "start failed: {failure}");
                if was_connected {
                    self.events
                        .emit(DomainEvent::NodeConnectionLost {
                            node_id,
                            name: node.name.clone(),
                            reason: failure.message.clone(),
                        })
                        .await;
                }
                self.nodes
                    .apply_connectivity(
                        node_id,
                        ConnectivityPatch::offline(failure.message.clone()),
                    )
                    .await?;
                Err(ServiceError::Agent(failure))
            }
        }
    }

    /// Pushes every eligible active user to one freshly started node.
    /// Individual push failures degrade the node, they do not fail the start.
    async fn push_users_to(&self, node: &node::Model, users: &[user::Model]) {
        let addr = agent_addr(node);
        let mut failed = 0usize;
        for user in users.iter().filter(|u| u.status.is_pushable() && shares_inbound(node, u)) {
            let payload = UserPayload::for_user(user);
            if let Err(failure) = self.agent.add_user(&addr, &payload).await {
                failed += 1;
                debug!(node_id = node.id, username = %user.username, "user push failed: {failure}");
            }
        }
        if failed > 0 {
            warn!(node_id = node.id, name = %node.name, failed, "user sync incomplete");
        }
    }

    /// Restarts the whole fleet with bounded concurrency. Single-node start
    /// jobs are paused for the duration so they cannot interleave.
    pub async fn start_all(&self) -> ServiceResult<()> {
        let start_queue = self.queues.get(QueueName::StartNode);
        let _pause = start_queue.pause();
        let nodes = self.nodes.list_enabled().await?;
        info!(nodes = nodes.len(), "fleet restart");
        self.push_config_fleet(nodes).await
    }

    /// Restarts every node bound to one configuration profile. Nodes left
    /// with no effective inbounds by the profile are disabled instead of
    /// started.
    pub async fn start_all_by_profile(&self, profile_id: Uuid) -> ServiceResult<()> {
        let start_queue = self.queues.get(QueueName::StartNode);
        let _pause = start_queue.pause();
        let nodes = self.nodes.list_by_profile(profile_id).await?;
        let mut startable = Vec::with_capacity(nodes.len());
        for node in nodes {
            if node.is_disabled {
                continue;
            }
            if effective_inbounds(&node).is_empty() {
                warn!(node_id = node.id, name = %node.name,
                    "profile leaves node without inbounds, disabling it");
                self.nodes.set_disabled(node.id, true).await?;
                continue;
            }
            startable.push(node);
        }
        info!(%profile_id, nodes = startable.len(), "profile restart");
        self.push_config_fleet(startable).await
    }

    async fn push_config_fleet(&self, nodes: Vec<node::Model>) -> ServiceResult<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        // One config build per distinct exclusion set, not per node.
        let mut configs: HashMap<Vec<String>, Value> = HashMap::new();
        for node in &nodes {
            configs
                .entry(node.excluded_inbounds.clone())
                .or_insert_with(|| self.builder.build_config(&node.excluded_inbounds));
        }
        let users = self.users.list_active().await?;
        let by_id: HashMap<i32, node::Model> =
            nodes.iter().map(|n| (n.id, n.clone())).collect();

        let agent = Arc::clone(&self.agent);
        let outcomes = fan_out(
            nodes,
            self.config.start_fanout,
            self.config.agent_timeout,
            |node| {
                let agent = Arc::clone(&agent);
                let config = configs.get(&node.excluded_inbounds).cloned().unwrap_or(Value::Null);
                async move { agent.push_config(&agent_addr(&node), &config).await }
            },
        )
        .await;

        let total = outcomes.len();
        let mut failed = 0usize;
        let mut first_error: Option<String> = None;
        for outcome in outcomes {
            let node = &by_id[&outcome.node_id];
            match outcome.result {
                Ok(info) => {
                    self.nodes
                        .apply_connectivity(
                            node.id,
                            ConnectivityPatch::online(info.xray_version)
                                .with_hardware(info.cpu_count, info.mem_total_bytes),
                        )
                        .await?;
                    if !node.is_connected {
                        self.events
                            .emit(DomainEvent::NodeConnectionRestored {
                                node_id: node.id,
                                name: node.name.clone(),
                            })
                            .await;
                    }
                    self.push_users_to(node, &users).await;
                }
                Err(failure) => {
                    failed += 1;
                    warn!(node_id = node.id, name = %node.name, "config push failed: {failure}");
                    if node.is_connected {
                        self.events
                            .emit(DomainEvent::NodeConnectionLost {
                                node_id: node.id,
                                name: node.name.clone(),
                                reason: failure.message.clone(),
                            })
                            .await;
                    }
                    self.nodes
                        .apply_connectivity(
                            node.id,
                            ConnectivityPatch::offline(failure.message.clone()),
                        )
                        .await?;
                    first_error.get_or_insert(failure.message);
                }
            }
        }
        if failed > 0 {
            return Err(ServiceError::PartialFanout {
                failed,
                total,
                first_error: first_error.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Recurring health check. The very first tick cold-starts the fleet;
    /// afterwards each tick probes every enabled node that is not already
    /// mid-start, records connectivity edges and enqueues a start sequence
    /// for every unhealthy node.
    pub async fn health_check_tick(&self) {
        if !self.cold_start_done.swap(true, Ordering::SeqCst) {
            info!("first health tick, starting the fleet");
            if let Err(e) = self.start_all().await {
                warn!("fleet cold start incomplete: {e}");
            }
            return;
        }

        let nodes = match self.nodes.list_enabled().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("health check skipped, cannot list nodes: {e}");
                return;
            }
        };
        let nodes: Vec<_> = nodes.into_iter().filter(|n| !n.is_connecting).collect();
        if nodes.is_empty() {
            return;
        }
        let by_id: HashMap<i32, node::Model> =
            nodes.iter().map(|n| (n.id, n.clone())).collect();

        let agent = Arc::clone(&self.agent);
        let outcomes = fan_out(
            nodes,
            self.config.health_fanout,
            self.config.agent_timeout,
            |node| {
                let agent = Arc::clone(&agent);
                async move { agent.probe_health(&agent_addr(&node)).await }
            },
        )
        .await;

        for outcome in outcomes {
            let node = &by_id[&outcome.node_id];
            let result = match outcome.result {
                Ok(info) if info.xray_running => {
                    if !node.is_connected {
                        self.events
                            .emit(DomainEvent::NodeConnectionRestored {
                                node_id: node.id,
                                name: node.name.clone(),
                            })
                            .await;
                    }
                    self.nodes
                        .apply_connectivity(
                            node.id,
                            ConnectivityPatch::online(info.xray_version)
                                .with_hardware(info.cpu_count, info.mem_total_bytes),
                        )
                        .await
                        .map(|_| ())
                }
                Ok(_) => {
                    debug!(node_id = node.id, "agent up but engine down, scheduling start");
                    self.enqueue_start(node.id);
                    self.nodes
                        .apply_connectivity(
                            node.id,
                            ConnectivityPatch::connected_not_running("proxy engine is not running"),
                        )
                        .await
                        .map(|_| ())
                }
                Err(failure) => {
                    if node.is_connected {
                        self.events
                            .emit(DomainEvent::NodeConnectionLost {
                                node_id: node.id,
                                name: node.name.clone(),
                                reason: failure.message.clone(),
                            })
                            .await;
                    }
                    self.enqueue_start(node.id);
                    self.nodes
                        .apply_connectivity(
                            node.id,
                            ConnectivityPatch::offline(failure.message.clone()),
                        )
                        .await
                        .map(|_| ())
                }
            };
            if let Err(e) = result {
                warn!(node_id = node.id, "connectivity update failed: {e}");
            }
        }
    }

    /// Stops the node's engine and records it as offline. An unreachable
    /// agent does not fail the stop.
    pub async fn stop_node(&self, node_id: i32) -> ServiceResult<()> {
        let Some(node) = self.nodes.get(node_id).await? else {
            debug!(node_id, "stop skipped, node no longer exists");
            return Ok(());
        };
        if let Err(failure) = self.agent.stop(&agent_addr(&node)).await {
            warn!(node_id, name = %node.name, "agent unreachable during stop: {failure}");
        }
        self.nodes
            .apply_connectivity(node_id, ConnectivityPatch::offline("stopped"))
            .await?;
        info!(node_id, name = %node.name, "node stopped");
        Ok(())
    }

    /// Excludes the node from every fan-out and schedules a stop.
    pub async fn disable_node(&self, node_id: i32) -> ServiceResult<()> {
        self.nodes.set_disabled(node_id, true).await?;
        self.enqueue_stop(node_id);
        Ok(())
    }

    pub async fn enable_node(&self, node_id: i32) -> ServiceResult<()> {
        self.nodes.set_disabled(node_id, false).await?;
        self.enqueue_start(node_id);
        Ok(())
    }

    /// Tolerant stop followed by a full start sequence.
    pub async fn restart_node(&self, node_id: i32) -> ServiceResult<()> {
        self.stop_node(node_id).await?;
        self.start_node(node_id).await
    }

    /// Schedules a fleet restart. Triggers inside the dedup window collapse
    /// into the pending restart plus at most one trailing retry.
    pub fn restart_fleet(&self) -> EnqueueOutcome {
        self.queues.get(QueueName::FleetRestart).enqueue(
            kinds::RESTART_FLEET,
            Value::Null,
            EnqueueOptions::with_dedup("restart-fleet", self.config.restart_dedup_window),
        )
    }

    pub fn restart_profile(&self, profile_id: Uuid) -> EnqueueOutcome {
        let payload = serde_json::to_value(ProfileJobPayload { profile_id })
            .unwrap_or(Value::Null);
        self.queues.get(QueueName::FleetRestart).enqueue(
            kinds::RESTART_PROFILE,
            payload,
            EnqueueOptions::with_dedup(
                format!("restart-profile:{profile_id}"),
                self.config.restart_dedup_window,
            ),
        )
    }

    /// Removes the node from the registry after a tolerant stop.
    pub async fn delete_node(&self, node_id: i32) -> ServiceResult<()> {
        let Some(node) = self.nodes.get(node_id).await? else {
            return Ok(());
        };
        if node.is_connected {
            if let Err(failure) = self.agent.stop(&agent_addr(&node)).await {
                warn!(node_id, "agent unreachable during delete: {failure}");
            }
        }
        self.nodes.delete(node_id).await?;
        self.events
            .emit(DomainEvent::NodeDeleted { node_id, name: node.name.clone() })
            .await;
        info!(node_id, name = %node.name, "node deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::StaticConfigBuilder;
    use crate::db::enums::TrafficResetStrategy;
    use crate::events::{DomainEvent, NotificationEmitter};
    use crate::repository::memory::{MemoryNodeRepository, MemoryUserRepository};
    use crate::repository::{NewUser, RepoResult, RepositoryError};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use crate::services::testing::MockAgent;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        service: NodeService,
        nodes: Arc<MemoryNodeRepository>,
        users: Arc<MemoryUserRepository>,
        agent: Arc<MockAgent>,
        queues: Arc<QueueSet>,
        notifications: UnboundedReceiver<DomainEvent>,
    }

    fn fixture() -> Fixture {
        let nodes = Arc::new(MemoryNodeRepository::new());
        let users = Arc::new(MemoryUserRepository::new());
        let agent = Arc::new(MockAgent::new());
        let queues = Arc::new(QueueSet::new());
        let (emitter, notifications) = NotificationEmitter::channel();
        let mut bus = EventBus::new();
        bus.subscribe(emitter);
        let builder = Arc::new(StaticConfigBuilder::new(json!({
            "inbounds": [{"tag": "vless-in"}, {"tag": "trojan-in"}],
        })));
        let service = NodeService::new(
            Arc::clone(&nodes) as Arc<dyn NodeRepository>,
            Arc::clone(&users) as Arc<dyn UserRepository>,
            Arc::clone(&agent) as Arc<dyn NodeAgentClient>,
            builder,
            Arc::clone(&queues),
            Arc::new(bus),
            Arc::new(Config::default()),
        );
        Fixture { service, nodes, users, agent, queues, notifications }
    }

    fn new_node(name: &str, port: u16) -> NewNode {
        NewNode {
            name: name.to_string(),
            address: "10.0.0.1".to_string(),
            port,
            config_profile_id: None,
            active_inbounds: vec!["vless-in".to_string()],
            excluded_inbounds: Vec::new(),
            traffic_limit_bytes: None,
            traffic_reset_day: 1,
            consumption_multiplier_permille: 1000,
            view_position: 0,
        }
    }

    fn new_user(username: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            traffic_limit_bytes: 0,
            traffic_limit_strategy: TrafficResetStrategy::NoReset,
            expire_at: None,
            active_inbounds: vec!["vless-in".to_string()],
        }
    }

    #[tokio::test]
    async fn create_node_schedules_first_start() {
        let mut fx = fixture();
        let node = fx.service.create_node(new_node("edge-1", 8443)).await.unwrap();

        assert_eq!(fx.queues.get(QueueName::StartNode).depth(), 1);
        match fx.notifications.try_recv().unwrap() {
            DomainEvent::NodeCreated { node_id, name } => {
                assert_eq!(node_id, node.id);
                assert_eq!(name, "edge-1");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_marks_online_and_pushes_eligible_users() {
        let mut fx = fixture();
        let node = fx.nodes.insert(new_node("edge-1", 8443)).await.unwrap();
        fx.users.insert(new_user("ada")).await.unwrap();
        let other = fx.users.insert(new_user("bob")).await.unwrap();
        fx.users
            .set_status(other.id, crate::db::enums::UserStatus::Disabled)
            .await
            .unwrap();

        fx.service.start_node(node.id).await.unwrap();

        let stored = fx.nodes.get(node.id).await.unwrap().unwrap();
        assert!(stored.is_connected);
        assert!(stored.is_xray_running);
        assert!(!stored.is_connecting);
        assert_eq!(stored.xray_version.as_deref(), Some("1.8.4"));
        assert_eq!(stored.cpu_count, Some(2));
        assert_eq!(stored.mem_total_bytes, Some(1 << 30));

        let adds = fx.agent.calls_of("add_user");
        assert_eq!(adds, vec!["add_user 10.0.0.1:8443 ada"]);
        match fx.notifications.try_recv().unwrap() {
            DomainEvent::NodeConnectionRestored { node_id, .. } => assert_eq!(node_id, node.id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_start_marks_offline_and_surfaces_error() {
        let mut fx = fixture();
        let node = fx.nodes.insert(new_node("edge-1", 8443)).await.unwrap();
        fx.agent.mark_down("10.0.0.1:8443");

        let err = fx.service.start_node(node.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Agent(_)));

        let stored = fx.nodes.get(node.id).await.unwrap().unwrap();
        assert!(!stored.is_connected);
        assert!(!stored.is_connecting);
        assert!(stored.last_status_message.unwrap().contains("connection refused"));
        // No falling edge: the node was never connected.
        assert!(fx.notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn start_skips_disabled_and_mid_start_nodes() {
        let fx = fixture();
        let node = fx.nodes.insert(new_node("edge-1", 8443)).await.unwrap();
        fx.nodes.set_disabled(node.id, true).await.unwrap();
        fx.service.start_node(node.id).await.unwrap();
        assert!(fx.agent.calls().is_empty());

        fx.nodes.set_disabled(node.id, false).await.unwrap();
        fx.nodes.set_connecting(node.id, true).await.unwrap();
        fx.service.start_node(node.id).await.unwrap();
        assert!(fx.agent.calls().is_empty());
    }

    #[tokio::test]
    async fn first_health_tick_cold_starts_later_ticks_probe() {
        let fx = fixture();
        fx.nodes.insert(new_node("edge-1", 8443)).await.unwrap();
        fx.nodes.insert(new_node("edge-2", 8444)).await.unwrap();

        fx.service.health_check_tick().await;
        assert_eq!(fx.agent.calls_of("push_config").len(), 2);
        assert!(fx.agent.calls_of("probe").is_empty());

        fx.service.health_check_tick().await;
        assert_eq!(fx.agent.calls_of("probe").len(), 2);
    }

    #[tokio::test]
    async fn health_tick_records_falling_edge_and_schedules_heal() {
        let mut fx = fixture();
        let node = fx.nodes.insert(new_node("edge-1", 8443)).await.unwrap();
        fx.service.health_check_tick().await; // cold start, node online
        let _ = fx.notifications.try_recv();

        fx.agent.mark_down("10.0.0.1:8443");
        fx.service.health_check_tick().await;

        let stored = fx.nodes.get(node.id).await.unwrap().unwrap();
        assert!(!stored.is_connected);
        assert_eq!(stored.users_online, 0);
        match fx.notifications.try_recv().unwrap() {
            DomainEvent::NodeConnectionLost { node_id, .. } => assert_eq!(node_id, node.id),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(fx.queues.get(QueueName::StartNode).depth(), 1);
    }

    #[tokio::test]
    async fn fleet_restart_triggers_coalesce_in_window() {
        let fx = fixture();
        assert_eq!(fx.service.restart_fleet(), EnqueueOutcome::Queued);
        assert_eq!(fx.service.restart_fleet(), EnqueueOutcome::RetryScheduled);
        assert_eq!(fx.service.restart_fleet(), EnqueueOutcome::Coalesced);
        // One immediate job plus the single delayed retry.
        assert_eq!(fx.queues.get(QueueName::FleetRestart).depth(), 2);
    }

    #[tokio::test]
    async fn profile_restart_disables_nodes_without_inbounds() {
        let fx = fixture();
        let profile = Uuid::new_v4();
        let mut bare = new_node("edge-1", 8443);
        bare.config_profile_id = Some(profile);
        bare.excluded_inbounds = vec!["vless-in".to_string()];
        let bare = fx.nodes.insert(bare).await.unwrap();
        let mut served = new_node("edge-2", 8444);
        served.config_profile_id = Some(profile);
        let served = fx.nodes.insert(served).await.unwrap();

        fx.service.start_all_by_profile(profile).await.unwrap();

        assert!(fx.nodes.get(bare.id).await.unwrap().unwrap().is_disabled);
        assert!(fx.nodes.get(served.id).await.unwrap().unwrap().is_connected);
        assert_eq!(fx.agent.calls_of("push_config").len(), 1);
    }

    /// Delegates to the in-memory repo but fails `apply_connectivity` while
    /// armed, so tests can exercise the start path's write failures.
    struct FailingConnectivityRepo {
        inner: Arc<MemoryNodeRepository>,
        fail_applies: AtomicBool,
    }

    #[async_trait]
    impl NodeRepository for FailingConnectivityRepo {
        async fn insert(&self, node: NewNode) -> RepoResult<node::Model> {
            self.inner.insert(node).await
        }
        async fn get(&self, id: i32) -> RepoResult<Option<node::Model>> {
            self.inner.get(id).await
        }
        async fn list_all(&self) -> RepoResult<Vec<node::Model>> {
            self.inner.list_all().await
        }
        async fn list_enabled(&self) -> RepoResult<Vec<node::Model>> {
            self.inner.list_enabled().await
        }
        async fn list_by_profile(&self, profile_id: Uuid) -> RepoResult<Vec<node::Model>> {
            self.inner.list_by_profile(profile_id).await
        }
        async fn apply_connectivity(
            &self,
            id: i32,
            patch: ConnectivityPatch,
        ) -> RepoResult<node::Model> {
            if self.fail_applies.load(Ordering::SeqCst) {
                return Err(RepositoryError::Database(sea_orm::DbErr::Custom(
                    "connection reset".into(),
                )));
            }
            self.inner.apply_connectivity(id, patch).await
        }
        async fn set_connecting(&self, id: i32, connecting: bool) -> RepoResult<()> {
            self.inner.set_connecting(id, connecting).await
        }
        async fn set_disabled(&self, id: i32, disabled: bool) -> RepoResult<()> {
            self.inner.set_disabled(id, disabled).await
        }
        async fn set_users_online(&self, id: i32, users_online: i32) -> RepoResult<()> {
            self.inner.set_users_online(id, users_online).await
        }
        async fn add_traffic(&self, id: i32, bytes: i64) -> RepoResult<()> {
            self.inner.add_traffic(id, bytes).await
        }
        async fn reset_cycle_traffic(&self, id: i32, now: DateTime<Utc>) -> RepoResult<()> {
            self.inner.reset_cycle_traffic(id, now).await
        }
        async fn delete(&self, id: i32) -> RepoResult<()> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn failed_connectivity_write_still_clears_connecting() {
        let inner = Arc::new(MemoryNodeRepository::new());
        let flaky = Arc::new(FailingConnectivityRepo {
            inner: Arc::clone(&inner),
            fail_applies: AtomicBool::new(false),
        });
        let users = Arc::new(MemoryUserRepository::new());
        let agent = Arc::new(MockAgent::new());
        let builder = Arc::new(StaticConfigBuilder::new(json!({
            "inbounds": [{"tag": "vless-in"}],
        })));
        let service = NodeService::new(
            Arc::clone(&flaky) as Arc<dyn NodeRepository>,
            users as Arc<dyn UserRepository>,
            agent as Arc<dyn NodeAgentClient>,
            builder,
            Arc::new(QueueSet::new()),
            Arc::new(EventBus::new()),
            Arc::new(Config::default()),
        );
        let node = inner.insert(new_node("edge-1", 8443)).await.unwrap();
        flaky.fail_applies.store(true, Ordering::SeqCst);

        let err = service.start_node(node.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Repository(_)));

        // The flag must not stay set, or health ticks skip the node forever.
        let stored = inner.get(node.id).await.unwrap().unwrap();
        assert!(!stored.is_connecting);
    }

    #[tokio::test]
    async fn delete_stops_agent_and_emits_event() {
        let mut fx = fixture();
        let node = fx.nodes.insert(new_node("edge-1", 8443)).await.unwrap();
        fx.service.start_node(node.id).await.unwrap();
        let _ = fx.notifications.try_recv();

        fx.service.delete_node(node.id).await.unwrap();

        assert!(fx.nodes.get(node.id).await.unwrap().is_none());
        assert_eq!(fx.agent.calls_of("stop").len(), 1);
        match fx.notifications.try_recv().unwrap() {
            DomainEvent::NodeDeleted { node_id, .. } => assert_eq!(node_id, node.id),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
