//! End-to-end flows over the in-memory repositories: events feeding queues,
//! queues feeding worker pools, services driving the fleet.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use relay_fleet::agent::{
    AgentAddr, AgentFailure, AgentResult, ConfigBuilder, NodeAgentClient, OutboundStat,
    ProbeInfo, StaticConfigBuilder, UserPayload, UserStat,
};
use relay_fleet::config::Config;
use relay_fleet::db::enums::{TrafficResetStrategy, UserStatus};
use relay_fleet::events::{DomainEvent, EventBus, NotificationEmitter};
use relay_fleet::jobs::{
    MembershipJobEnqueuer, NodeUsersHandler, StartNodeHandler, UserLifecycleHandler,
};
use relay_fleet::queue::worker::WorkerPool;
use relay_fleet::queue::{QueueName, QueueSet};
use relay_fleet::repository::memory::{
    MemoryNodeRepository, MemoryUsageRepository, MemoryUserRepository,
};
use relay_fleet::repository::{
    ConnectivityPatch, NewNode, NewUser, NodeRepository, UsageRepository, UserRepository,
};
use relay_fleet::services::{NodeService, TrafficService, UserService};
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Default)]
struct ScriptedAgent {
    calls: Mutex<Vec<String>>,
    down: Mutex<HashSet<String>>,
}

impl ScriptedAgent {
    fn mark_down(&self, addr: &str) {
        self.down.lock().unwrap().insert(addr.to_string());
    }

    fn mark_up(&self, addr: &str) {
        self.down.lock().unwrap().remove(addr);
    }

    fn calls_of(&self, op: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(op))
            .cloned()
            .collect()
    }

    fn record(&self, call: String, addr: &AgentAddr) -> AgentResult<()> {
        self.calls.lock().unwrap().push(call);
        if self.down.lock().unwrap().contains(&addr.to_string()) {
            return Err(AgentFailure::new(format!("connection refused ({addr})")));
        }
        Ok(())
    }

    fn probe_info() -> ProbeInfo {
        ProbeInfo {
            xray_running: true,
            xray_version: Some("1.8.4".to_string()),
            cpu_count: None,
            mem_total_bytes: None,
        }
    }
}

#[async_trait]
impl NodeAgentClient for ScriptedAgent {
    async fn probe_health(&self, addr: &AgentAddr) -> AgentResult<ProbeInfo> {
        self.record(format!("probe {addr}"), addr)?;
        Ok(Self::probe_info())
    }

    async fn push_config(
        &self,
        addr: &AgentAddr,
        _config: &serde_json::Value,
    ) -> AgentResult<ProbeInfo> {
        self.record(format!("push_config {addr}"), addr)?;
        Ok(Self::probe_info())
    }

    async fn stop(&self, addr: &AgentAddr) -> AgentResult<()> {
        self.record(format!("stop {addr}"), addr)
    }

    async fn get_user_stats(&self, addr: &AgentAddr, _reset: bool) -> AgentResult<Vec<UserStat>> {
        self.record(format!("user_stats {addr}"), addr)?;
        Ok(Vec::new())
    }

    async fn get_outbound_stats(
        &self,
        addr: &AgentAddr,
        _reset: bool,
    ) -> AgentResult<Vec<OutboundStat>> {
        self.record(format!("outbound_stats {addr}"), addr)?;
        Ok(Vec::new())
    }

    async fn add_user(&self, addr: &AgentAddr, payload: &UserPayload) -> AgentResult<()> {
        self.record(format!("add_user {addr} {}", payload.username), addr)
    }

    async fn remove_user(&self, addr: &AgentAddr, payload: &UserPayload) -> AgentResult<()> {
        self.record(format!("remove_user {addr} {}", payload.username), addr)
    }
}

struct Harness {
    nodes: Arc<MemoryNodeRepository>,
    users: Arc<MemoryUserRepository>,
    usage: Arc<MemoryUsageRepository>,
    agent: Arc<ScriptedAgent>,
    queues: Arc<QueueSet>,
    node_service: Arc<NodeService>,
    user_service: Arc<UserService>,
    traffic_service: Arc<TrafficService>,
    notifications: UnboundedReceiver<DomainEvent>,
    pools: Vec<WorkerPool>,
}

fn harness() -> Harness {
    let config = Arc::new(Config::default());
    let nodes = Arc::new(MemoryNodeRepository::new());
    let users = Arc::new(MemoryUserRepository::new());
    let usage = Arc::new(MemoryUsageRepository::new());
    let agent = Arc::new(ScriptedAgent::default());
    let queues = Arc::new(QueueSet::new());

    let (emitter, notifications) = NotificationEmitter::channel();
    let mut bus = EventBus::new();
    bus.subscribe(emitter);
    bus.subscribe(Arc::new(MembershipJobEnqueuer::new(Arc::clone(&queues))));
    let events = Arc::new(bus);

    let builder: Arc<dyn ConfigBuilder> = Arc::new(StaticConfigBuilder::new(json!({
        "inbounds": [{"tag": "vless-in"}, {"tag": "trojan-in"}],
    })));
    let node_service = Arc::new(NodeService::new(
        Arc::clone(&nodes) as Arc<dyn NodeRepository>,
        Arc::clone(&users) as Arc<dyn UserRepository>,
        Arc::clone(&agent) as Arc<dyn NodeAgentClient>,
        builder,
        Arc::clone(&queues),
        Arc::clone(&events),
        Arc::clone(&config),
    ));
    let user_service = Arc::new(UserService::new(
        Arc::clone(&users) as Arc<dyn UserRepository>,
        Arc::clone(&nodes) as Arc<dyn NodeRepository>,
        Arc::clone(&usage) as Arc<dyn UsageRepository>,
        Arc::clone(&agent) as Arc<dyn NodeAgentClient>,
        Arc::clone(&queues),
        Arc::clone(&events),
        Arc::clone(&config),
    ));
    let traffic_service = Arc::new(TrafficService::new(
        Arc::clone(&nodes) as Arc<dyn NodeRepository>,
        Arc::clone(&users) as Arc<dyn UserRepository>,
        Arc::clone(&usage) as Arc<dyn UsageRepository>,
        Arc::clone(&agent) as Arc<dyn NodeAgentClient>,
        Arc::clone(&config),
    ));

    let pools = vec![
        WorkerPool::start(
            queues.get(QueueName::StartNode),
            Arc::new(StartNodeHandler { nodes: Arc::clone(&node_service) }),
            2,
        ),
        WorkerPool::start(
            queues.get(QueueName::NodeUsers),
            Arc::new(NodeUsersHandler { users: Arc::clone(&user_service) }),
            4,
        ),
        WorkerPool::start(
            queues.get(QueueName::UserJobs),
            Arc::new(UserLifecycleHandler { users: Arc::clone(&user_service) }),
            4,
        ),
    ];

    Harness {
        nodes,
        users,
        usage,
        agent,
        queues,
        node_service,
        user_service,
        traffic_service,
        notifications,
        pools,
    }
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

fn new_user(username: &str, limit: i64) -> NewUser {
    NewUser {
        username: username.to_string(),
        traffic_limit_bytes: limit,
        traffic_limit_strategy: TrafficResetStrategy::NoReset,
        expire_at: None,
        active_inbounds: vec!["vless-in".to_string()],
    }
}

async fn connected_node(h: &Harness, name: &str, port: u16) -> i32 {
    let node = h.nodes.insert(new_node(name, port)).await.unwrap();
    h.nodes
        .apply_connectivity(node.id, ConnectivityPatch::online(None))
        .await
        .unwrap();
    node.id
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn limited_user_is_removed_from_each_connected_node_once() {
    let mut h = harness();
    connected_node(&h, "edge-1", 8443).await;
    connected_node(&h, "edge-2", 8444).await;
    h.nodes.insert(new_node("cold", 8445)).await.unwrap();
    let user = h.users.insert(new_user("ada", 100)).await.unwrap();
    h.users.increment_used_traffic(&[(user.id, 150)]).await.unwrap();

    h.user_service.review_tick().await;

    let agent = Arc::clone(&h.agent);
    wait_until("node-side removals", || agent.calls_of("remove_user").len() == 2).await;
    let removals: HashSet<String> = agent.calls_of("remove_user").into_iter().collect();
    assert_eq!(
        removals,
        HashSet::from([
            "remove_user 10.0.0.1:8443 ada".to_string(),
            "remove_user 10.0.0.1:8444 ada".to_string(),
        ])
    );
    assert_eq!(
        h.users.get(user.id).await.unwrap().unwrap().status,
        UserStatus::Limited
    );

    let event = h.notifications.recv().await.unwrap();
    match event {
        DomainEvent::UserLimited { user_id, .. } => assert_eq!(user_id, user.id),
        other => panic!("unexpected event {other:?}"),
    }
    // Exactly one limit event for one transition.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.notifications.try_recv().is_err());
}

#[tokio::test]
async fn unhealthy_node_heals_through_the_start_queue() {
    let mut h = harness();
    let node_id = connected_node(&h, "edge-1", 8443).await;

    // Burn the cold-start tick while the node is healthy.
    h.node_service.health_check_tick().await;
    while h.notifications.try_recv().is_ok() {}

    // Hold the heal queue so the start job cannot run before the agent
    // is reachable again.
    h.agent.mark_down("10.0.0.1:8443");
    let start_queue = h.queues.get(QueueName::StartNode);
    let pause = start_queue.pause();
    h.node_service.health_check_tick().await;
    match h.notifications.recv().await.unwrap() {
        DomainEvent::NodeConnectionLost { node_id: lost, .. } => assert_eq!(lost, node_id),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(start_queue.depth(), 1);

    h.agent.mark_up("10.0.0.1:8443");
    drop(pause);
    let nodes = Arc::clone(&h.nodes);
    wait_until("node to reconnect", || {
        futures::executor::block_on(nodes.get(node_id))
            .unwrap()
            .is_some_and(|n| n.is_connected && n.is_xray_running)
    })
    .await;
    match h.notifications.recv().await.unwrap() {
        DomainEvent::NodeConnectionRestored { node_id: restored, .. } => {
            assert_eq!(restored, node_id)
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn created_user_is_pushed_only_to_nodes_serving_their_inbounds() {
    let mut h = harness();
    connected_node(&h, "vless-node", 8443).await;
    let trojan = h.nodes.insert(new_node("trojan-node", 8444)).await.unwrap();
    h.nodes
        .apply_connectivity(trojan.id, ConnectivityPatch::online(None))
        .await
        .unwrap();
    // Node stays connected but serves a different inbound.
    let mut excluded = new_node("excluded-node", 8445);
    excluded.active_inbounds = vec!["trojan-in".to_string()];
    let excluded = h.nodes.insert(excluded).await.unwrap();
    h.nodes
        .apply_connectivity(excluded.id, ConnectivityPatch::online(None))
        .await
        .unwrap();

    h.user_service.create_user(new_user("ada", 0)).await.unwrap();

    let agent = Arc::clone(&h.agent);
    wait_until("membership push", || !agent.calls_of("add_user").is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let adds: HashSet<String> = agent.calls_of("add_user").into_iter().collect();
    assert_eq!(
        adds,
        HashSet::from([
            "add_user 10.0.0.1:8443 ada".to_string(),
            "add_user 10.0.0.1:8444 ada".to_string(),
        ])
    );
    match h.notifications.recv().await.unwrap() {
        DomainEvent::UserCreated { .. } => {}
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn usage_pipeline_skips_idle_nodes_entirely() {
    let h = harness();
    connected_node(&h, "edge-1", 8443).await;
    h.users.insert(new_user("ada", 0)).await.unwrap();

    h.traffic_service.collect_user_usage_tick().await;
    h.traffic_service.collect_outbound_usage_tick().await;

    assert!(h.usage.records().is_empty());
    assert_eq!(
        h.users
            .list_active()
            .await
            .unwrap()
            .iter()
            .map(|u| u.used_traffic_bytes)
            .sum::<i64>(),
        0
    );
    drop(h.pools);
}

#[tokio::test]
async fn repeated_enable_schedules_a_single_start() {
    let h = harness();
    let node = h.nodes.insert(new_node("edge-1", 8443)).await.unwrap();
    let queue = h.queues.get(QueueName::StartNode);
    let _pause = queue.pause();

    h.node_service.enable_node(node.id).await.unwrap();
    h.node_service.enable_node(node.id).await.unwrap();
    h.node_service.enable_node(node.id).await.unwrap();

    assert_eq!(queue.depth(), 1);
}
