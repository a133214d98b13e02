//! Top-level wiring: repositories, agent client, event bus, queues, worker
//! pools, services and the recurring task scheduler assembled into one
//! running engine.
//!
//! Exactly one orchestrator owns the fleet at a time; every queue, guard and
//! watermark lives inside it.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

use crate::agent::{ConfigBuilder, NodeAgentClient};
use crate::config::Config;
use crate::events::{DomainEvent, EventBus, NotificationEmitter};
use crate::jobs::{
    FleetRestartHandler, MembershipJobEnqueuer, NodeUsersHandler, StartNodeHandler,
    StopNodeHandler, UserLifecycleHandler,
};
use crate::queue::worker::WorkerPool;
use crate::queue::{QueueName, QueueSet};
use crate::repository::{NodeRepository, UsageRepository, UserRepository};
use crate::scheduler::{Scheduler, TaskId};
use crate::services::{NodeService, TrafficService, UserService};

pub struct Orchestrator {
    config: Arc<Config>,
    queues: Arc<QueueSet>,
    nodes: Arc<NodeService>,
    users: Arc<UserService>,
    traffic: Arc<TrafficService>,
    scheduler: Scheduler,
    pools: Vec<WorkerPool>,
}

impl Orchestrator {
    /// Builds the engine over the given collaborators. The returned receiver
    /// carries every domain event for the external delivery layer; dropping
    /// it silently discards notifications.
    pub fn new(
        node_repo: Arc<dyn NodeRepository>,
        user_repo: Arc<dyn UserRepository>,
        usage_repo: Arc<dyn UsageRepository>,
        agent: Arc<dyn NodeAgentClient>,
        builder: Arc<dyn ConfigBuilder>,
        config: Config,
    ) -> (Self, UnboundedReceiver<DomainEvent>) {
        let config = Arc::new(config);
        let queues = Arc::new(QueueSet::new());

        let (emitter, notifications) = NotificationEmitter::channel();
        let mut bus = EventBus::new();
        bus.subscribe(emitter);
        bus.subscribe(Arc::new(MembershipJobEnqueuer::new(Arc::clone(&queues))));
        let events = Arc::new(bus);

        let nodes = Arc::new(NodeService::new(
            Arc::clone(&node_repo),
            Arc::clone(&user_repo),
            Arc::clone(&agent),
            builder,
            Arc::clone(&queues),
            Arc::clone(&events),
            Arc::clone(&config),
        ));
        let users = Arc::new(UserService::new(
            Arc::clone(&user_repo),
            Arc::clone(&node_repo),
            Arc::clone(&usage_repo),
            Arc::clone(&agent),
            Arc::clone(&queues),
            Arc::clone(&events),
            Arc::clone(&config),
        ));
        let traffic = Arc::new(TrafficService::new(
            node_repo,
            user_repo,
            usage_repo,
            agent,
            Arc::clone(&config),
        ));

        let orchestrator = Orchestrator {
            config,
            queues,
            nodes,
            users,
            traffic,
            scheduler: Scheduler::new(),
            pools: Vec::new(),
        };
        (orchestrator, notifications)
    }

    pub fn node_service(&self) -> Arc<NodeService> {
        Arc::clone(&self.nodes)
    }

    pub fn user_service(&self) -> Arc<UserService> {
        Arc::clone(&self.users)
    }

    pub fn traffic_service(&self) -> Arc<TrafficService> {
        Arc::clone(&self.traffic)
    }

    pub fn queues(&self) -> Arc<QueueSet> {
        Arc::clone(&self.queues)
    }

    /// Spawns the worker pools and recurring tasks. Idempotent only in the
    /// sense that it must be called once; the caller owns that.
    pub fn start(&mut self) {
        self.pools.push(WorkerPool::start(
            self.queues.get(QueueName::StartNode),
            Arc::new(StartNodeHandler { nodes: Arc::clone(&self.nodes) }),
            self.config.node_queue_workers,
        ));
        self.pools.push(WorkerPool::start(
            self.queues.get(QueueName::StopNode),
            Arc::new(StopNodeHandler { nodes: Arc::clone(&self.nodes) }),
            self.config.node_queue_workers,
        ));
        // Fleet restarts are serialized: one at a time, ever.
        self.pools.push(WorkerPool::start(
            self.queues.get(QueueName::FleetRestart),
            Arc::new(FleetRestartHandler { nodes: Arc::clone(&self.nodes) }),
            1,
        ));
        self.pools.push(WorkerPool::start(
            self.queues.get(QueueName::NodeUsers),
            Arc::new(NodeUsersHandler { users: Arc::clone(&self.users) }),
            self.config.user_queue_workers,
        ));
        self.pools.push(WorkerPool::start(
            self.queues.get(QueueName::UserJobs),
            Arc::new(UserLifecycleHandler { users: Arc::clone(&self.users) }),
            self.config.user_queue_workers,
        ));

        let nodes = Arc::clone(&self.nodes);
        self.scheduler.register_inline(
            TaskId::NodeHealthCheck,
            self.config.health_check_interval,
            move || {
                let nodes = Arc::clone(&nodes);
                async move { nodes.health_check_tick().await }
            },
        );
        let traffic = Arc::clone(&self.traffic);
        self.scheduler.register_inline(
            TaskId::RecordUserUsage,
            self.config.usage_collect_interval,
            move || {
                let traffic = Arc::clone(&traffic);
                async move { traffic.collect_user_usage_tick().await }
            },
        );
        let traffic = Arc::clone(&self.traffic);
        self.scheduler.register_inline(
            TaskId::RecordOutboundUsage,
            self.config.outbound_collect_interval,
            move || {
                let traffic = Arc::clone(&traffic);
                async move { traffic.collect_outbound_usage_tick().await }
            },
        );
        let users = Arc::clone(&self.users);
        self.scheduler.register_inline(
            TaskId::ReviewUsers,
            self.config.user_review_interval,
            move || {
                let users = Arc::clone(&users);
                async move { users.review_tick().await }
            },
        );
        let users = Arc::clone(&self.users);
        self.scheduler.register_inline(
            TaskId::ResetRollingTraffic,
            self.config.traffic_reset_interval,
            move || {
                let users = Arc::clone(&users);
                async move { users.reset_rolling_tick().await }
            },
        );
        let users = Arc::clone(&self.users);
        self.scheduler.register_inline(
            TaskId::ResetCalendarTraffic,
            self.config.traffic_reset_interval,
            move || {
                let users = Arc::clone(&users);
                async move { users.reset_calendar_tick().await }
            },
        );
        let traffic = Arc::clone(&self.traffic);
        self.scheduler.register_inline(
            TaskId::ResetNodeTraffic,
            self.config.traffic_reset_interval,
            move || {
                let traffic = Arc::clone(&traffic);
                async move { traffic.reset_node_cycles_tick().await }
            },
        );
        let users = Arc::clone(&self.users);
        self.scheduler.register_inline(
            TaskId::NotifyThresholds,
            self.config.threshold_scan_interval,
            move || {
                let users = Arc::clone(&users);
                async move { users.threshold_tick().await }
            },
        );
        self.scheduler.start();
        info!("orchestrator started");
    }

    pub fn shutdown(&mut self) {
        self.scheduler.shutdown();
        for pool in &mut self.pools {
            pool.shutdown();
        }
        info!("orchestrator stopped");
    }
}
