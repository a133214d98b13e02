//! Traffic accounting: pulls reset-on-read counters off every connected
//! node, scales them by the node's consumption multiplier, appends immutable
//! usage records and advances the per-user and per-node counters.
//!
//! A node's counters are consumed the moment they are read; everything after
//! the read must tolerate partial completion without re-reading (the agent
//! has already zeroed its side).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Datelike, Utc};
use tracing::{debug, warn};

use crate::agent::{NodeAgentClient, OutboundStat, UserStat};
use crate::config::Config;
use crate::db::entities::node;
use crate::fanout::fan_out;
use crate::repository::{NewUsageRecord, NodeRepository, UsageRepository, UserRepository};
use crate::services::{agent_addr, ServiceResult};

pub struct TrafficService {
    nodes: Arc<dyn NodeRepository>,
    users: Arc<dyn UserRepository>,
    usage: Arc<dyn UsageRepository>,
    agent: Arc<dyn NodeAgentClient>,
    config: Arc<Config>,
}

/// Applies a node's consumption multiplier. 1000 permille is the 1:1 common
/// case and bypasses the widening arithmetic.
fn scale(bytes: i64, permille: i64) -> i64 {
    if permille == 1000 {
        bytes
    } else {
        ((i128::from(bytes) * i128::from(permille)) / 1000) as i64
    }
}

impl TrafficService {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        users: Arc<dyn UserRepository>,
        usage: Arc<dyn UsageRepository>,
        agent: Arc<dyn NodeAgentClient>,
        config: Arc<Config>,
    ) -> Self {
        TrafficService { nodes, users, usage, agent, config }
    }

    async fn connected_nodes(&self) -> ServiceResult<Vec<node::Model>> {
        Ok(self
            .nodes
            .list_enabled()
            .await?
            .into_iter()
            .filter(|n| n.is_connected)
            .collect())
    }

    /// Recurring per-user collection tick. Unreachable nodes are skipped;
    /// their counters keep accumulating agent-side until the next read.
    pub async fn collect_user_usage_tick(&self) {
        let nodes = match self.connected_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("usage collection skipped, cannot list nodes: {e}");
                return;
            }
        };
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
                async move { agent.get_user_stats(&agent_addr(&node), true).await }
            },
        )
        .await;

        for outcome in outcomes {
            let node = &by_id[&outcome.node_id];
            match outcome.result {
                Ok(stats) => {
                    if let Err(e) = self.record_user_stats(node, stats).await {
                        warn!(node_id = node.id, "usage bookkeeping failed: {e}");
                    }
                }
                Err(failure) => {
                    debug!(node_id = node.id, "user stats collection failed: {failure}");
                }
            }
        }
    }

    async fn record_user_stats(
        &self,
        node: &node::Model,
        stats: Vec<UserStat>,
    ) -> ServiceResult<()> {
        let online: std::collections::HashSet<&str> =
            stats.iter().map(|s| s.username.as_str()).collect();
        self.nodes.set_users_online(node.id, online.len() as i32).await?;
        let reporting: Vec<UserStat> = stats
            .into_iter()
            .filter(|s| s.uplink_bytes + s.downlink_bytes > 0)
            .collect();
        if reporting.is_empty() {
            return Ok(());
        }

        let usernames: Vec<String> = reporting.iter().map(|s| s.username.clone()).collect();
        let ids = self.users.resolve_usernames(&usernames).await?;

        let now = Utc::now();
        let permille = node.consumption_multiplier_permille;
        let mut records = Vec::with_capacity(reporting.len());
        let mut deltas = Vec::with_capacity(reporting.len());
        let mut node_total = 0i64;
        for stat in &reporting {
            let Some(user_id) = ids.get(&stat.username) else {
                debug!(node_id = node.id, username = %stat.username,
                    "unknown account in node stats, dropping");
                continue;
            };
            let upload = scale(stat.uplink_bytes, permille);
            let download = scale(stat.downlink_bytes, permille);
            let total = upload + download;
            node_total += total;
            records.push(NewUsageRecord {
                node_id: node.id,
                user_id: Some(*user_id),
                upload_bytes: upload,
                download_bytes: download,
                total_bytes: total,
                recorded_at: now,
            });
            deltas.push((*user_id, total));
        }
        if records.is_empty() {
            return Ok(());
        }

        self.usage.append(records).await?;
        for chunk in deltas.chunks(self.config.traffic_chunk_size.max(1)) {
            self.users.increment_used_traffic(chunk).await?;
        }
        self.nodes.add_traffic(node.id, node_total).await?;
        debug!(node_id = node.id, bytes = node_total, users = deltas.len(), "usage recorded");
        Ok(())
    }

    /// Recurring outbound collection tick. Outbound totals are node-level
    /// facts; they are archived but never attributed to a user.
    pub async fn collect_outbound_usage_tick(&self) {
        let nodes = match self.connected_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("outbound collection skipped, cannot list nodes: {e}");
                return;
            }
        };
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
                async move { agent.get_outbound_stats(&agent_addr(&node), true).await }
            },
        )
        .await;

        for outcome in outcomes {
            let node = &by_id[&outcome.node_id];
            match outcome.result {
                Ok(stats) => {
                    if let Err(e) = self.record_outbound_stats(node, stats).await {
                        warn!(node_id = node.id, "outbound bookkeeping failed: {e}");
                    }
                }
                Err(failure) => {
                    debug!(node_id = node.id, "outbound stats collection failed: {failure}");
                }
            }
        }
    }

    async fn record_outbound_stats(
        &self,
        node: &node::Model,
        stats: Vec<OutboundStat>,
    ) -> ServiceResult<()> {
        let permille = node.consumption_multiplier_permille;
        let upload: i64 = stats.iter().map(|s| scale(s.uplink_bytes, permille)).sum();
        let download: i64 = stats.iter().map(|s| scale(s.downlink_bytes, permille)).sum();
        let total = upload + download;
        if total == 0 {
            return Ok(());
        }
        self.usage
            .append(vec![NewUsageRecord {
                node_id: node.id,
                user_id: None,
                upload_bytes: upload,
                download_bytes: download,
                total_bytes: total,
                recorded_at: Utc::now(),
            }])
            .await?;
        debug!(node_id = node.id, bytes = total, "outbound usage recorded");
        Ok(())
    }

    /// Recurring node billing-cycle reset. A node is due once per calendar
    /// month, on or after its configured reset day.
    pub async fn reset_node_cycles_tick(&self) {
        let now = Utc::now();
        let nodes = match self.nodes.list_all().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("node cycle reset skipped, cannot list nodes: {e}");
                return;
            }
        };
        for node in nodes {
            let reference = node.traffic_last_reset_at.unwrap_or(node.created_at);
            let new_month = (reference.year(), reference.month()) != (now.year(), now.month());
            if !new_month || (now.day() as i32) < node.traffic_reset_day {
                continue;
            }
            match self.nodes.reset_cycle_traffic(node.id, now).await {
                Ok(()) => debug!(node_id = node.id,
                    pre_reset_bytes = node.traffic_used_bytes, "node cycle counter reset"),
                Err(e) => warn!(node_id = node.id, "node cycle reset failed: {e}"),
            }
        }
    }
}
