//! Orchestration services: the decision layer between the registry and the
//! fleet. Node lifecycle, user lifecycle and traffic accounting each get one
//! service; queues and the scheduler drive them.

pub mod node_service;
pub mod traffic_service;
pub mod user_service;

use thiserror::Error;

use crate::agent::{AgentAddr, AgentFailure};
use crate::db::entities::{node, user};
use crate::repository::RepositoryError;

pub use node_service::NodeService;
pub use traffic_service::TrafficService;
pub use user_service::UserService;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("node agent: {0}")]
    Agent(AgentFailure),
    #[error("{failed} of {total} nodes failed: {first_error}")]
    PartialFanout { failed: usize, total: usize, first_error: String },
}

pub type ServiceResult<T> = Result<T, ServiceError>;

pub(crate) fn agent_addr(node: &node::Model) -> AgentAddr {
    AgentAddr::new(node.address.clone(), node.port as u16)
}

/// Inbound tags the node actually serves.
pub(crate) fn effective_inbounds(node: &node::Model) -> Vec<&str> {
    node.active_inbounds
        .iter()
        .map(String::as_str)
        .filter(|tag| !node.excluded_inbounds.iter().any(|e| e == tag))
        .collect()
}

/// True when the node serves at least one of the user's inbounds.
pub(crate) fn shares_inbound(node: &node::Model, user: &user::Model) -> bool {
    let served = effective_inbounds(node);
    user.active_inbounds.iter().any(|tag| served.contains(&tag.as_str()))
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory agent double shared by the service tests. Records every
    //! call and fails any endpoint whose address was marked unreachable.

    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::agent::{
        AgentAddr, AgentFailure, AgentResult, NodeAgentClient, OutboundStat, ProbeInfo,
        UserPayload, UserStat,
    };

    #[derive(Default)]
    pub struct MockAgent {
        pub calls: Mutex<Vec<String>>,
        pub down: Mutex<HashSet<String>>,
        pub user_stats: Mutex<HashMap<String, Vec<UserStat>>>,
        pub outbound_stats: Mutex<HashMap<String, Vec<OutboundStat>>>,
    }

    impl MockAgent {
        pub fn new() -> Self {
            MockAgent::default()
        }

        pub fn mark_down(&self, addr: &str) {
            self.down.lock().unwrap().insert(addr.to_string());
        }

        pub fn mark_up(&self, addr: &str) {
            self.down.lock().unwrap().remove(addr);
        }

        pub fn set_user_stats(&self, addr: &str, stats: Vec<UserStat>) {
            self.user_stats.lock().unwrap().insert(addr.to_string(), stats);
        }

        pub fn set_outbound_stats(&self, addr: &str, stats: Vec<OutboundStat>) {
            self.outbound_stats.lock().unwrap().insert(addr.to_string(), stats);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn calls_of(&self, op: &str) -> Vec<String> {
            self.calls().into_iter().filter(|c| c.starts_with(op)).collect()
        }

        fn record(&self, op: &str, addr: &AgentAddr) -> AgentResult<()> {
            self.calls.lock().unwrap().push(format!("{op} {addr}"));
            if self.down.lock().unwrap().contains(&addr.to_string()) {
                return Err(AgentFailure::new(format!("connection refused ({addr})")));
            }
            Ok(())
        }

        fn probe_info() -> ProbeInfo {
            ProbeInfo {
                xray_running: true,
                xray_version: Some("1.8.4".to_string()),
                cpu_count: Some(2),
                mem_total_bytes: Some(1 << 30),
            }
        }
    }

    #[async_trait]
    impl NodeAgentClient for MockAgent {
        async fn probe_health(&self, addr: &AgentAddr) -> AgentResult<ProbeInfo> {
            self.record("probe", addr)?;
            Ok(Self::probe_info())
        }

        async fn push_config(
            &self,
            addr: &AgentAddr,
            _config: &serde_json::Value,
        ) -> AgentResult<ProbeInfo> {
            self.record("push_config", addr)?;
            Ok(Self::probe_info())
        }

        async fn stop(&self, addr: &AgentAddr) -> AgentResult<()> {
            self.record("stop", addr)
        }

        async fn get_user_stats(
            &self,
            addr: &AgentAddr,
            reset: bool,
        ) -> AgentResult<Vec<UserStat>> {
            self.record("user_stats", addr)?;
            let mut map = self.user_stats.lock().unwrap();
            let key = addr.to_string();
            let stats = if reset {
                map.remove(&key).unwrap_or_default()
            } else {
                map.get(&key).cloned().unwrap_or_default()
            };
            Ok(stats)
        }

        async fn get_outbound_stats(
            &self,
            addr: &AgentAddr,
            reset: bool,
        ) -> AgentResult<Vec<OutboundStat>> {
            self.record("outbound_stats", addr)?;
            let mut map = self.outbound_stats.lock().unwrap();
            let key = addr.to_string();
            let stats = if reset {
                map.remove(&key).unwrap_or_default()
            } else {
                map.get(&key).cloned().unwrap_or_default()
            };
            Ok(stats)
        }

        async fn add_user(&self, addr: &AgentAddr, payload: &UserPayload) -> AgentResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("add_user {addr} {}", payload.username));
            if self.down.lock().unwrap().contains(&addr.to_string()) {
                return Err(AgentFailure::new(format!("connection refused ({addr})")));
            }
            Ok(())
        }

        async fn remove_user(&self, addr: &AgentAddr, payload: &UserPayload) -> AgentResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("remove_user {addr} {}", payload.username));
            if self.down.lock().unwrap().contains(&addr.to_string()) {
                return Err(AgentFailure::new(format!("connection refused ({addr})")));
            }
            Ok(())
        }
    }
}
