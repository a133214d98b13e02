//! Client boundary to the remote node-agent.
//!
//! Every call returns a uniform [`AgentResult`]; transport errors, timeouts
//! and error payloads from the agent all surface as an [`AgentFailure`]
//! value. Nothing crosses this boundary as a panic or an escaping error
//! type, so fan-out callers can treat any failure identically.

pub mod http;

pub use http::HttpAgentClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::entities::user;

/// Failure reported by (or on behalf of) a node agent. A timeout is
/// indistinguishable from an explicit error response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentFailure {
    pub message: String,
}

impl AgentFailure {
    pub fn new(message: impl Into<String>) -> Self {
        AgentFailure { message: message.into() }
    }
}

impl std::fmt::Display for AgentFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for AgentFailure {}

pub type AgentResult<T> = Result<T, AgentFailure>;

/// Snapshot reported by a health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeInfo {
    pub xray_running: bool,
    pub xray_version: Option<String>,
    pub cpu_count: Option<i32>,
    pub mem_total_bytes: Option<i64>,
}

/// Per-user byte counters since the previous (resetting) read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStat {
    pub username: String,
    pub uplink_bytes: i64,
    pub downlink_bytes: i64,
}

/// Per-outbound byte counters since the previous (resetting) read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundStat {
    pub tag: String,
    pub uplink_bytes: i64,
    pub downlink_bytes: i64,
}

/// Wire credentials for one inbound protocol. The protocol set is closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum InboundCredentials {
    Trojan { password: String },
    Vless { uuid: Uuid, flow: Option<String> },
    Shadowsocks { password: String, method: String },
}

/// Membership payload pushed to (or removed from) a node for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPayload {
    pub username: String,
    pub inbound_tags: Vec<String>,
    pub credentials: Vec<InboundCredentials>,
}

impl UserPayload {
    pub fn for_user(u: &user::Model) -> Self {
        UserPayload {
            username: u.username.clone(),
            inbound_tags: u.active_inbounds.clone(),
            credentials: vec![
                InboundCredentials::Vless { uuid: u.vless_uuid, flow: None },
                InboundCredentials::Trojan { password: u.trojan_password.clone() },
                InboundCredentials::Shadowsocks {
                    password: u.ss_password.clone(),
                    method: "chacha20-ietf-poly1305".to_string(),
                },
            ],
        }
    }

    /// Removal only needs the account identity.
    pub fn removal(username: impl Into<String>) -> Self {
        UserPayload {
            username: username.into(),
            inbound_tags: Vec::new(),
            credentials: Vec::new(),
        }
    }
}

/// Network endpoint of one node agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentAddr {
    pub host: String,
    pub port: u16,
}

impl AgentAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        AgentAddr { host: host.into(), port }
    }
}

impl std::fmt::Display for AgentAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[async_trait]
pub trait NodeAgentClient: Send + Sync {
    async fn probe_health(&self, addr: &AgentAddr) -> AgentResult<ProbeInfo>;
    /// Pushes a full configuration; the agent (re)starts its proxy engine
    /// with it. Idempotent on the agent side.
    async fn push_config(&self, addr: &AgentAddr, config: &serde_json::Value)
        -> AgentResult<ProbeInfo>;
    async fn stop(&self, addr: &AgentAddr) -> AgentResult<()>;
    /// `reset` flips the agent-side counters to reset-on-read.
    async fn get_user_stats(&self, addr: &AgentAddr, reset: bool) -> AgentResult<Vec<UserStat>>;
    async fn get_outbound_stats(
        &self,
        addr: &AgentAddr,
        reset: bool,
    ) -> AgentResult<Vec<OutboundStat>>;
    async fn add_user(&self, addr: &AgentAddr, payload: &UserPayload) -> AgentResult<()>;
    async fn remove_user(&self, addr: &AgentAddr, payload: &UserPayload) -> AgentResult<()>;
}

/// Builds the opaque engine configuration pushed verbatim to nodes.
pub trait ConfigBuilder: Send + Sync {
    fn build_config(&self, excluded_inbounds: &[String]) -> serde_json::Value;
}

/// Config builder over a fixed template; excluded inbounds are filtered out
/// of the template's `inbounds` array by tag.
pub struct StaticConfigBuilder {
    template: serde_json::Value,
}

impl StaticConfigBuilder {
    pub fn new(template: serde_json::Value) -> Self {
        StaticConfigBuilder { template }
    }
}

impl ConfigBuilder for StaticConfigBuilder {
    fn build_config(&self, excluded_inbounds: &[String]) -> serde_json::Value {
        let mut config = self.template.clone();
        if let Some(inbounds) = config.get_mut("inbounds").and_then(|v| v.as_array_mut()) {
            inbounds.retain(|inbound| {
                inbound
                    .get("tag")
                    .and_then(|t| t.as_str())
                    .is_none_or(|tag| !excluded_inbounds.iter().any(|e| e == tag))
            });
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn static_builder_filters_excluded_inbounds() {
        let builder = StaticConfigBuilder::new(json!({
            "inbounds": [
                {"tag": "vless-in", "port": 443},
                {"tag": "trojan-in", "port": 8443},
            ],
            "outbounds": [{"tag": "direct"}],
        }));
        let config = builder.build_config(&["trojan-in".to_string()]);
        let tags: Vec<&str> = config["inbounds"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["tag"].as_str().unwrap())
            .collect();
        assert_eq!(tags, vec!["vless-in"]);
    }

    #[test]
    fn credentials_cover_every_protocol_once() {
        let payload = UserPayload {
            username: "u".into(),
            inbound_tags: vec![],
            credentials: vec![
                InboundCredentials::Vless { uuid: Uuid::new_v4(), flow: None },
                InboundCredentials::Trojan { password: "p".into() },
                InboundCredentials::Shadowsocks {
                    password: "p".into(),
                    method: "chacha20-ietf-poly1305".into(),
                },
            ],
        };
        let encoded = serde_json::to_value(&payload).unwrap();
        let protocols: Vec<&str> = encoded["credentials"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["protocol"].as_str().unwrap())
            .collect();
        assert_eq!(protocols, vec!["vless", "trojan", "shadowsocks"]);
    }
}
