//! HTTP implementation of the node-agent client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    AgentAddr, AgentFailure, AgentResult, NodeAgentClient, OutboundStat, ProbeInfo, UserPayload,
    UserStat,
};

/// Envelope every agent endpoint answers with. The explicit bound keeps the
/// derive from requiring `T: Default` for the defaulted `response` field.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct AgentEnvelope<T> {
    ok: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    response: Option<T>,
}

pub struct HttpAgentClient {
    client: Client,
}

impl HttpAgentClient {
    pub fn new(timeout: Duration) -> AgentResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentFailure::new(format!("failed to build HTTP client: {e}")))?;
        Ok(HttpAgentClient { client })
    }

    fn url(addr: &AgentAddr, path: &str) -> String {
        format!("http://{}:{}{}", addr.host, addr.port, path)
    }

    async fn get<T: DeserializeOwned>(&self, addr: &AgentAddr, path: &str) -> AgentResult<T> {
        let response = self
            .client
            .get(Self::url(addr, path))
            .send()
            .await
            .map_err(|e| AgentFailure::new(format!("agent {addr} unreachable: {e}")))?;
        Self::unwrap_envelope(addr, response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        addr: &AgentAddr,
        path: &str,
        body: &B,
    ) -> AgentResult<T> {
        let response = self
            .client
            .post(Self::url(addr, path))
            .json(body)
            .send()
            .await
            .map_err(|e| AgentFailure::new(format!("agent {addr} unreachable: {e}")))?;
        Self::unwrap_envelope(addr, response).await
    }

    /// Acknowledgement-only endpoint: checks the envelope, discards the body.
    async fn post_unit<B: Serialize>(
        &self,
        addr: &AgentAddr,
        path: &str,
        body: &B,
    ) -> AgentResult<()> {
        let response = self
            .client
            .post(Self::url(addr, path))
            .json(body)
            .send()
            .await
            .map_err(|e| AgentFailure::new(format!("agent {addr} unreachable: {e}")))?;
        Self::check_envelope::<serde_json::Value>(addr, response).await.map(|_| ())
    }

    async fn unwrap_envelope<T: DeserializeOwned>(
        addr: &AgentAddr,
        response: reqwest::Response,
    ) -> AgentResult<T> {
        let envelope = Self::check_envelope(addr, response).await?;
        envelope
            .response
            .ok_or_else(|| AgentFailure::new(format!("agent {addr} sent empty response body")))
    }

    async fn check_envelope<T: DeserializeOwned>(
        addr: &AgentAddr,
        response: reqwest::Response,
    ) -> AgentResult<AgentEnvelope<T>> {
        let status = response.status();
        if !status.is_success() {
            return Err(AgentFailure::new(format!("agent {addr} returned {status}")));
        }
        let envelope: AgentEnvelope<T> = response
            .json()
            .await
            .map_err(|e| AgentFailure::new(format!("agent {addr} sent malformed payload: {e}")))?;
        if !envelope.ok {
            return Err(AgentFailure::new(
                envelope.message.unwrap_or_else(|| "agent reported failure".to_string()),
            ));
        }
        Ok(envelope)
    }
}

#[derive(Serialize)]
struct StatsQuery {
    reset: bool,
}

#[async_trait]
impl NodeAgentClient for HttpAgentClient {
    async fn probe_health(&self, addr: &AgentAddr) -> AgentResult<ProbeInfo> {
        self.get(addr, "/health").await
    }

    async fn push_config(
        &self,
        addr: &AgentAddr,
        config: &serde_json::Value,
    ) -> AgentResult<ProbeInfo> {
        self.post(addr, "/xray/start", config).await
    }

    async fn stop(&self, addr: &AgentAddr) -> AgentResult<()> {
        self.post_unit(addr, "/xray/stop", &serde_json::json!({})).await
    }

    async fn get_user_stats(&self, addr: &AgentAddr, reset: bool) -> AgentResult<Vec<UserStat>> {
        self.post(addr, "/stats/users", &StatsQuery { reset }).await
    }

    async fn get_outbound_stats(
        &self,
        addr: &AgentAddr,
        reset: bool,
    ) -> AgentResult<Vec<OutboundStat>> {
        self.post(addr, "/stats/outbounds", &StatsQuery { reset }).await
    }

    async fn add_user(&self, addr: &AgentAddr, payload: &UserPayload) -> AgentResult<()> {
        self.post_unit(addr, "/users/add", payload).await
    }

    async fn remove_user(&self, addr: &AgentAddr, payload: &UserPayload) -> AgentResult<()> {
        self.post_unit(addr, "/users/remove", payload).await
    }
}
