//! Persistence boundary consumed by the orchestration engine.
//!
//! All registry mutation goes through these traits as narrow, field-scoped
//! operations, so concurrent pipelines touching unrelated fields of the same
//! row (health check vs. accounting) cannot clobber each other.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::db::entities::{node, user};
use crate::db::enums::{TrafficResetStrategy, UserStatus};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("node {0} not found")]
    NodeNotFound(i32),
    #[error("user {0} not found")]
    UserNotFound(Uuid),
}

pub type RepoResult<T> = Result<T, RepositoryError>;

/// Connectivity update for one node. The three facets can only be produced
/// through the constructors, which cannot express `xray_running` without
/// `is_connected`.
#[derive(Debug, Clone)]
pub struct ConnectivityPatch {
    connected: bool,
    node_online: bool,
    xray_running: bool,
    pub status_message: Option<String>,
    pub xray_version: Option<String>,
    pub cpu_count: Option<i32>,
    pub mem_total_bytes: Option<i64>,
    pub clear_connecting: bool,
    pub zero_users_online: bool,
}

impl ConnectivityPatch {
    /// Agent reachable and the proxy engine is serving.
    pub fn online(xray_version: Option<String>) -> Self {
        ConnectivityPatch {
            connected: true,
            node_online: true,
            xray_running: true,
            status_message: None,
            xray_version,
            cpu_count: None,
            mem_total_bytes: None,
            clear_connecting: true,
            zero_users_online: false,
        }
    }

    /// Agent reachable but the proxy engine is not serving.
    pub fn connected_not_running(message: impl Into<String>) -> Self {
        ConnectivityPatch {
            connected: true,
            node_online: true,
            xray_running: false,
            status_message: Some(message.into()),
            xray_version: None,
            cpu_count: None,
            mem_total_bytes: None,
            clear_connecting: true,
            zero_users_online: false,
        }
    }

    /// Agent unreachable or push failed.
    pub fn offline(message: impl Into<String>) -> Self {
        ConnectivityPatch {
            connected: false,
            node_online: false,
            xray_running: false,
            status_message: Some(message.into()),
            xray_version: None,
            cpu_count: None,
            mem_total_bytes: None,
            clear_connecting: true,
            zero_users_online: true,
        }
    }

    /// Attach the hardware facts from a probe. `None` values leave the stored
    /// columns untouched.
    pub fn with_hardware(mut self, cpu_count: Option<i32>, mem_total_bytes: Option<i64>) -> Self {
        self.cpu_count = cpu_count;
        self.mem_total_bytes = mem_total_bytes;
        self
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn node_online(&self) -> bool {
        self.node_online
    }

    pub fn xray_running(&self) -> bool {
        self.xray_running
    }
}

#[derive(Debug, Clone)]
pub struct NewNode {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub config_profile_id: Option<Uuid>,
    pub active_inbounds: Vec<String>,
    pub excluded_inbounds: Vec<String>,
    pub traffic_limit_bytes: Option<i64>,
    pub traffic_reset_day: u8,
    pub consumption_multiplier_permille: i64,
    pub view_position: i32,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub traffic_limit_bytes: i64,
    pub traffic_limit_strategy: TrafficResetStrategy,
    pub expire_at: Option<DateTime<Utc>>,
    pub active_inbounds: Vec<String>,
}

/// One user crossing a configured percent-of-limit threshold, reported by the
/// watermark-advancing scan exactly once per crossing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdCrossing {
    pub user_id: Uuid,
    pub username: String,
    pub percent: u8,
}

/// Random wire secret for freshly created accounts.
pub(crate) fn generate_secret(len: usize) -> String {
    use rand::distr::Alphanumeric;
    use rand::Rng;
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[async_trait]
pub trait NodeRepository: Send + Sync {
    async fn insert(&self, node: NewNode) -> RepoResult<node::Model>;
    async fn get(&self, id: i32) -> RepoResult<Option<node::Model>>;
    async fn list_all(&self) -> RepoResult<Vec<node::Model>>;
    /// Nodes that are fan-out eligible (not administratively disabled).
    async fn list_enabled(&self) -> RepoResult<Vec<node::Model>>;
    async fn list_by_profile(&self, profile_id: Uuid) -> RepoResult<Vec<node::Model>>;
    /// Applies a connectivity patch and stamps `last_status_change`.
    /// Returns the updated row.
    async fn apply_connectivity(&self, id: i32, patch: ConnectivityPatch)
        -> RepoResult<node::Model>;
    async fn set_connecting(&self, id: i32, connecting: bool) -> RepoResult<()>;
    /// Disabling also clears `is_connecting`: a disabled node is never
    /// mid-start.
    async fn set_disabled(&self, id: i32, disabled: bool) -> RepoResult<()>;
    async fn set_users_online(&self, id: i32, users_online: i32) -> RepoResult<()>;
    async fn add_traffic(&self, id: i32, bytes: i64) -> RepoResult<()>;
    /// Zeroes the billing-cycle counter and stamps the reset time.
    async fn reset_cycle_traffic(&self, id: i32, now: DateTime<Utc>) -> RepoResult<()>;
    async fn delete(&self, id: i32) -> RepoResult<()>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn insert(&self, user: NewUser) -> RepoResult<user::Model>;
    async fn get(&self, id: Uuid) -> RepoResult<Option<user::Model>>;
    async fn get_by_username(&self, username: &str) -> RepoResult<Option<user::Model>>;
    async fn list_active(&self) -> RepoResult<Vec<user::Model>>;
    /// Maps reported usernames to user ids; unknown names are absent from the
    /// result, not an error.
    async fn resolve_usernames(&self, usernames: &[String]) -> RepoResult<HashMap<String, Uuid>>;
    async fn set_status(&self, id: Uuid, status: UserStatus) -> RepoResult<()>;
    /// Adds the given deltas to both the period and lifetime counters.
    /// Callers chunk; one call is one bounded statement.
    async fn increment_used_traffic(&self, deltas: &[(Uuid, i64)]) -> RepoResult<()>;
    /// Set-based transition of every active user at or over a nonzero limit
    /// to LIMITED. Returns the affected rows as they were before the write.
    async fn transition_exceeded(&self) -> RepoResult<Vec<user::Model>>;
    /// Set-based transition of every active user past expiry to EXPIRED.
    async fn transition_expired(&self, now: DateTime<Utc>) -> RepoResult<Vec<user::Model>>;
    async fn due_for_rolling_reset(
        &self,
        strategy: TrafficResetStrategy,
        now: DateTime<Utc>,
    ) -> RepoResult<Vec<user::Model>>;
    async fn due_for_calendar_reset(&self, now: DateTime<Utc>) -> RepoResult<Vec<user::Model>>;
    /// Zeroes the period counter and stamps the reset time. Returns the
    /// pre-reset byte count.
    async fn reset_traffic(&self, id: Uuid, now: DateTime<Utc>) -> RepoResult<i64>;
    /// Advances each active user's threshold watermark to the highest
    /// configured percent their usage has reached, returning only users whose
    /// watermark moved. `thresholds` must be sorted ascending.
    async fn advance_thresholds(&self, thresholds: &[u8]) -> RepoResult<Vec<ThresholdCrossing>>;
    async fn delete(&self, id: Uuid) -> RepoResult<()>;
}

#[derive(Debug, Clone)]
pub struct NewUsageRecord {
    pub node_id: i32,
    pub user_id: Option<Uuid>,
    pub upload_bytes: i64,
    pub download_bytes: i64,
    pub total_bytes: i64,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// Appends immutable usage facts. Never updates existing rows.
    async fn append(&self, records: Vec<NewUsageRecord>) -> RepoResult<()>;
    /// Records the pre-reset counter value for a user traffic reset.
    async fn record_reset(
        &self,
        user_id: Uuid,
        pre_reset_bytes: i64,
        reset_at: DateTime<Utc>,
    ) -> RepoResult<()>;
}
