use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One remote proxy-relay agent.
///
/// The three health facets are independent: `is_connected` (control channel
/// to the agent is up), `is_node_online` (agent process answered the last
/// probe), `is_xray_running` (proxy engine is serving). A running engine
/// implies a connected agent; lifecycle writes go through
/// [`crate::repository::ConnectivityPatch`], which cannot express the
/// inverse.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "nodes")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub name: String,
    pub address: String,
    pub port: i32,
    pub is_disabled: bool,
    /// Start sequence in flight; soft mutual exclusion against re-entrant starts.
    pub is_connecting: bool,
    pub is_connected: bool,
    pub is_node_online: bool,
    pub is_xray_running: bool,
    pub last_status_change: Option<ChronoDateTimeUtc>,
    pub last_status_message: Option<String>,
    pub config_profile_id: Option<Uuid>,
    /// Effective inbound tags this node serves (profile inbounds minus the
    /// exclusions). A node with an empty set must never receive a config.
    pub active_inbounds: Vec<String>,
    /// Profile inbounds administratively excluded from this node.
    pub excluded_inbounds: Vec<String>,
    pub xray_version: Option<String>,
    /// Hardware facts reported by the agent on the last successful start or
    /// probe.
    pub cpu_count: Option<i32>,
    pub mem_total_bytes: Option<i64>,
    pub users_online: i32,
    /// Bytes used in the current billing cycle.
    pub traffic_used_bytes: i64,
    pub traffic_limit_bytes: Option<i64>,
    /// Day of month on which the billing-cycle counter resets.
    pub traffic_reset_day: i32,
    pub traffic_last_reset_at: Option<ChronoDateTimeUtc>,
    /// Fixed-point cost weighting applied to reported bytes; 1000 = 1:1.
    pub consumption_multiplier_permille: i64,
    pub view_position: i32,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::usage_record::Entity")]
    UsageRecord,
}

impl Related<super::usage_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UsageRecord.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
