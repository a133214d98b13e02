use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::enums::{TrafficResetStrategy, UserStatus};

/// One proxied account.
///
/// `used_traffic_bytes` counts the current accounting period;
/// `lifetime_used_traffic_bytes` is never reset. `traffic_limit_bytes == 0`
/// means unlimited. `last_triggered_threshold` is the percent watermark used
/// so a threshold crossing is notified at most once.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub username: String,
    pub status: UserStatus,
    pub used_traffic_bytes: i64,
    pub lifetime_used_traffic_bytes: i64,
    pub traffic_limit_bytes: i64,
    pub traffic_limit_strategy: TrafficResetStrategy,
    pub last_traffic_reset_at: Option<ChronoDateTimeUtc>,
    pub expire_at: Option<ChronoDateTimeUtc>,
    pub last_triggered_threshold: i32,
    /// Inbound tags this user is a member of; a node carrying any of these
    /// inbounds is a push target while the user is active.
    pub active_inbounds: Vec<String>,
    pub vless_uuid: Uuid,
    pub trojan_password: String,
    pub ss_password: String,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::usage_record::Entity")]
    UsageRecord,
    #[sea_orm(has_many = "super::user_reset_history::Entity")]
    UserResetHistory,
}

impl Related<super::usage_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UsageRecord.def()
    }
}

impl Related<super::user_reset_history::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserResetHistory.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
