use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "user_status_enum")]
pub enum UserStatus {
    #[sea_orm(string_value = "ACTIVE")]
    Active,
    #[sea_orm(string_value = "LIMITED")]
    Limited,
    #[sea_orm(string_value = "EXPIRED")]
    Expired,
    #[sea_orm(string_value = "DISABLED")]
    Disabled,
}

impl UserStatus {
    /// Only active users are ever pushed to nodes.
    pub fn is_pushable(&self) -> bool {
        matches!(self, UserStatus::Active)
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "traffic_reset_strategy_enum")]
pub enum TrafficResetStrategy {
    #[sea_orm(string_value = "NO_RESET")]
    NoReset,
    #[sea_orm(string_value = "DAY")]
    Day,
    #[sea_orm(string_value = "WEEK")]
    Week,
    #[sea_orm(string_value = "MONTH")]
    Month,
    #[sea_orm(string_value = "YEAR")]
    Year,
    #[sea_orm(string_value = "CALENDAR_MONTH")]
    CalendarMonth,
}

impl TrafficResetStrategy {
    /// Window length for the rolling strategies. `None` for strategies that
    /// are not interval-based.
    pub fn rolling_days(&self) -> Option<i64> {
        match self {
            TrafficResetStrategy::Day => Some(1),
            TrafficResetStrategy::Week => Some(7),
            TrafficResetStrategy::Month => Some(30),
            TrafficResetStrategy::Year => Some(365),
            TrafficResetStrategy::NoReset | TrafficResetStrategy::CalendarMonth => None,
        }
    }
}

impl fmt::Display for TrafficResetStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
