//! SeaORM entities for the orchestration engine's durable state.

pub mod node;
pub mod usage_record;
pub mod user;
pub mod user_reset_history;

pub mod prelude {
    pub use super::node::Entity as Node;
    pub use super::node::Model as NodeModel;

    pub use super::user::Entity as User;
    pub use super::user::Model as UserModel;

    pub use super::usage_record::Entity as UsageRecord;
    pub use super::usage_record::Model as UsageRecordModel;

    pub use super::user_reset_history::Entity as UserResetHistory;
    pub use super::user_reset_history::Model as UserResetHistoryModel;
}
