use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{DatabaseConnection, EntityTrait, Set};
use uuid::Uuid;

use crate::db::entities::{usage_record, user_reset_history};
use crate::repository::{NewUsageRecord, RepoResult, UsageRepository};

pub struct PgUsageRepository {
    db: DatabaseConnection,
}

impl PgUsageRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        PgUsageRepository { db }
    }
}

#[async_trait]
impl UsageRepository for PgUsageRepository {
    async fn append(&self, records: Vec<NewUsageRecord>) -> RepoResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let rows = records.into_iter().map(|r| usage_record::ActiveModel {
            node_id: Set(r.node_id),
            user_id: Set(r.user_id),
            upload_bytes: Set(r.upload_bytes),
            download_bytes: Set(r.download_bytes),
            total_bytes: Set(r.total_bytes),
            recorded_at: Set(r.recorded_at),
            ..Default::default()
        });
        usage_record::Entity::insert_many(rows).exec(&self.db).await?;
        Ok(())
    }

    async fn record_reset(
        &self,
        user_id: Uuid,
        pre_reset_bytes: i64,
        reset_at: DateTime<Utc>,
    ) -> RepoResult<()> {
        let row = user_reset_history::ActiveModel {
            user_id: Set(user_id),
            pre_reset_bytes: Set(pre_reset_bytes),
            reset_at: Set(reset_at),
            ..Default::default()
        };
        user_reset_history::Entity::insert(row).exec(&self.db).await?;
        Ok(())
    }
}
