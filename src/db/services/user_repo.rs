use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait,
    IntoActiveModel, QueryFilter, QuerySelect, Set, Statement, TransactionTrait,
};
use uuid::Uuid;

use crate::db::entities::user;
use crate::db::enums::{TrafficResetStrategy, UserStatus};
use crate::repository::{
    generate_secret, NewUser, RepoResult, RepositoryError, ThresholdCrossing, UserRepository,
};

pub struct PgUserRepository {
    db: DatabaseConnection,
}

impl PgUserRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        PgUserRepository { db }
    }

    /// Set-based status transition: selects the matching rows under lock,
    /// flips them in one statement and returns the pre-write images.
    async fn transition_where(
        &self,
        filter: sea_orm::Condition,
        to: UserStatus,
    ) -> RepoResult<Vec<user::Model>> {
        let txn = self.db.begin().await?;
        let affected = user::Entity::find()
            .filter(filter)
            .lock_exclusive()
            .all(&txn)
            .await?;
        if affected.is_empty() {
            txn.commit().await?;
            return Ok(affected);
        }
        let ids: Vec<Uuid> = affected.iter().map(|u| u.id).collect();
        user::Entity::update_many()
            .col_expr(user::Column::Status, Expr::value(to))
            .col_expr(user::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(user::Column::Id.is_in(ids))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(affected)
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn insert(&self, new: NewUser) -> RepoResult<user::Model> {
        let now = Utc::now();
        let active = user::ActiveModel {
            id: Set(Uuid::new_v4()),
            username: Set(new.username),
            status: Set(UserStatus::Active),
            used_traffic_bytes: Set(0),
            lifetime_used_traffic_bytes: Set(0),
            traffic_limit_bytes: Set(new.traffic_limit_bytes),
            traffic_limit_strategy: Set(new.traffic_limit_strategy),
            last_traffic_reset_at: Set(None),
            expire_at: Set(new.expire_at),
            last_triggered_threshold: Set(0),
            active_inbounds: Set(new.active_inbounds),
            vless_uuid: Set(Uuid::new_v4()),
            trojan_password: Set(generate_secret(24)),
            ss_password: Set(generate_secret(24)),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Ok(active.insert(&self.db).await?)
    }

    async fn get(&self, id: Uuid) -> RepoResult<Option<user::Model>> {
        Ok(user::Entity::find_by_id(id).one(&self.db).await?)
    }

    async fn get_by_username(&self, username: &str) -> RepoResult<Option<user::Model>> {
        Ok(user::Entity::find()
            .filter(user::Column::Username.eq(username))
            .one(&self.db)
            .await?)
    }

    async fn list_active(&self) -> RepoResult<Vec<user::Model>> {
        Ok(user::Entity::find()
            .filter(user::Column::Status.eq(UserStatus::Active))
            .all(&self.db)
            .await?)
    }

    async fn resolve_usernames(&self, usernames: &[String]) -> RepoResult<HashMap<String, Uuid>> {
        let rows = user::Entity::find()
            .filter(user::Column::Username.is_in(usernames.to_vec()))
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(|u| (u.username, u.id)).collect())
    }

    async fn set_status(&self, id: Uuid, status: UserStatus) -> RepoResult<()> {
        let result = user::Entity::update_many()
            .col_expr(user::Column::Status, Expr::value(status))
            .col_expr(user::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(user::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(RepositoryError::UserNotFound(id));
        }
        Ok(())
    }

    async fn increment_used_traffic(&self, deltas: &[(Uuid, i64)]) -> RepoResult<()> {
        if deltas.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = deltas.iter().map(|(id, _)| *id).collect();
        let bytes: Vec<i64> = deltas.iter().map(|(_, b)| *b).collect();
        self.db
            .execute(Statement::from_sql_and_values(
                DbBackend::Postgres,
                r#"UPDATE users AS u
                   SET used_traffic_bytes = u.used_traffic_bytes + d.bytes,
                       lifetime_used_traffic_bytes = u.lifetime_used_traffic_bytes + d.bytes,
                       updated_at = $3
                   FROM (SELECT unnest($1::uuid[]) AS id, unnest($2::bigint[]) AS bytes) AS d
                   WHERE u.id = d.id"#,
                [ids.into(), bytes.into(), Utc::now().into()],
            ))
            .await?;
        Ok(())
    }

    async fn transition_exceeded(&self) -> RepoResult<Vec<user::Model>> {
        let filter = sea_orm::Condition::all()
            .add(user::Column::Status.eq(UserStatus::Active))
            .add(user::Column::TrafficLimitBytes.ne(0i64))
            .add(Expr::cust("used_traffic_bytes >= traffic_limit_bytes"));
        self.transition_where(filter, UserStatus::Limited).await
    }

    async fn transition_expired(&self, now: DateTime<Utc>) -> RepoResult<Vec<user::Model>> {
        let filter = sea_orm::Condition::all()
            .add(user::Column::Status.eq(UserStatus::Active))
            .add(user::Column::ExpireAt.lte(now));
        self.transition_where(filter, UserStatus::Expired).await
    }

    async fn due_for_rolling_reset(
        &self,
        strategy: TrafficResetStrategy,
        now: DateTime<Utc>,
    ) -> RepoResult<Vec<user::Model>> {
        let Some(days) = strategy.rolling_days() else {
            return Ok(Vec::new());
        };
        let cutoff = now - Duration::days(days);
        Ok(user::Entity::find()
            .filter(user::Column::TrafficLimitStrategy.eq(strategy))
            .filter(Expr::cust_with_values(
                "COALESCE(last_traffic_reset_at, created_at) <= ?",
                [cutoff],
            ))
            .all(&self.db)
            .await?)
    }

    async fn due_for_calendar_reset(&self, now: DateTime<Utc>) -> RepoResult<Vec<user::Model>> {
        Ok(user::Entity::find()
            .filter(user::Column::TrafficLimitStrategy.eq(TrafficResetStrategy::CalendarMonth))
            .filter(Expr::cust_with_values(
                "date_trunc('month', COALESCE(last_traffic_reset_at, created_at)) <> date_trunc('month', ?)",
                [now],
            ))
            .all(&self.db)
            .await?)
    }

    async fn reset_traffic(&self, id: Uuid, now: DateTime<Utc>) -> RepoResult<i64> {
        let txn = self.db.begin().await?;
        let model = user::Entity::find_by_id(id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or(RepositoryError::UserNotFound(id))?;
        let pre_reset = model.used_traffic_bytes;
        let mut active = model.into_active_model();
        active.used_traffic_bytes = Set(0);
        active.last_triggered_threshold = Set(0);
        active.last_traffic_reset_at = Set(Some(now));
        active.updated_at = Set(now);
        active.update(&txn).await?;
        txn.commit().await?;
        Ok(pre_reset)
    }

    async fn advance_thresholds(&self, thresholds: &[u8]) -> RepoResult<Vec<ThresholdCrossing>> {
        let Some(min_threshold) = thresholds.first().copied() else {
            return Ok(Vec::new());
        };
        let txn = self.db.begin().await?;
        let candidates = user::Entity::find()
            .filter(user::Column::Status.eq(UserStatus::Active))
            .filter(user::Column::TrafficLimitBytes.gt(0i64))
            .filter(Expr::cust_with_values(
                "used_traffic_bytes * 100 >= traffic_limit_bytes * ?",
                [i64::from(min_threshold)],
            ))
            .lock_exclusive()
            .all(&txn)
            .await?;

        let mut crossings = Vec::new();
        let mut groups: HashMap<u8, Vec<Uuid>> = HashMap::new();
        for u in candidates {
            let percent = ((i128::from(u.used_traffic_bytes) * 100)
                / i128::from(u.traffic_limit_bytes))
            .min(100) as i32;
            let Some(reached) = thresholds.iter().rev().find(|t| i32::from(**t) <= percent)
            else {
                continue;
            };
            if i32::from(*reached) > u.last_triggered_threshold {
                groups.entry(*reached).or_default().push(u.id);
                crossings.push(ThresholdCrossing {
                    user_id: u.id,
                    username: u.username,
                    percent: *reached,
                });
            }
        }
        for (threshold, ids) in groups {
            user::Entity::update_many()
                .col_expr(
                    user::Column::LastTriggeredThreshold,
                    Expr::value(i32::from(threshold)),
                )
                .col_expr(user::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(user::Column::Id.is_in(ids))
                .exec(&txn)
                .await?;
        }
        txn.commit().await?;
        Ok(crossings)
    }

    async fn delete(&self, id: Uuid) -> RepoResult<()> {
        user::Entity::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }
}
