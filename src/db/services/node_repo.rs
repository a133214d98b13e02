use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::db::entities::node;
use crate::repository::{
    ConnectivityPatch, NewNode, NodeRepository, RepoResult, RepositoryError,
};

pub struct PgNodeRepository {
    db: DatabaseConnection,
}

impl PgNodeRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        PgNodeRepository { db }
    }
}

#[async_trait]
impl NodeRepository for PgNodeRepository {
    async fn insert(&self, new: NewNode) -> RepoResult<node::Model> {
        let now = Utc::now();
        let active = node::ActiveModel {
            name: Set(new.name),
            address: Set(new.address),
            port: Set(i32::from(new.port)),
            is_disabled: Set(false),
            is_connecting: Set(false),
            is_connected: Set(false),
            is_node_online: Set(false),
            is_xray_running: Set(false),
            last_status_change: Set(None),
            last_status_message: Set(None),
            config_profile_id: Set(new.config_profile_id),
            active_inbounds: Set(new.active_inbounds),
            excluded_inbounds: Set(new.excluded_inbounds),
            xray_version: Set(None),
            cpu_count: Set(None),
            mem_total_bytes: Set(None),
            users_online: Set(0),
            traffic_used_bytes: Set(0),
            traffic_limit_bytes: Set(new.traffic_limit_bytes),
            traffic_reset_day: Set(i32::from(new.traffic_reset_day)),
            traffic_last_reset_at: Set(None),
            consumption_multiplier_permille: Set(new.consumption_multiplier_permille),
            view_position: Set(new.view_position),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };
        Ok(active.insert(&self.db).await?)
    }

    async fn get(&self, id: i32) -> RepoResult<Option<node::Model>> {
        Ok(node::Entity::find_by_id(id).one(&self.db).await?)
    }

    async fn list_all(&self) -> RepoResult<Vec<node::Model>> {
        Ok(node::Entity::find()
            .order_by_asc(node::Column::ViewPosition)
            .all(&self.db)
            .await?)
    }

    async fn list_enabled(&self) -> RepoResult<Vec<node::Model>> {
        Ok(node::Entity::find()
            .filter(node::Column::IsDisabled.eq(false))
            .order_by_asc(node::Column::ViewPosition)
            .all(&self.db)
            .await?)
    }

    async fn list_by_profile(&self, profile_id: Uuid) -> RepoResult<Vec<node::Model>> {
        Ok(node::Entity::find()
            .filter(node::Column::ConfigProfileId.eq(profile_id))
            .order_by_asc(node::Column::ViewPosition)
            .all(&self.db)
            .await?)
    }

    async fn apply_connectivity(
        &self,
        id: i32,
        patch: ConnectivityPatch,
    ) -> RepoResult<node::Model> {
        let txn = self.db.begin().await?;
        let model = node::Entity::find_by_id(id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or(RepositoryError::NodeNotFound(id))?;
        let now = Utc::now();
        let mut active = model.into_active_model();
        active.is_connected = Set(patch.connected());
        active.is_node_online = Set(patch.node_online());
        active.is_xray_running = Set(patch.xray_running());
        active.last_status_change = Set(Some(now));
        active.last_status_message = Set(patch.status_message.clone());
        if patch.xray_version.is_some() {
            active.xray_version = Set(patch.xray_version.clone());
        }
        if patch.cpu_count.is_some() {
            active.cpu_count = Set(patch.cpu_count);
        }
        if patch.mem_total_bytes.is_some() {
            active.mem_total_bytes = Set(patch.mem_total_bytes);
        }
        if patch.clear_connecting {
            active.is_connecting = Set(false);
        }
        if patch.zero_users_online {
            active.users_online = Set(0);
        }
        active.updated_at = Set(now);
        let updated = active.update(&txn).await?;
        txn.commit().await?;
        Ok(updated)
    }

    async fn set_connecting(&self, id: i32, connecting: bool) -> RepoResult<()> {
        let result = node::Entity::update_many()
            .col_expr(node::Column::IsConnecting, Expr::value(connecting))
            .col_expr(node::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(node::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(RepositoryError::NodeNotFound(id));
        }
        Ok(())
    }

    async fn set_disabled(&self, id: i32, disabled: bool) -> RepoResult<()> {
        let mut update = node::Entity::update_many()
            .col_expr(node::Column::IsDisabled, Expr::value(disabled))
            .col_expr(node::Column::UpdatedAt, Expr::value(Utc::now()));
        if disabled {
            update = update.col_expr(node::Column::IsConnecting, Expr::value(false));
        }
        let result = update.filter(node::Column::Id.eq(id)).exec(&self.db).await?;
        if result.rows_affected == 0 {
            return Err(RepositoryError::NodeNotFound(id));
        }
        Ok(())
    }

    async fn set_users_online(&self, id: i32, users_online: i32) -> RepoResult<()> {
        let result = node::Entity::update_many()
            .col_expr(node::Column::UsersOnline, Expr::value(users_online))
            .col_expr(node::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(node::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(RepositoryError::NodeNotFound(id));
        }
        Ok(())
    }

    async fn add_traffic(&self, id: i32, bytes: i64) -> RepoResult<()> {
        let result = node::Entity::update_many()
            .col_expr(
                node::Column::TrafficUsedBytes,
                Expr::col(node::Column::TrafficUsedBytes).add(bytes),
            )
            .col_expr(node::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(node::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(RepositoryError::NodeNotFound(id));
        }
        Ok(())
    }

    async fn reset_cycle_traffic(&self, id: i32, now: DateTime<Utc>) -> RepoResult<()> {
        let result = node::Entity::update_many()
            .col_expr(node::Column::TrafficUsedBytes, Expr::value(0i64))
            .col_expr(node::Column::TrafficLastResetAt, Expr::value(Some(now)))
            .col_expr(node::Column::UpdatedAt, Expr::value(now))
            .filter(node::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(RepositoryError::NodeNotFound(id));
        }
        Ok(())
    }

    async fn delete(&self, id: i32) -> RepoResult<()> {
        node::Entity::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }
}
