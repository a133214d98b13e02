//! In-memory repositories backing tests and the embedded mode. Semantics
//! mirror the Postgres implementations in `db::services`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::db::entities::{node, usage_record, user, user_reset_history};
use crate::db::enums::{TrafficResetStrategy, UserStatus};

use super::{
    ConnectivityPatch, NewNode, NewUsageRecord, NewUser, NodeRepository, RepoResult,
    RepositoryError, ThresholdCrossing, UsageRepository, UserRepository,
};

#[derive(Default)]
pub struct MemoryNodeRepository {
    nodes: DashMap<i32, node::Model>,
    next_id: AtomicI32,
}

impl MemoryNodeRepository {
    pub fn new() -> Self {
        MemoryNodeRepository {
            nodes: DashMap::new(),
            next_id: AtomicI32::new(1),
        }
    }

    /// Rewrites the timestamps a cycle-reset scan keys on.
    pub fn backdate(&self, id: i32, created_at: DateTime<Utc>, last_reset: Option<DateTime<Utc>>) {
        if let Some(mut entry) = self.nodes.get_mut(&id) {
            entry.created_at = created_at;
            entry.traffic_last_reset_at = last_reset;
        }
    }
}

#[async_trait]
impl NodeRepository for MemoryNodeRepository {
    async fn insert(&self, new: NewNode) -> RepoResult<node::Model> {
        let now = Utc::now();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let model = node::Model {
            id,
            name: new.name,
            address: new.address,
            port: i32::from(new.port),
            is_disabled: false,
            is_connecting: false,
            is_connected: false,
            is_node_online: false,
            is_xray_running: false,
            last_status_change: None,
            last_status_message: None,
            config_profile_id: new.config_profile_id,
            active_inbounds: new.active_inbounds,
            excluded_inbounds: new.excluded_inbounds,
            xray_version: None,
            cpu_count: None,
            mem_total_bytes: None,
            users_online: 0,
            traffic_used_bytes: 0,
            traffic_limit_bytes: new.traffic_limit_bytes,
            traffic_reset_day: i32::from(new.traffic_reset_day),
            traffic_last_reset_at: None,
            consumption_multiplier_permille: new.consumption_multiplier_permille,
            view_position: new.view_position,
            created_at: now,
            updated_at: now,
        };
        self.nodes.insert(id, model.clone());
        Ok(model)
    }

    async fn get(&self, id: i32) -> RepoResult<Option<node::Model>> {
        Ok(self.nodes.get(&id).map(|n| n.clone()))
    }

    async fn list_all(&self) -> RepoResult<Vec<node::Model>> {
        let mut all: Vec<node::Model> = self.nodes.iter().map(|n| n.clone()).collect();
        all.sort_by_key(|n| (n.view_position, n.id));
        Ok(all)
    }

    async fn list_enabled(&self) -> RepoResult<Vec<node::Model>> {
        Ok(self.list_all().await?.into_iter().filter(|n| !n.is_disabled).collect())
    }

    async fn list_by_profile(&self, profile_id: Uuid) -> RepoResult<Vec<node::Model>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|n| n.config_profile_id == Some(profile_id))
            .collect())
    }

    async fn apply_connectivity(
        &self,
        id: i32,
        patch: ConnectivityPatch,
    ) -> RepoResult<node::Model> {
        let mut entry = self.nodes.get_mut(&id).ok_or(RepositoryError::NodeNotFound(id))?;
        let n = entry.value_mut();
        n.is_connected = patch.connected();
        n.is_node_online = patch.node_online();
        n.is_xray_running = patch.xray_running();
        n.last_status_message = patch.status_message;
        if let Some(version) = patch.xray_version {
            n.xray_version = Some(version);
        }
        if let Some(cpu) = patch.cpu_count {
            n.cpu_count = Some(cpu);
        }
        if let Some(mem) = patch.mem_total_bytes {
            n.mem_total_bytes = Some(mem);
        }
        if patch.clear_connecting {
            n.is_connecting = false;
        }
        if patch.zero_users_online {
            n.users_online = 0;
        }
        n.last_status_change = Some(Utc::now());
        n.updated_at = Utc::now();
        Ok(n.clone())
    }

    async fn set_connecting(&self, id: i32, connecting: bool) -> RepoResult<()> {
        let mut entry = self.nodes.get_mut(&id).ok_or(RepositoryError::NodeNotFound(id))?;
        entry.is_connecting = connecting;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn set_disabled(&self, id: i32, disabled: bool) -> RepoResult<()> {
        let mut entry = self.nodes.get_mut(&id).ok_or(RepositoryError::NodeNotFound(id))?;
        entry.is_disabled = disabled;
        if disabled {
            entry.is_connecting = false;
        }
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn set_users_online(&self, id: i32, users_online: i32) -> RepoResult<()> {
        let mut entry = self.nodes.get_mut(&id).ok_or(RepositoryError::NodeNotFound(id))?;
        entry.users_online = users_online;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn add_traffic(&self, id: i32, bytes: i64) -> RepoResult<()> {
        let mut entry = self.nodes.get_mut(&id).ok_or(RepositoryError::NodeNotFound(id))?;
        entry.traffic_used_bytes += bytes;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_cycle_traffic(&self, id: i32, now: DateTime<Utc>) -> RepoResult<()> {
        let mut entry = self.nodes.get_mut(&id).ok_or(RepositoryError::NodeNotFound(id))?;
        entry.traffic_used_bytes = 0;
        entry.traffic_last_reset_at = Some(now);
        entry.updated_at = now;
        Ok(())
    }

    async fn delete(&self, id: i32) -> RepoResult<()> {
        self.nodes.remove(&id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryUserRepository {
    users: DashMap<Uuid, user::Model>,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        MemoryUserRepository { users: DashMap::new() }
    }

    fn collect_where<F: Fn(&user::Model) -> bool>(&self, pred: F) -> Vec<user::Model> {
        self.users.iter().filter(|u| pred(u.value())).map(|u| u.clone()).collect()
    }

    /// Rewrites the timestamps a reset-due scan keys on.
    pub fn backdate(&self, id: Uuid, created_at: DateTime<Utc>, last_reset: Option<DateTime<Utc>>) {
        if let Some(mut entry) = self.users.get_mut(&id) {
            entry.created_at = created_at;
            entry.last_traffic_reset_at = last_reset;
        }
    }
}

fn reset_reference(u: &user::Model) -> DateTime<Utc> {
    u.last_traffic_reset_at.unwrap_or(u.created_at)
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn insert(&self, new: NewUser) -> RepoResult<user::Model> {
        let now = Utc::now();
        let model = user::Model {
            id: Uuid::new_v4(),
            username: new.username,
            status: UserStatus::Active,
            used_traffic_bytes: 0,
            lifetime_used_traffic_bytes: 0,
            traffic_limit_bytes: new.traffic_limit_bytes,
            traffic_limit_strategy: new.traffic_limit_strategy,
            last_traffic_reset_at: None,
            expire_at: new.expire_at,
            last_triggered_threshold: 0,
            active_inbounds: new.active_inbounds,
            vless_uuid: Uuid::new_v4(),
            trojan_password: super::generate_secret(24),
            ss_password: super::generate_secret(24),
            created_at: now,
            updated_at: now,
        };
        self.users.insert(model.id, model.clone());
        Ok(model)
    }

    async fn get(&self, id: Uuid) -> RepoResult<Option<user::Model>> {
        Ok(self.users.get(&id).map(|u| u.clone()))
    }

    async fn get_by_username(&self, username: &str) -> RepoResult<Option<user::Model>> {
        Ok(self
            .users
            .iter()
            .find(|u| u.username == username)
            .map(|u| u.clone()))
    }

    async fn list_active(&self) -> RepoResult<Vec<user::Model>> {
        Ok(self.collect_where(|u| u.status == UserStatus::Active))
    }

    async fn resolve_usernames(&self, usernames: &[String]) -> RepoResult<HashMap<String, Uuid>> {
        let mut out = HashMap::with_capacity(usernames.len());
        for u in self.users.iter() {
            if usernames.contains(&u.username) {
                out.insert(u.username.clone(), u.id);
            }
        }
        Ok(out)
    }

    async fn set_status(&self, id: Uuid, status: UserStatus) -> RepoResult<()> {
        let mut entry = self.users.get_mut(&id).ok_or(RepositoryError::UserNotFound(id))?;
        entry.status = status;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_used_traffic(&self, deltas: &[(Uuid, i64)]) -> RepoResult<()> {
        for (id, bytes) in deltas {
            if let Some(mut entry) = self.users.get_mut(id) {
                entry.used_traffic_bytes += bytes;
                entry.lifetime_used_traffic_bytes += bytes;
                entry.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn transition_exceeded(&self) -> RepoResult<Vec<user::Model>> {
        let mut affected = Vec::new();
        for mut entry in self.users.iter_mut() {
            let u = entry.value_mut();
            if u.status == UserStatus::Active
                && u.traffic_limit_bytes != 0
                && u.used_traffic_bytes >= u.traffic_limit_bytes
            {
                affected.push(u.clone());
                u.status = UserStatus::Limited;
                u.updated_at = Utc::now();
            }
        }
        Ok(affected)
    }

    async fn transition_expired(&self, now: DateTime<Utc>) -> RepoResult<Vec<user::Model>> {
        let mut affected = Vec::new();
        for mut entry in self.users.iter_mut() {
            let u = entry.value_mut();
            if u.status == UserStatus::Active && u.expire_at.is_some_and(|at| at <= now) {
                affected.push(u.clone());
                u.status = UserStatus::Expired;
                u.updated_at = Utc::now();
            }
        }
        Ok(affected)
    }

    async fn due_for_rolling_reset(
        &self,
        strategy: TrafficResetStrategy,
        now: DateTime<Utc>,
    ) -> RepoResult<Vec<user::Model>> {
        let Some(days) = strategy.rolling_days() else {
            return Ok(Vec::new());
        };
        Ok(self.collect_where(|u| {
            u.traffic_limit_strategy == strategy
                && now - reset_reference(u) >= Duration::days(days)
        }))
    }

    async fn due_for_calendar_reset(&self, now: DateTime<Utc>) -> RepoResult<Vec<user::Model>> {
        Ok(self.collect_where(|u| {
            if u.traffic_limit_strategy != TrafficResetStrategy::CalendarMonth {
                return false;
            }
            let reference = reset_reference(u);
            // Due once per calendar month; the post-reset stamp makes a
            // second run on the same day a no-op.
            (reference.year(), reference.month()) != (now.year(), now.month())
        }))
    }

    async fn reset_traffic(&self, id: Uuid, now: DateTime<Utc>) -> RepoResult<i64> {
        let mut entry = self.users.get_mut(&id).ok_or(RepositoryError::UserNotFound(id))?;
        let pre = entry.used_traffic_bytes;
        entry.used_traffic_bytes = 0;
        entry.last_triggered_threshold = 0;
        entry.last_traffic_reset_at = Some(now);
        entry.updated_at = now;
        Ok(pre)
    }

    async fn advance_thresholds(&self, thresholds: &[u8]) -> RepoResult<Vec<ThresholdCrossing>> {
        let mut crossings = Vec::new();
        for mut entry in self.users.iter_mut() {
            let u = entry.value_mut();
            if u.status != UserStatus::Active || u.traffic_limit_bytes <= 0 {
                continue;
            }
            let percent = ((u.used_traffic_bytes as i128 * 100)
                / u.traffic_limit_bytes as i128)
                .min(100) as i32;
            let reached = thresholds
                .iter()
                .rev()
                .find(|t| i32::from(**t) <= percent)
                .copied();
            if let Some(reached) = reached {
                if i32::from(reached) > u.last_triggered_threshold {
                    u.last_triggered_threshold = i32::from(reached);
                    u.updated_at = Utc::now();
                    crossings.push(ThresholdCrossing {
                        user_id: u.id,
                        username: u.username.clone(),
                        percent: reached,
                    });
                }
            }
        }
        Ok(crossings)
    }

    async fn delete(&self, id: Uuid) -> RepoResult<()> {
        self.users.remove(&id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryUsageRepository {
    records: Mutex<Vec<usage_record::Model>>,
    resets: Mutex<Vec<user_reset_history::Model>>,
    next_id: AtomicI64,
}

impl MemoryUsageRepository {
    pub fn new() -> Self {
        MemoryUsageRepository {
            records: Mutex::new(Vec::new()),
            resets: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn records(&self) -> Vec<usage_record::Model> {
        self.records.lock().expect("usage records lock").clone()
    }

    pub fn resets(&self) -> Vec<user_reset_history::Model> {
        self.resets.lock().expect("reset history lock").clone()
    }
}

#[async_trait]
impl UsageRepository for MemoryUsageRepository {
    async fn append(&self, records: Vec<NewUsageRecord>) -> RepoResult<()> {
        let mut store = self.records.lock().expect("usage records lock");
        for r in records {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            store.push(usage_record::Model {
                id,
                node_id: r.node_id,
                user_id: r.user_id,
                upload_bytes: r.upload_bytes,
                download_bytes: r.download_bytes,
                total_bytes: r.total_bytes,
                recorded_at: r.recorded_at,
            });
        }
        Ok(())
    }

    async fn record_reset(
        &self,
        user_id: Uuid,
        pre_reset_bytes: i64,
        reset_at: DateTime<Utc>,
    ) -> RepoResult<()> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.resets.lock().expect("reset history lock").push(user_reset_history::Model {
            id,
            user_id,
            pre_reset_bytes,
            reset_at,
        });
        Ok(())
    }
}
