//! 数据同步服务
//!
//! 混合推拉模型：分发成功的告警实时推送到主题；客户端按水位线
//! 拉取快照与增量；周期性向快照主题广播有界快照供新加入的
//! 客户端引导。快照按客户端缓存，过期时间等于快照间隔。

use crate::config::SyncSettings;
use crate::db::RedisPool;
use crate::errors::AppError;
use crate::models::AlarmEvent;
use crate::services::HistoryService;
use crate::utils;
use crate::websocket::{severity_topic, WsHub, TOPIC_ALL, TOPIC_SNAPSHOT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// 同步缓存键
mod sync_keys {
    pub const SNAPSHOT: &str = "vesta:sync:snapshot";
    pub const LAST_UPDATE: &str = "vesta:sync:last-update";
}

/// 告警快照（客户端以 timestamp 作为下次同步的水位线）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmSnapshot {
    pub alarms: Vec<AlarmEvent>,
    pub timestamp: DateTime<Utc>,
    pub count: usize,
    /// 历史后端降级时为 true（对应 503 式的降级提示）
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_type: Option<String>,
}

/// 同步统计
#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub push_updates: u64,
    pub pull_snapshots: u64,
    pub pull_deltas: u64,
    pub broadcasts: u64,
    pub active_clients: usize,
}

/// 数据同步服务
pub struct SyncService {
    history: Arc<HistoryService>,
    redis_pool: Arc<RedisPool>,
    hub: Arc<WsHub>,
    settings: SyncSettings,
    /// 客户端 -> 最近一次快照水位线
    watermarks: RwLock<HashMap<String, DateTime<Utc>>>,
    push_updates: AtomicU64,
    pull_snapshots: AtomicU64,
    pull_deltas: AtomicU64,
    broadcasts: AtomicU64,
}

impl SyncService {
    pub fn new(
        history: Arc<HistoryService>,
        redis_pool: Arc<RedisPool>,
        hub: Arc<WsHub>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            history,
            redis_pool,
            hub,
            settings,
            watermarks: RwLock::new(HashMap::new()),
            push_updates: AtomicU64::new(0),
            pull_snapshots: AtomicU64::new(0),
            pull_deltas: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
        }
    }

    // ========== 推 ==========

    /// 推送一条分发成功的告警到全量与级别主题
    pub async fn push_alarm_update(&self, alarm: &AlarmEvent) -> Result<(), AppError> {
        let payload = serde_json::to_string(alarm)?;

        self.hub.publish(TOPIC_ALL, &payload);
        self.hub.publish(&severity_topic(alarm.severity), &payload);

        // 最后更新时间戳写缓存失败不影响推送本身
        if let Err(e) = self
            .redis_pool
            .set(sync_keys::LAST_UPDATE, &utils::format_iso8601(&Utc::now()))
            .await
        {
            tracing::warn!(error = %e, "同步最后更新时间写入失败");
        }

        self.push_updates.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(alarm_id = alarm.id, "告警已推送");
        Ok(())
    }

    // ========== 拉 ==========

    /// 客户端快照：自 since（缺省一小时前）以来的告警，
    /// 截断到单次快照上限，并推进该客户端的水位线
    pub async fn snapshot(
        &self,
        client_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<AlarmSnapshot, AppError> {
        let now = Utc::now();
        let since = since.unwrap_or_else(|| utils::hours_ago(1));

        let page = self.history.in_window(since, now).await;
        let mut alarms = page.alarms;
        if alarms.len() > self.settings.max_events_per_snapshot {
            alarms.truncate(self.settings.max_events_per_snapshot);
        }

        let snapshot = AlarmSnapshot {
            count: alarms.len(),
            alarms,
            timestamp: now,
            degraded: page.degraded,
            snapshot_type: None,
        };

        self.watermarks
            .write()
            .expect("水位线表锁中毒")
            .insert(client_id.to_string(), now);

        // 按客户端缓存快照，TTL 为快照间隔
        let cache_key = format!("{}:{}", sync_keys::SNAPSHOT, client_id);
        if let Err(e) = self
            .redis_pool
            .set_ex(&cache_key, &snapshot, self.settings.snapshot_interval_seconds)
            .await
        {
            tracing::warn!(client_id, error = %e, "快照缓存失败");
        }

        self.pull_snapshots.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(client_id, count = snapshot.count, "快照已生成");
        Ok(snapshot)
    }

    /// 客户端增量：自该客户端上次快照水位线以来的告警
    pub async fn delta(&self, client_id: &str) -> Result<AlarmSnapshot, AppError> {
        let since = self
            .watermarks
            .read()
            .expect("水位线表锁中毒")
            .get(client_id)
            .copied()
            .unwrap_or_else(|| utils::hours_ago(1));

        let now = Utc::now();
        let page = self.history.in_window(since, now).await;

        self.pull_deltas.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(client_id, count = page.alarms.len(), "增量已生成");

        Ok(AlarmSnapshot {
            count: page.alarms.len(),
            alarms: page.alarms,
            timestamp: now,
            degraded: page.degraded,
            snapshot_type: None,
        })
    }

    /// 读取客户端的缓存快照
    pub async fn cached_snapshot(&self, client_id: &str) -> Result<Option<AlarmSnapshot>, AppError> {
        let cache_key = format!("{}:{}", sync_keys::SNAPSHOT, client_id);
        self.redis_pool.get(&cache_key).await
    }

    // ========== 广播 ==========

    /// 向快照主题广播最近一小时的有界快照（周期调度执行）
    pub async fn broadcast_snapshot(&self) -> Result<usize, AppError> {
        let now = Utc::now();
        let page = self.history.in_window(utils::hours_ago(1), now).await;

        let mut alarms = page.alarms;
        if alarms.len() > self.settings.max_events_per_snapshot {
            alarms.truncate(self.settings.max_events_per_snapshot);
        }

        let snapshot = AlarmSnapshot {
            count: alarms.len(),
            alarms,
            timestamp: now,
            degraded: page.degraded,
            snapshot_type: Some("periodic-snapshot".to_string()),
        };

        let payload = serde_json::to_string(&snapshot)?;
        let delivered = self.hub.publish(TOPIC_SNAPSHOT, &payload);

        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        tracing::info!(count = snapshot.count, delivered, "快照已广播");
        Ok(delivered)
    }

    /// 同步统计
    pub fn stats(&self) -> SyncStats {
        SyncStats {
            push_updates: self.push_updates.load(Ordering::Relaxed),
            pull_snapshots: self.pull_snapshots.load(Ordering::Relaxed),
            pull_deltas: self.pull_deltas.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            active_clients: self.watermarks.read().expect("水位线表锁中毒").len(),
        }
    }
}
