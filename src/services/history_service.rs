//! 告警历史服务
//!
//! 全局时间索引（有序集合，分数 = 告警毫秒时间戳）加设备 /
//! 级别 / 类型三个二级索引。Redis 不可达时写入降级到有界内存
//! 环形缓冲，读取从环形缓冲降级提供并打上 degraded 标记；
//! 恢复后不回填（环形缓冲是尽力而为的降级，不是预写日志）。

use crate::config::HistorySettings;
use crate::db::RedisPool;
use crate::errors::AppError;
use crate::models::{AlarmEvent, AlarmSeverity};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// 历史索引键
mod history_keys {
    pub const GLOBAL: &str = "vesta:alarm:history";
    pub const BY_DEVICE: &str = "vesta:alarm:history:device";
    pub const BY_SEVERITY: &str = "vesta:alarm:history:severity";
    pub const BY_TYPE: &str = "vesta:alarm:history:type";
    /// 二级索引键注册表（过期清理需要枚举全部索引键）
    pub const DEVICE_REGISTRY: &str = "vesta:alarm:history:index:devices";
    pub const TYPE_REGISTRY: &str = "vesta:alarm:history:index:types";
    /// 可用性探测键
    pub const HEALTH_CHECK: &str = "vesta:health:check";
}

/// 后端存储可用性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StoreHealth {
    Up,
    Down,
}

/// 历史查询结果。degraded 为 true 表示数据来自内存降级缓冲
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub alarms: Vec<AlarmEvent>,
    pub degraded: bool,
}

/// 历史统计
#[derive(Debug, Clone, Serialize)]
pub struct HistoryStats {
    pub stored: u64,
    pub fallback_writes: u64,
    pub degraded_reads: u64,
    pub swept: u64,
}

/// 有界降级缓冲：容量固定，写满时最旧先逐出
pub struct FallbackRing {
    capacity: usize,
    entries: Mutex<VecDeque<AlarmEvent>>,
}

impl FallbackRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, alarm: AlarmEvent) {
        let mut entries = self.entries.lock().expect("降级缓冲锁中毒");
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(alarm);
    }

    /// 按告警 ID 去重写入。已存在时返回 false
    pub fn push_unique(&self, alarm: AlarmEvent) -> bool {
        let mut entries = self.entries.lock().expect("降级缓冲锁中毒");
        if entries.iter().any(|existing| existing.id == alarm.id) {
            return false;
        }
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(alarm);
        true
    }

    pub fn snapshot(&self) -> Vec<AlarmEvent> {
        self.entries
            .lock()
            .expect("降级缓冲锁中毒")
            .iter()
            .cloned()
            .collect()
    }

    pub fn retain_since(&self, cutoff: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().expect("降级缓冲锁中毒");
        let before = entries.len();
        entries.retain(|alarm| alarm.timestamp >= cutoff);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("降级缓冲锁中毒").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 告警历史服务
pub struct HistoryService {
    redis_pool: Arc<RedisPool>,
    settings: HistorySettings,
    ring: Arc<FallbackRing>,
    stored: AtomicU64,
    fallback_writes: AtomicU64,
    degraded_reads: AtomicU64,
    swept: AtomicU64,
}

impl HistoryService {
    pub fn new(redis_pool: Arc<RedisPool>, settings: HistorySettings) -> Self {
        let ring = Arc::new(FallbackRing::new(settings.in_memory_fallback_size));
        Self {
            redis_pool,
            settings,
            ring,
            stored: AtomicU64::new(0),
            fallback_writes: AtomicU64::new(0),
            degraded_reads: AtomicU64::new(0),
            swept: AtomicU64::new(0),
        }
    }

    /// 降级缓冲的共享句柄（分发监督者兜底时直接写入）
    pub fn fallback_ring(&self) -> Arc<FallbackRing> {
        self.ring.clone()
    }

    /// 写入一条告警
    ///
    /// 四个索引全部写入并刷新 TTL。Redis 失败时事件转入降级
    /// 环形缓冲并返回 `StoreUnavailable`，由分发监督者决定
    /// 后续策略；后端恢复后缓冲不回填。
    pub async fn store(&self, alarm: &AlarmEvent) -> Result<(), AppError> {
        match self.store_to_redis(alarm).await {
            Ok(()) => {
                self.stored.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(alarm_id = alarm.id, "告警已写入历史");
                Ok(())
            }
            Err(e) => {
                self.ring.push(alarm.clone());
                self.fallback_writes.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(alarm_id = alarm.id, error = %e, "历史写入降级到内存缓冲");
                Err(AppError::StoreUnavailable(format!("历史写入失败: {}", e)))
            }
        }
    }

    async fn store_to_redis(&self, alarm: &AlarmEvent) -> Result<(), AppError> {
        let payload = serde_json::to_string(alarm)?;
        let score = alarm.timestamp.timestamp_millis() as f64;
        let retention_seconds = u64::from(self.settings.retention_days) * 86400;

        let device_key = format!("{}:{}", history_keys::BY_DEVICE, alarm.device_id);
        let severity_key = format!(
            "{}:{}",
            history_keys::BY_SEVERITY,
            alarm.severity.topic_suffix()
        );
        let type_key = format!(
            "{}:{}",
            history_keys::BY_TYPE,
            alarm.alarm_type.to_lowercase()
        );

        self.redis_pool
            .zadd(history_keys::GLOBAL, &payload, score)
            .await?;
        self.redis_pool.zadd(&device_key, &payload, score).await?;
        self.redis_pool.zadd(&severity_key, &payload, score).await?;
        self.redis_pool.zadd(&type_key, &payload, score).await?;

        for key in [
            history_keys::GLOBAL,
            device_key.as_str(),
            severity_key.as_str(),
            type_key.as_str(),
        ] {
            self.redis_pool.expire(key, retention_seconds).await?;
        }

        // 注册二级索引键，供过期清理枚举
        self.redis_pool
            .sadd(history_keys::DEVICE_REGISTRY, &alarm.device_id)
            .await?;
        self.redis_pool
            .sadd(history_keys::TYPE_REGISTRY, &alarm.alarm_type.to_lowercase())
            .await?;

        Ok(())
    }

    // ========== 读路径 ==========

    /// 最近 N 条告警（时间倒序）
    pub async fn recent(&self, count: usize) -> HistoryPage {
        self.read_index(history_keys::GLOBAL, count).await
    }

    /// 时间窗口内的告警（时间升序）
    pub async fn in_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> HistoryPage {
        let result = self
            .redis_pool
            .zrangebyscore(
                history_keys::GLOBAL,
                start.timestamp_millis() as f64,
                end.timestamp_millis() as f64,
            )
            .await;

        match result {
            Ok(members) => HistoryPage {
                alarms: parse_members(members),
                degraded: false,
            },
            Err(e) => {
                self.degraded_reads.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "窗口查询降级到内存缓冲");
                let mut alarms: Vec<AlarmEvent> = self
                    .ring
                    .snapshot()
                    .into_iter()
                    .filter(|alarm| alarm.timestamp >= start && alarm.timestamp <= end)
                    .collect();
                alarms.sort_by_key(|alarm| alarm.timestamp);
                HistoryPage {
                    alarms,
                    degraded: true,
                }
            }
        }
    }

    /// 某设备最近 N 条告警
    pub async fn by_device(&self, device_id: &str, count: usize) -> HistoryPage {
        let key = format!("{}:{}", history_keys::BY_DEVICE, device_id);
        self.read_filtered(&key, count, |alarm| alarm.device_id == device_id)
            .await
    }

    /// 某级别最近 N 条告警
    pub async fn by_severity(&self, severity: AlarmSeverity, count: usize) -> HistoryPage {
        let key = format!("{}:{}", history_keys::BY_SEVERITY, severity.topic_suffix());
        self.read_filtered(&key, count, |alarm| alarm.severity == severity)
            .await
    }

    /// 某类型最近 N 条告警
    pub async fn by_type(&self, alarm_type: &str, count: usize) -> HistoryPage {
        let key = format!("{}:{}", history_keys::BY_TYPE, alarm_type.to_lowercase());
        self.read_filtered(&key, count, |alarm| {
            alarm.alarm_type.eq_ignore_ascii_case(alarm_type)
        })
        .await
    }

    /// 偏移量分页（时间倒序）
    pub async fn page(&self, offset: usize, page_size: usize) -> HistoryPage {
        let start = offset as isize;
        let stop = (offset + page_size) as isize - 1;

        match self
            .redis_pool
            .zrevrange(history_keys::GLOBAL, start, stop)
            .await
        {
            Ok(members) => HistoryPage {
                alarms: parse_members(members),
                degraded: false,
            },
            Err(e) => {
                self.degraded_reads.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "分页查询降级到内存缓冲");
                let mut alarms = self.ring.snapshot();
                alarms.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                HistoryPage {
                    alarms: alarms.into_iter().skip(offset).take(page_size).collect(),
                    degraded: true,
                }
            }
        }
    }

    /// 时间戳游标分页：严格早于 cursor 的 N 条（时间倒序）
    pub async fn before(&self, cursor: DateTime<Utc>, count: usize) -> HistoryPage {
        let result = self
            .redis_pool
            .zrevrangebyscore_before(
                history_keys::GLOBAL,
                cursor.timestamp_millis() as f64,
                count,
            )
            .await;

        match result {
            Ok(members) => HistoryPage {
                alarms: parse_members(members),
                degraded: false,
            },
            Err(e) => {
                self.degraded_reads.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "游标查询降级到内存缓冲");
                let mut alarms: Vec<AlarmEvent> = self
                    .ring
                    .snapshot()
                    .into_iter()
                    .filter(|alarm| alarm.timestamp < cursor)
                    .collect();
                alarms.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                alarms.truncate(count);
                HistoryPage {
                    alarms,
                    degraded: true,
                }
            }
        }
    }

    /// 全局索引的记录数
    pub async fn count(&self) -> u64 {
        match self.redis_pool.zcard(history_keys::GLOBAL).await {
            Ok(count) => count,
            Err(_) => self.ring.len() as u64,
        }
    }

    /// 某设备索引的记录数
    pub async fn count_by_device(&self, device_id: &str) -> u64 {
        let key = format!("{}:{}", history_keys::BY_DEVICE, device_id);
        match self.redis_pool.zcard(&key).await {
            Ok(count) => count,
            Err(_) => self
                .ring
                .snapshot()
                .iter()
                .filter(|alarm| alarm.device_id == device_id)
                .count() as u64,
        }
    }

    // ========== 过期清理 ==========

    /// 清理超过保留期的记录（幂等，按计划调度执行）
    pub async fn sweep(&self) -> Result<u64, AppError> {
        let cutoff_time = Utc::now() - Duration::days(i64::from(self.settings.retention_days));
        let cutoff = cutoff_time.timestamp_millis() as f64;

        let mut removed = self
            .redis_pool
            .zremrangebyscore(history_keys::GLOBAL, cutoff)
            .await?;

        for device_id in self
            .redis_pool
            .smembers(history_keys::DEVICE_REGISTRY)
            .await?
        {
            let key = format!("{}:{}", history_keys::BY_DEVICE, device_id);
            removed += self.redis_pool.zremrangebyscore(&key, cutoff).await?;
        }
        for severity in ["low", "medium", "high"] {
            let key = format!("{}:{}", history_keys::BY_SEVERITY, severity);
            removed += self.redis_pool.zremrangebyscore(&key, cutoff).await?;
        }
        for alarm_type in self.redis_pool.smembers(history_keys::TYPE_REGISTRY).await? {
            let key = format!("{}:{}", history_keys::BY_TYPE, alarm_type);
            removed += self.redis_pool.zremrangebyscore(&key, cutoff).await?;
        }

        // 内存缓冲同步清理
        self.ring.retain_since(cutoff_time);

        self.swept.fetch_add(removed, Ordering::Relaxed);
        tracing::info!(removed, "历史过期清理完成");
        Ok(removed)
    }

    // ========== 可用性 ==========

    /// 可用性探测：对后端做一次平凡的存在性检查
    pub async fn probe(&self) -> StoreHealth {
        match self.redis_pool.exists(history_keys::HEALTH_CHECK).await {
            Ok(_) => StoreHealth::Up,
            Err(e) => {
                tracing::warn!(error = %e, "历史后端不可达");
                StoreHealth::Down
            }
        }
    }

    /// 历史统计
    pub fn stats(&self) -> HistoryStats {
        HistoryStats {
            stored: self.stored.load(Ordering::Relaxed),
            fallback_writes: self.fallback_writes.load(Ordering::Relaxed),
            degraded_reads: self.degraded_reads.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }

    async fn read_index(&self, key: &str, count: usize) -> HistoryPage {
        match self.redis_pool.zrevrange(key, 0, count as isize - 1).await {
            Ok(members) => HistoryPage {
                alarms: parse_members(members),
                degraded: false,
            },
            Err(e) => {
                self.degraded_reads.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "历史查询降级到内存缓冲");
                let mut alarms = self.ring.snapshot();
                alarms.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                alarms.truncate(count);
                HistoryPage {
                    alarms,
                    degraded: true,
                }
            }
        }
    }

    async fn read_filtered<F>(&self, key: &str, count: usize, filter: F) -> HistoryPage
    where
        F: Fn(&AlarmEvent) -> bool,
    {
        match self.redis_pool.zrevrange(key, 0, count as isize - 1).await {
            Ok(members) => HistoryPage {
                alarms: parse_members(members),
                degraded: false,
            },
            Err(e) => {
                self.degraded_reads.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "二级索引查询降级到内存缓冲");
                let mut alarms: Vec<AlarmEvent> = self
                    .ring
                    .snapshot()
                    .into_iter()
                    .filter(|a| filter(a))
                    .collect();
                alarms.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                alarms.truncate(count);
                HistoryPage {
                    alarms,
                    degraded: true,
                }
            }
        }
    }
}

fn parse_members(members: Vec<String>) -> Vec<AlarmEvent> {
    members
        .iter()
        .filter_map(|json| match serde_json::from_str(json) {
            Ok(alarm) => Some(alarm),
            Err(e) => {
                tracing::error!(error = %e, "历史记录解析失败");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Location;
    use chrono::TimeZone;

    fn alarm(id: i64, ts_ms: i64) -> AlarmEvent {
        AlarmEvent {
            id,
            device_id: "d1".into(),
            alarm_type: "SMOKE".into(),
            severity: AlarmSeverity::High,
            value: 80.0,
            unit: "ppm".into(),
            timestamp: Utc.timestamp_millis_opt(ts_ms).unwrap(),
            location: Location::default(),
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved: false,
            resolved_at: None,
            resolved_by: None,
            notes: None,
            metadata: None,
        }
    }

    #[test]
    fn test_ring_evicts_oldest_first() {
        let ring = FallbackRing::new(3);
        for i in 0..5 {
            ring.push(alarm(i, 1000 + i));
        }

        let snapshot = ring.snapshot();
        assert_eq!(snapshot.len(), 3);
        // 0 和 1 被逐出
        assert_eq!(snapshot[0].id, 2);
        assert_eq!(snapshot[2].id, 4);
    }

    #[test]
    fn test_ring_accepts_up_to_capacity() {
        let ring = FallbackRing::new(1000);
        for i in 0..1000 {
            ring.push(alarm(i, i));
        }
        assert_eq!(ring.len(), 1000);

        ring.push(alarm(1000, 1000));
        assert_eq!(ring.len(), 1000);
        assert_eq!(ring.snapshot()[0].id, 1);
    }

    #[test]
    fn test_ring_retention_cleanup() {
        let ring = FallbackRing::new(10);
        let cutoff_ms = 5000;
        for i in 0..10 {
            ring.push(alarm(i, i * 1000));
        }

        let removed = ring.retain_since(Utc.timestamp_millis_opt(cutoff_ms).unwrap());
        assert_eq!(removed, 5);
        assert!(ring
            .snapshot()
            .iter()
            .all(|alarm| alarm.timestamp.timestamp_millis() >= cutoff_ms));
    }

    #[test]
    fn test_parse_members_skips_corrupt_entries() {
        let good = serde_json::to_string(&alarm(1, 1000)).unwrap();
        let parsed = parse_members(vec![good, "not-json".to_string()]);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, 1);
    }
}
