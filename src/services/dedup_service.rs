//! 告警去重服务
//!
//! 以指纹为键记录最近出现时间（TTL = 去重窗口），窗口内的重复
//! 告警被抑制。HyperLogLog 提供咨询性的基数估计；去重是优化
//! 而非正确性保障，存储故障时 fail-open（当作新告警）。

use crate::config::DedupSettings;
use crate::db::RedisPool;
use crate::errors::AppError;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 指纹去重能力（评估器依赖的窄接口）
#[async_trait]
pub trait AlarmDeduplicator: Send + Sync {
    /// 判断指纹是否首次出现（窗口内）；首次出现时记录本次出现
    async fn is_new(&self, fingerprint: &str) -> bool;
}

/// 去重缓存键前缀
mod dedup_keys {
    pub const LAST_SEEN: &str = "vesta:alarm:last-seen";
    pub const HLL: &str = "vesta:alarm:hll";
    pub const HLL_MERGED: &str = "vesta:alarm:hll:merged";
}

/// 去重统计（仅供观测，不参与正确性判定）
#[derive(Debug, Clone, Serialize)]
pub struct DedupStats {
    /// HyperLogLog 估计的全局唯一事件数
    pub unique_events: u64,
    /// 窗口内的活跃指纹数
    pub active_fingerprints: u64,
    /// 估算的去重比率（0-100）
    pub dedup_rate: f64,
    /// 存储故障导致 fail-open 的次数
    pub fail_open_count: u64,
}

/// 告警去重服务
pub struct DedupService {
    redis_pool: Arc<RedisPool>,
    settings: DedupSettings,
    fail_open_count: AtomicU64,
}

#[async_trait]
impl AlarmDeduplicator for DedupService {
    /// 去重关闭或存储故障时恒返回 true（fail-open）
    async fn is_new(&self, fingerprint: &str) -> bool {
        if !self.settings.enabled {
            return true;
        }

        match self.check_and_record(fingerprint).await {
            Ok(is_new) => is_new,
            Err(e) => {
                self.fail_open_count.fetch_add(1, Ordering::Relaxed);
                tracing::error!(fingerprint, error = %e, "去重检查失败，fail-open");
                true
            }
        }
    }
}

impl DedupService {
    pub fn new(redis_pool: Arc<RedisPool>, settings: DedupSettings) -> Self {
        Self {
            redis_pool,
            settings,
            fail_open_count: AtomicU64::new(0),
        }
    }

    async fn check_and_record(&self, fingerprint: &str) -> Result<bool, AppError> {
        let now = Utc::now().timestamp();
        let last_seen_key = format!("{}:{}", dedup_keys::LAST_SEEN, fingerprint);

        if let Some(last_seen) = self.redis_pool.get::<i64>(&last_seen_key).await? {
            if now - last_seen < self.settings.window_seconds as i64 {
                return Ok(false);
            }
        }

        // 记录本次出现
        self.redis_pool
            .set_ex(&last_seen_key, &now, self.settings.window_seconds)
            .await?;

        // 指纹首段是规则 ID，按规则聚合基数估计
        let rule_id = fingerprint.split(':').next().unwrap_or(fingerprint);
        let hll_key = format!("{}:{}", dedup_keys::HLL, rule_id);
        self.redis_pool
            .pfadd(&hll_key, &format!("{}:{}", fingerprint, now))
            .await?;
        self.redis_pool
            .expire(&hll_key, self.settings.window_seconds)
            .await?;

        Ok(true)
    }

    /// 某规则的唯一事件估计数
    pub async fn unique_count(&self, rule_id: &str) -> u64 {
        let hll_key = format!("{}:{}", dedup_keys::HLL, rule_id);
        match self.redis_pool.pfcount(&hll_key).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(rule_id, error = %e, "唯一事件估计失败");
                0
            }
        }
    }

    /// 去重统计。基数估计来自 HyperLogLog 合并，仅供观测
    pub async fn stats(&self) -> DedupStats {
        let fail_open_count = self.fail_open_count.load(Ordering::Relaxed);

        let unique_events = match self.merged_unique_count().await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(error = %e, "去重统计失败");
                return DedupStats {
                    unique_events: 0,
                    active_fingerprints: 0,
                    dedup_rate: 0.0,
                    fail_open_count,
                };
            }
        };

        let active_fingerprints = self
            .redis_pool
            .keys(&format!("{}:*", dedup_keys::LAST_SEEN))
            .await
            .map(|keys| keys.len() as u64)
            .unwrap_or(0);

        let dedup_rate = if unique_events > 0 {
            (unique_events.saturating_sub(active_fingerprints)) as f64 / unique_events as f64
                * 100.0
        } else {
            0.0
        };

        DedupStats {
            unique_events,
            active_fingerprints,
            dedup_rate,
            fail_open_count,
        }
    }

    async fn merged_unique_count(&self) -> Result<u64, AppError> {
        let hll_keys = self
            .redis_pool
            .keys(&format!("{}:*", dedup_keys::HLL))
            .await?;
        if hll_keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.redis_pool.connection();
        let mut cmd = redis::cmd("PFMERGE");
        cmd.arg(dedup_keys::HLL_MERGED);
        for key in &hll_keys {
            if key != dedup_keys::HLL_MERGED {
                cmd.arg(key);
            }
        }
        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(AppError::RedisError)?;

        let count = self.redis_pool.pfcount(dedup_keys::HLL_MERGED).await?;
        self.redis_pool.del(dedup_keys::HLL_MERGED).await?;
        Ok(count)
    }
}
