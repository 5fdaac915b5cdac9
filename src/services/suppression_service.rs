//! 消防抑制服务
//!
//! 抑制激活与计数器递增是服务端 Lua 脚本里的原子读改写：
//! 设备检查、类型冲突判定、状态创建 / 更新、计数器与有界历史
//! 都在一次脚本执行内完成，与同设备的其他并发抑制操作互斥。

use crate::config::SuppressionSettings;
use crate::db::RedisPool;
use crate::errors::AppError;
use crate::models::{ActivationOutcome, SuppressionEvent, SuppressionState, SuppressionType};
use crate::repositories::DeviceRepository;
use crate::services::CacheService;
use chrono::Utc;
use redis::Script;
use std::sync::Arc;

/// 抑制事件发布频道
pub const SUPPRESSION_CHANNEL: &str = "vesta:events:suppression";

/// 抑制激活脚本
///
/// KEYS: [1] 设备信息, [2] 设备状态, [3] 抑制状态, [4] 计数器, [5] 历史
/// ARGV: [1] zone, [2] type, [3] intensity, [4] now_ms, [5] expire_s, [6] 事件负载
const ACTIVATE_SUPPRESSION_LUA: &str = r#"
local info = redis.call('GET', KEYS[1])
if not info then
    return 'device_unavailable'
end
local device = cjson.decode(info)
if device.enabled == false then
    return 'device_unavailable'
end

local status = redis.call('GET', KEYS[2])
if not status then
    return 'device_unavailable'
end
if cjson.decode(status).connected ~= true then
    return 'device_unavailable'
end

local existing = redis.call('HGET', KEYS[3], 'type')
if existing then
    if existing ~= ARGV[2] then
        return 'conflict'
    end
    redis.call('HSET', KEYS[3], 'intensity', ARGV[3], 'last_updated', ARGV[4])
    return 'updated'
end

redis.call('HSET', KEYS[3],
    'type', ARGV[2],
    'zone', ARGV[1],
    'intensity', ARGV[3],
    'activated_at', ARGV[4],
    'last_updated', ARGV[4])
redis.call('EXPIRE', KEYS[3], ARGV[5])

redis.call('HINCRBY', KEYS[4], 'total_activations', 1)
redis.call('HINCRBY', KEYS[4], ARGV[2] .. '_activations', 1)
redis.call('HSET', KEYS[4], 'last_activation', ARGV[4])

redis.call('LPUSH', KEYS[5], ARGV[6])
redis.call('LTRIM', KEYS[5], 0, 99)

redis.call('PUBLISH', 'vesta:events:suppression', ARGV[6])
return 'activated'
"#;

/// 抑制计数器递增脚本
///
/// KEYS: [1] 计数器；ARGV: [1] type, [2] now_ms
const INCREMENT_COUNTER_LUA: &str = r#"
redis.call('HINCRBY', KEYS[1], ARGV[1] .. '_activations', 1)
local total = redis.call('HINCRBY', KEYS[1], 'total_activations', 1)
redis.call('HSET', KEYS[1], 'last_activation', ARGV[2])
return total
"#;

/// 设备键布局
fn info_key(device_id: &str) -> String {
    format!("vesta:device:info:{}", device_id)
}
fn status_key(device_id: &str) -> String {
    format!("vesta:device:status:{}", device_id)
}
fn suppression_key(device_id: &str) -> String {
    format!("vesta:device:{}:suppression", device_id)
}
fn counters_key(device_id: &str) -> String {
    format!("vesta:device:{}:counters", device_id)
}
fn history_key(device_id: &str) -> String {
    format!("vesta:device:{}:history", device_id)
}

/// 消防抑制服务
pub struct SuppressionService {
    redis_pool: Arc<RedisPool>,
    device_repo: Arc<DeviceRepository>,
    cache: Arc<CacheService>,
    settings: SuppressionSettings,
    activate_script: Script,
    increment_script: Script,
}

impl SuppressionService {
    pub fn new(
        redis_pool: Arc<RedisPool>,
        device_repo: Arc<DeviceRepository>,
        cache: Arc<CacheService>,
        settings: SuppressionSettings,
    ) -> Self {
        Self {
            redis_pool,
            device_repo,
            cache,
            settings,
            activate_script: Script::new(ACTIVATE_SUPPRESSION_LUA),
            increment_script: Script::new(INCREMENT_COUNTER_LUA),
        }
    }

    /// 激活抑制（原子）
    ///
    /// 设备缺失 / 禁用 / 离线返回 `DeviceUnavailable`；已有不同
    /// 类型的抑制返回 `Conflict`；同类型重复激活只更新强度与
    /// 时间（幂等），新建时计数器递增并发布激活事件。
    pub async fn activate(
        &self,
        device_id: &str,
        zone_id: &str,
        suppression_type: SuppressionType,
        intensity: u8,
    ) -> Result<ActivationOutcome, AppError> {
        if intensity > 100 {
            return Err(AppError::ValidationError(
                "抑制强度必须在 0-100 之间".to_string(),
            ));
        }

        // 脚本只看缓存里的设备信息，先保证缓存命中
        self.warm_device_cache(device_id).await?;

        let now = Utc::now();
        let event =
            SuppressionEvent::activated(device_id, zone_id, suppression_type, intensity, now);
        let payload = serde_json::to_string(&event)?;

        let mut conn = self.redis_pool.connection();
        let outcome: String = self
            .activate_script
            .key(info_key(device_id))
            .key(status_key(device_id))
            .key(suppression_key(device_id))
            .key(counters_key(device_id))
            .key(history_key(device_id))
            .arg(zone_id)
            .arg(suppression_type.as_str())
            .arg(i64::from(intensity))
            .arg(now.timestamp_millis())
            .arg(self.settings.auto_expire_seconds)
            .arg(&payload)
            .invoke_async(&mut conn)
            .await
            .map_err(AppError::RedisError)?;

        let outcome = match outcome.as_str() {
            "activated" => {
                tracing::info!(
                    device_id,
                    zone_id,
                    suppression_type = suppression_type.as_str(),
                    intensity,
                    "抑制已激活"
                );
                ActivationOutcome::Activated
            }
            "updated" => {
                tracing::info!(
                    device_id,
                    suppression_type = suppression_type.as_str(),
                    intensity,
                    "抑制状态已更新"
                );
                ActivationOutcome::Updated
            }
            "conflict" => {
                tracing::warn!(
                    device_id,
                    requested = suppression_type.as_str(),
                    "抑制类型冲突，拒绝激活"
                );
                ActivationOutcome::Conflict
            }
            "device_unavailable" => {
                tracing::warn!(device_id, "设备不可用，抑制未激活");
                ActivationOutcome::DeviceUnavailable
            }
            other => {
                return Err(AppError::InternalError(format!(
                    "抑制脚本返回未知结果: {}",
                    other
                )))
            }
        };

        Ok(outcome)
    }

    /// 原子递增抑制计数器，返回总激活次数
    pub async fn increment_counter(
        &self,
        device_id: &str,
        suppression_type: SuppressionType,
    ) -> Result<i64, AppError> {
        let mut conn = self.redis_pool.connection();
        self.increment_script
            .key(counters_key(device_id))
            .arg(suppression_type.as_str())
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    /// 读取设备当前的抑制状态
    pub async fn get_state(&self, device_id: &str) -> Result<Option<SuppressionState>, AppError> {
        let fields = self.redis_pool.hgetall(&suppression_key(device_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let mut suppression_type = None;
        let mut zone_id = String::new();
        let mut intensity = 0u8;
        let mut activated_at = 0i64;
        let mut last_updated = 0i64;

        for (field, value) in fields {
            match field.as_str() {
                "type" => suppression_type = value.parse::<SuppressionType>().ok(),
                "zone" => zone_id = value,
                "intensity" => intensity = value.parse().unwrap_or(0),
                "activated_at" => activated_at = value.parse().unwrap_or(0),
                "last_updated" => last_updated = value.parse().unwrap_or(0),
                _ => {}
            }
        }

        let Some(suppression_type) = suppression_type else {
            return Ok(None);
        };

        Ok(Some(SuppressionState {
            suppression_type,
            zone_id,
            intensity,
            activated_at,
            last_updated,
        }))
    }

    /// 读取设备的抑制计数器
    pub async fn get_counters(&self, device_id: &str) -> Result<Vec<(String, i64)>, AppError> {
        let fields = self.redis_pool.hgetall(&counters_key(device_id)).await?;
        Ok(fields
            .into_iter()
            .filter_map(|(field, value)| value.parse::<i64>().ok().map(|v| (field, v)))
            .collect())
    }

    async fn warm_device_cache(&self, device_id: &str) -> Result<(), AppError> {
        if self.cache.get_cached_device(device_id).await?.is_some() {
            return Ok(());
        }

        let device = self
            .device_repo
            .find_by_device_id(device_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("设备不存在: {}", device_id)))?;

        self.cache.cache_device(&device).await
    }
}
