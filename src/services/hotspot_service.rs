//! 热点数据服务
//!
//! 未封装进脚本的通用计数器读写走分布式锁：锁按
//! (设备, 计数器) 配对，有界等待加租约时长，租约到期自动释放，
//! 释放时校验持有者避免误删他人的锁。

use crate::config::SuppressionSettings;
use crate::db::RedisPool;
use crate::errors::AppError;
use crate::security::{generate_token, TokenType};
use redis::Script;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 锁重试间隔
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// 持有者校验的释放脚本（比较令牌后删除）
const RELEASE_LOCK_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

fn counters_key(device_id: &str) -> String {
    format!("vesta:device:{}:counters", device_id)
}

fn lock_key(device_id: &str, counter_name: &str) -> String {
    format!("vesta:lock:device:{}:{}", device_id, counter_name)
}

/// 热点数据服务
pub struct HotspotService {
    redis_pool: Arc<RedisPool>,
    settings: SuppressionSettings,
    release_script: Script,
}

impl HotspotService {
    pub fn new(redis_pool: Arc<RedisPool>, settings: SuppressionSettings) -> Self {
        Self {
            redis_pool,
            settings,
            release_script: Script::new(RELEASE_LOCK_LUA),
        }
    }

    /// 读取计数器（读操作本身原子，不需要锁）
    pub async fn get_counter(&self, device_id: &str, counter_name: &str) -> Result<i64, AppError> {
        let value = self
            .redis_pool
            .hget(&counters_key(device_id), counter_name)
            .await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// 在 (设备, 计数器) 锁的保护下递增计数器，返回新值
    pub async fn increment_counter(
        &self,
        device_id: &str,
        counter_name: &str,
        increment_by: u64,
    ) -> Result<i64, AppError> {
        let lock = self.acquire_lock(device_id, counter_name).await?;

        let result = async {
            let key = counters_key(device_id);
            let current: i64 = self
                .redis_pool
                .hget(&key, counter_name)
                .await?
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);

            let new_value = current + increment_by as i64;
            self.redis_pool
                .hset(&key, counter_name, &new_value.to_string())
                .await?;

            tracing::debug!(device_id, counter_name, new_value, "计数器已递增");
            Ok(new_value)
        }
        .await;

        self.release_lock(device_id, counter_name, &lock).await;
        result
    }

    /// 在锁的保护下显式设置计数器
    pub async fn set_counter(
        &self,
        device_id: &str,
        counter_name: &str,
        value: i64,
    ) -> Result<(), AppError> {
        if value < 0 {
            return Err(AppError::ValidationError(
                "计数器值不能为负".to_string(),
            ));
        }

        let lock = self.acquire_lock(device_id, counter_name).await?;

        let result = self
            .redis_pool
            .hset(&counters_key(device_id), counter_name, &value.to_string())
            .await;

        self.release_lock(device_id, counter_name, &lock).await;

        result.map(|_| {
            tracing::debug!(device_id, counter_name, value, "计数器已设置");
        })
    }

    /// 有界等待获取分布式锁。返回持有者令牌
    ///
    /// 锁带租约（PX），持有者崩溃后到期自动释放。
    async fn acquire_lock(&self, device_id: &str, counter_name: &str) -> Result<String, AppError> {
        let key = lock_key(device_id, counter_name);
        let token = generate_token(TokenType::DeviceAccessToken)?;
        let deadline = Instant::now() + Duration::from_millis(self.settings.lock_wait_ms);

        loop {
            let mut conn = self.redis_pool.connection();
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(self.settings.lock_lease_ms)
                .query_async(&mut conn)
                .await
                .map_err(AppError::RedisError)?;

            if acquired.is_some() {
                return Ok(token);
            }

            if Instant::now() >= deadline {
                tracing::warn!(key = %key, "分布式锁等待超时");
                return Err(AppError::Timeout(format!("锁等待超时: {}", key)));
            }

            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    /// 释放锁（仅当仍由本令牌持有）。失败只记录，租约会兜底
    async fn release_lock(&self, device_id: &str, counter_name: &str, token: &str) {
        let key = lock_key(device_id, counter_name);
        let mut conn = self.redis_pool.connection();

        let released: Result<i64, _> = self
            .release_script
            .key(&key)
            .arg(token)
            .invoke_async(&mut conn)
            .await;

        match released {
            Ok(1) => {}
            Ok(_) => tracing::warn!(key = %key, "锁已不属于当前持有者"),
            Err(e) => tracing::error!(key = %key, error = %e, "锁释放失败，等待租约过期"),
        }
    }
}
