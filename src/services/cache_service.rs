//! 缓存服务
//!
//! 设备信息、在线状态、最新读数与认证限流共用的 Redis 缓存层。

use crate::db::RedisPool;
use crate::errors::AppError;
use crate::models::{Device, DeviceStatus, SensorData, SensorType};
use chrono::Utc;
use std::sync::Arc;

/// 缓存键前缀
pub mod cache_keys {
    pub const DEVICE_INFO: &str = "vesta:device:info";
    pub const DEVICE_STATUS: &str = "vesta:device:status";
    pub const READING_LATEST: &str = "vesta:reading:latest";
    pub const AUTH_ATTEMPTS: &str = "vesta:auth:attempts";
}

/// 设备状态键的 TTL（秒），略大于读空闲超时
const DEVICE_STATUS_TTL_SECONDS: u64 = 30;
/// 设备信息缓存 TTL（秒）
const DEVICE_INFO_TTL_SECONDS: u64 = 300;

/// 缓存服务
pub struct CacheService {
    redis_pool: Arc<RedisPool>,
}

impl CacheService {
    pub fn new(redis_pool: Arc<RedisPool>) -> Self {
        Self { redis_pool }
    }

    // ========== 设备在线状态 ==========

    /// 发布设备在线状态（认证成功 / 心跳时刷新 TTL）
    pub async fn publish_device_status(
        &self,
        device_id: &str,
        connected: bool,
    ) -> Result<(), AppError> {
        let status = DeviceStatus {
            device_id: device_id.to_string(),
            connected,
            last_seen: Utc::now(),
        };
        let key = format!("{}:{}", cache_keys::DEVICE_STATUS, device_id);
        self.redis_pool
            .set_ex(&key, &status, DEVICE_STATUS_TTL_SECONDS)
            .await
    }

    /// 读取设备在线状态
    pub async fn get_device_status(
        &self,
        device_id: &str,
    ) -> Result<Option<DeviceStatus>, AppError> {
        let key = format!("{}:{}", cache_keys::DEVICE_STATUS, device_id);
        self.redis_pool.get(&key).await
    }

    // ========== 设备信息缓存 ==========

    /// 缓存设备记录
    pub async fn cache_device(&self, device: &Device) -> Result<(), AppError> {
        let key = format!("{}:{}", cache_keys::DEVICE_INFO, device.device_id);
        self.redis_pool
            .set_ex(&key, device, DEVICE_INFO_TTL_SECONDS)
            .await
    }

    /// 读取缓存的设备记录
    pub async fn get_cached_device(&self, device_id: &str) -> Result<Option<Device>, AppError> {
        let key = format!("{}:{}", cache_keys::DEVICE_INFO, device_id);
        self.redis_pool.get(&key).await
    }

    /// 失效设备缓存（设备被禁用 / 更新后调用）
    pub async fn invalidate_device(&self, device_id: &str) -> Result<(), AppError> {
        let key = format!("{}:{}", cache_keys::DEVICE_INFO, device_id);
        self.redis_pool.del(&key).await
    }

    // ========== 最新读数缓存（背压消费组写入） ==========

    /// 写入最新读数
    pub async fn set_latest_reading(&self, reading: &SensorData) -> Result<(), AppError> {
        let key = format!(
            "{}:{}:{}",
            cache_keys::READING_LATEST,
            reading.device_id,
            reading.sensor_type
        );
        self.redis_pool.set(&key, reading).await
    }

    /// 读取最新读数
    pub async fn get_latest_reading(
        &self,
        device_id: &str,
        sensor_type: SensorType,
    ) -> Result<Option<SensorData>, AppError> {
        let key = format!(
            "{}:{}:{}",
            cache_keys::READING_LATEST,
            device_id,
            sensor_type
        );
        self.redis_pool.get(&key).await
    }

    // ========== 认证尝试限流 ==========

    /// 记录一次认证失败，返回窗口内的累计次数。
    /// Redis 不可用时返回 0（限流是保护措施，fail-open）
    pub async fn record_auth_failure(&self, client_ip: &str) -> i64 {
        let key = format!("{}:{}", cache_keys::AUTH_ATTEMPTS, client_ip);
        match self.redis_pool.incr_ex(&key, 60).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(error = %e, "认证限流计数失败");
                0
            }
        }
    }

    /// 查询窗口内的认证失败次数（fail-open）
    pub async fn auth_failure_count(&self, client_ip: &str) -> i64 {
        let key = format!("{}:{}", cache_keys::AUTH_ATTEMPTS, client_ip);
        match self.redis_pool.get::<i64>(&key).await {
            Ok(count) => count.unwrap_or(0),
            Err(e) => {
                tracing::error!(error = %e, "认证限流查询失败");
                0
            }
        }
    }
}
