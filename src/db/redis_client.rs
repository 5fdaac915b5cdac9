//! Redis 连接管理
//!
//! 告警历史、令牌缓存、规则热路径与抑制原语共用同一连接管理器，
//! 各自通过键前缀隔离。

use crate::config::Settings;
use crate::errors::AppError;
use redis::aio::ConnectionManager;
use redis::Client;
use secrecy::ExposeSecret;

/// Redis 连接池包装
#[derive(Clone)]
pub struct RedisPool {
    manager: ConnectionManager,
}

impl RedisPool {
    /// 创建新的 Redis 连接
    pub async fn new(_settings: &Settings) -> Result<Self, AppError> {
        let redis_url = Settings::redis_url();

        let client = Client::open(redis_url.expose_secret().as_str())
            .map_err(|e| AppError::ConfigError(format!("Redis URL 无效: {}", e)))?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            tracing::error!("Redis 连接失败: {}", e);
            AppError::RedisError(e)
        })?;

        tracing::info!("Redis 连接已建立");

        Ok(Self { manager })
    }

    /// 获取连接管理器
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(AppError::RedisError)
    }

    /// 设置缓存（带过期时间）
    pub async fn set_ex<T: serde::Serialize>(
        &self,
        key: &str,
        value: &T,
        expiry_seconds: u64,
    ) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let serialized = serde_json::to_string(value)?;

        redis::cmd("SETEX")
            .arg(key)
            .arg(expiry_seconds)
            .arg(serialized)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    /// 设置缓存（不过期）
    pub async fn set<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let serialized = serde_json::to_string(value)?;

        redis::cmd("SET")
            .arg(key)
            .arg(serialized)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    /// 获取缓存
    pub async fn get<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, AppError> {
        let mut conn = self.manager.clone();
        let result: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)?;

        match result {
            Some(data) => {
                let value = serde_json::from_str(&data)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 原子获取并删除（用于一次性令牌）
    pub async fn get_del<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, AppError> {
        let mut conn = self.manager.clone();
        let result: Option<String> = redis::cmd("GETDEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)?;

        match result {
            Some(data) => {
                let value = serde_json::from_str(&data)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 删除缓存
    pub async fn del(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    /// 检查键是否存在
    pub async fn exists(&self, key: &str) -> Result<bool, AppError> {
        let mut conn = self.manager.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)?;

        Ok(exists)
    }

    /// 设置键过期时间
    pub async fn expire(&self, key: &str, seconds: u64) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    /// 获取 key 的剩余 TTL（秒）
    pub async fn ttl(&self, key: &str) -> Result<i64, AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("TTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    /// 递增计数器并设置过期时间（如果是新 key）
    pub async fn incr_ex(&self, key: &str, expiry_seconds: u64) -> Result<i64, AppError> {
        let mut conn = self.manager.clone();

        let count: i64 = redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)?;

        // 第一次递增时设置过期时间
        if count == 1 {
            let _: () = redis::cmd("EXPIRE")
                .arg(key)
                .arg(expiry_seconds)
                .query_async(&mut conn)
                .await
                .map_err(AppError::RedisError)?;
        }

        Ok(count)
    }

    // ========== 有序集合（告警历史索引） ==========

    /// 向有序集合添加成员
    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    /// 按分数倒序取前 N 个成员
    pub async fn zrevrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    /// 取分数区间内的成员（升序）
    pub async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    /// 按分数倒序游标分页：严格小于 cursor 的前 N 个成员
    pub async fn zrevrangebyscore_before(
        &self,
        key: &str,
        cursor: f64,
        count: usize,
    ) -> Result<Vec<String>, AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("ZREVRANGEBYSCORE")
            .arg(key)
            .arg(format!("({}", cursor))
            .arg("-inf")
            .arg("LIMIT")
            .arg(0)
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    /// 删除分数不大于 cutoff 的成员，返回删除数量
    pub async fn zremrangebyscore(&self, key: &str, cutoff: f64) -> Result<u64, AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    /// 有序集合成员数
    pub async fn zcard(&self, key: &str) -> Result<u64, AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    // ========== 集合（索引注册表 / 令牌索引） ==========

    /// 向集合添加成员
    pub async fn sadd(&self, key: &str, member: &str) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    /// 获取集合所有成员
    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    /// 按模式列出键（仅用于咨询性统计，不在热路径使用）
    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>, AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    // ========== 哈希（设备状态 / 计数器） ==========

    /// 设置哈希字段
    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    /// 获取哈希字段
    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    /// 获取整个哈希
    pub async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    // ========== 发布 / 订阅 ==========

    /// 向频道发布消息，返回接收方数量
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<i64, AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    // ========== HyperLogLog（去重基数估计） ==========

    /// 向 HyperLogLog 添加元素
    pub async fn pfadd(&self, key: &str, element: &str) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("PFADD")
            .arg(key)
            .arg(element)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }

    /// 估计 HyperLogLog 基数
    pub async fn pfcount(&self, key: &str) -> Result<u64, AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("PFCOUNT")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }
}
