//! 设备令牌服务
//!
//! 签发、验证、刷新与吊销设备访问令牌。令牌是不透明随机串，
//! 有效性完全由带 TTL 的令牌缓存决定；刷新令牌一次性使用。

use crate::config::TokenSettings;
use crate::db::RedisPool;
use crate::errors::AppError;
use crate::repositories::DeviceRepository;
use crate::security::{generate_token, mask_token, verify_api_key, TokenType};
use crate::services::CacheService;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 令牌缓存键前缀
mod token_keys {
    pub const TOKEN: &str = "vesta:token";
    pub const REFRESH: &str = "vesta:token:refresh";
    pub const DEVICE_INDEX: &str = "vesta:token:device";
    pub const REVOKED: &str = "vesta:token:revoked";
}

/// 签发结果
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
    pub token_type: String,
}

/// 访问令牌关联信息
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenInfo {
    device_id: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    refresh_token: String,
}

/// 刷新令牌关联信息（记录配对的访问令牌以便一并失效）
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RefreshInfo {
    device_id: String,
    access_token: String,
}

/// 设备令牌服务
pub struct TokenService {
    redis_pool: Arc<RedisPool>,
    device_repo: Arc<DeviceRepository>,
    cache: Arc<CacheService>,
    settings: TokenSettings,
}

impl TokenService {
    pub fn new(
        redis_pool: Arc<RedisPool>,
        device_repo: Arc<DeviceRepository>,
        cache: Arc<CacheService>,
        settings: TokenSettings,
    ) -> Self {
        Self {
            redis_pool,
            device_repo,
            cache,
            settings,
        }
    }

    /// 为设备签发新令牌对
    pub async fn issue(&self, device_id: &str, api_key: &str) -> Result<TokenPair, AppError> {
        let device = self
            .device_repo
            .find_by_device_id(device_id)
            .await?
            .ok_or_else(|| AppError::Unauthorized("设备凭证无效".to_string()))?;

        if !device.enabled {
            return Err(AppError::Unauthorized("设备凭证无效".to_string()));
        }

        if !verify_api_key(api_key, &device.api_key_hash) {
            return Err(AppError::Unauthorized("设备凭证无效".to_string()));
        }

        let pair = self.store_new_pair(device_id).await?;

        self.device_repo.update_last_seen(device.id).await?;

        tracing::debug!(device_id, "已签发设备令牌");
        Ok(pair)
    }

    /// 验证访问令牌，返回设备标识
    ///
    /// 已验证的令牌蕴含设备当前处于启用状态。
    pub async fn validate(&self, access_token: &str) -> Result<String, AppError> {
        let key = format!("{}:{}", token_keys::TOKEN, access_token);
        let info: Option<TokenInfo> = self.redis_pool.get(&key).await?;

        let Some(info) = info else {
            return Err(self.missing_token_error(access_token).await);
        };

        if info.expires_at < Utc::now() {
            return Err(AppError::TokenExpired(mask_token(access_token)));
        }

        // 令牌有效还要求设备仍处于启用状态
        let device = match self.cache.get_cached_device(&info.device_id).await? {
            Some(device) => device,
            None => {
                let device = self
                    .device_repo
                    .find_by_device_id(&info.device_id)
                    .await?
                    .ok_or_else(|| AppError::Unauthorized("设备不存在".to_string()))?;
                // 回填缓存失败不影响验证结果
                if let Err(e) = self.cache.cache_device(&device).await {
                    tracing::warn!(error = %e, "设备缓存回填失败");
                }
                device
            }
        };

        if !device.enabled {
            return Err(AppError::Unauthorized("设备已禁用".to_string()));
        }

        Ok(info.device_id)
    }

    /// 用刷新令牌换取新令牌对（刷新令牌一次性使用）
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AppError> {
        let key = format!("{}:{}", token_keys::REFRESH, refresh_token);
        // 原子取出并删除，旧刷新令牌即刻失效
        let info: Option<RefreshInfo> = self.redis_pool.get_del(&key).await?;

        let Some(info) = info else {
            return Err(self.missing_token_error(refresh_token).await);
        };

        // 吊销配对的访问令牌
        let access_key = format!("{}:{}", token_keys::TOKEN, info.access_token);
        self.redis_pool.del(&access_key).await?;

        let device = self
            .device_repo
            .find_by_device_id(&info.device_id)
            .await?
            .ok_or_else(|| AppError::Unauthorized("设备不存在".to_string()))?;
        if !device.enabled {
            return Err(AppError::Unauthorized("设备已禁用".to_string()));
        }

        let pair = self.store_new_pair(&info.device_id).await?;

        tracing::debug!(device_id = %info.device_id, "已刷新设备令牌");
        Ok(pair)
    }

    /// 吊销设备的全部在途令牌
    pub async fn revoke(&self, device_id: &str) -> Result<(), AppError> {
        let index_key = format!("{}:{}", token_keys::DEVICE_INDEX, device_id);
        let tokens = self.redis_pool.smembers(&index_key).await?;

        for token in &tokens {
            let token_key = if token.starts_with("vs_drt_") {
                format!("{}:{}", token_keys::REFRESH, token)
            } else {
                format!("{}:{}", token_keys::TOKEN, token)
            };
            self.redis_pool.del(&token_key).await?;

            // 写入吊销墓碑，让在途验证得到明确的 TokenRevoked
            let tombstone = format!("{}:{}", token_keys::REVOKED, token);
            self.redis_pool
                .set_ex(&tombstone, &true, self.settings.refresh_ttl_seconds)
                .await?;
        }

        self.redis_pool.del(&index_key).await?;
        self.cache.invalidate_device(device_id).await?;

        tracing::info!(device_id, revoked = tokens.len(), "已吊销设备令牌");
        Ok(())
    }

    async fn store_new_pair(&self, device_id: &str) -> Result<TokenPair, AppError> {
        let access_token = generate_token(TokenType::DeviceAccessToken)?;
        let refresh_token = generate_token(TokenType::DeviceRefreshToken)?;
        let now = Utc::now();

        let info = TokenInfo {
            device_id: device_id.to_string(),
            issued_at: now,
            expires_at: now + Duration::seconds(self.settings.access_ttl_seconds as i64),
            refresh_token: refresh_token.clone(),
        };
        let refresh_info = RefreshInfo {
            device_id: device_id.to_string(),
            access_token: access_token.clone(),
        };

        let access_key = format!("{}:{}", token_keys::TOKEN, access_token);
        self.redis_pool
            .set_ex(&access_key, &info, self.settings.access_ttl_seconds)
            .await?;

        let refresh_key = format!("{}:{}", token_keys::REFRESH, refresh_token);
        self.redis_pool
            .set_ex(&refresh_key, &refresh_info, self.settings.refresh_ttl_seconds)
            .await?;

        // 吊销用索引
        let index_key = format!("{}:{}", token_keys::DEVICE_INDEX, device_id);
        self.redis_pool.sadd(&index_key, &access_token).await?;
        self.redis_pool.sadd(&index_key, &refresh_token).await?;
        self.redis_pool
            .expire(&index_key, self.settings.refresh_ttl_seconds)
            .await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: self.settings.access_ttl_seconds,
            token_type: "Bearer".to_string(),
        })
    }

    /// 区分「已吊销」与「无效 / 已过期被回收」
    async fn missing_token_error(&self, token: &str) -> AppError {
        let tombstone = format!("{}:{}", token_keys::REVOKED, token);
        match self.redis_pool.exists(&tombstone).await {
            Ok(true) => AppError::TokenRevoked(mask_token(token)),
            _ => AppError::Unauthorized("令牌无效".to_string()),
        }
    }
}
