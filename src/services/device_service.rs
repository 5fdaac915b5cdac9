//! 设备业务服务
//!
//! 设备入网（API Key 仅注册时返回一次）、启停与查询。
//! 禁用设备会一并吊销其全部令牌并关闭活跃会话。

use crate::errors::AppError;
use crate::models::{CreateDeviceRequest, CreateDeviceResponse, Device, PaginatedResponse, Pagination};
use crate::repositories::DeviceRepository;
use crate::security::{generate_token, hash_api_key, token_search_prefix, TokenType};
use crate::services::{CacheService, TokenService};
use crate::transport::SessionRegistry;
use std::sync::Arc;
use validator::Validate;

/// 设备业务服务
pub struct DeviceService {
    device_repo: Arc<DeviceRepository>,
    token_service: Arc<TokenService>,
    cache: Arc<CacheService>,
    registry: Arc<SessionRegistry>,
}

impl DeviceService {
    pub fn new(
        device_repo: Arc<DeviceRepository>,
        token_service: Arc<TokenService>,
        cache: Arc<CacheService>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            device_repo,
            token_service,
            cache,
            registry,
        }
    }

    /// 注册新设备
    pub async fn register(
        &self,
        request: CreateDeviceRequest,
    ) -> Result<CreateDeviceResponse, AppError> {
        request
            .validate()
            .map_err(|e| AppError::ValidationError(e.to_string()))?;

        if self
            .device_repo
            .find_by_device_id(&request.device_id)
            .await?
            .is_some()
        {
            return Err(AppError::Conflict(format!(
                "设备标识已存在: {}",
                request.device_id
            )));
        }

        let api_key = generate_token(TokenType::DeviceApiKey)?;
        let api_key_hash = hash_api_key(&api_key)?;
        let api_key_prefix = token_search_prefix(&api_key)?;

        let device = self
            .device_repo
            .create(&request, &api_key_hash, &api_key_prefix)
            .await?;

        tracing::info!(device_id = %device.device_id, "设备已注册");

        Ok(CreateDeviceResponse {
            device,
            // 完整 API Key 仅此一次返回
            api_key,
        })
    }

    /// 按业务标识获取设备
    pub async fn get(&self, device_id: &str) -> Result<Device, AppError> {
        self.device_repo
            .find_by_device_id(device_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("设备不存在: {}", device_id)))
    }

    /// 启用 / 禁用设备
    ///
    /// 禁用时吊销全部在途令牌并关闭活跃会话，保证被禁用设备的
    /// 会话在一个空闲周期内终止。
    pub async fn set_enabled(&self, device_id: &str, enabled: bool) -> Result<Device, AppError> {
        let device = self.get(device_id).await?;
        let device = self.device_repo.set_enabled(device.id, enabled).await?;

        self.cache.invalidate_device(device_id).await?;

        if !enabled {
            self.token_service.revoke(device_id).await?;
            if self.registry.close_device(device_id) {
                tracing::info!(device_id, "禁用设备的活跃会话已关闭");
            }
            self.cache.publish_device_status(device_id, false).await?;
        } else {
            self.cache.cache_device(&device).await?;
        }

        tracing::info!(device_id, enabled, "设备启停状态已更新");
        Ok(device)
    }

    /// 分页查询设备
    pub async fn list(&self, page: i64, page_size: i64) -> Result<PaginatedResponse<Device>, AppError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 100);

        let (devices, total) = self.device_repo.list(page, page_size).await?;
        let pagination = Pagination::new(page, page_size, total);

        Ok(PaginatedResponse::new(devices, pagination))
    }
}
