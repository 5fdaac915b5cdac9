//! 设备数据仓库

use crate::db::PostgresPool;
use crate::errors::AppError;
use crate::models::{CreateDeviceRequest, Device};
use chrono::Utc;
use uuid::Uuid;

/// 设备数据仓库
#[derive(Clone)]
pub struct DeviceRepository {
    pool: PostgresPool,
}

impl DeviceRepository {
    pub fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }

    /// 创建设备
    pub async fn create(
        &self,
        request: &CreateDeviceRequest,
        api_key_hash: &str,
        api_key_prefix: &str,
    ) -> Result<Device, AppError> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        let device = sqlx::query_as::<_, Device>(
            r#"
            INSERT INTO devices (
                id, device_id, name, device_type, api_key_hash, api_key_prefix,
                building_id, floor_id, room_id, zone_id,
                enabled, registered_at, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, TRUE, $11, $12)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&request.device_id)
        .bind(&request.name)
        .bind(&request.device_type)
        .bind(api_key_hash)
        .bind(api_key_prefix)
        .bind(&request.building_id)
        .bind(&request.floor_id)
        .bind(&request.room_id)
        .bind(&request.zone_id)
        .bind(now)
        .bind(&request.metadata)
        .fetch_one(self.pool.pool())
        .await?;

        Ok(device)
    }

    /// 根据主键查找设备
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Device>, AppError> {
        let device = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;

        Ok(device)
    }

    /// 根据业务设备标识查找设备
    pub async fn find_by_device_id(&self, device_id: &str) -> Result<Option<Device>, AppError> {
        let device = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE device_id = $1")
            .bind(device_id)
            .fetch_optional(self.pool.pool())
            .await?;

        Ok(device)
    }

    /// 根据 API Key 前缀查找设备
    pub async fn find_by_api_key_prefix(&self, prefix: &str) -> Result<Option<Device>, AppError> {
        let device =
            sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE api_key_prefix = $1")
                .bind(prefix)
                .fetch_optional(self.pool.pool())
                .await?;

        Ok(device)
    }

    /// 更新设备启停状态
    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<Device, AppError> {
        let device = sqlx::query_as::<_, Device>(
            "UPDATE devices SET enabled = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(enabled)
        .fetch_one(self.pool.pool())
        .await?;

        Ok(device)
    }

    /// 更新设备最后在线时间
    pub async fn update_last_seen(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE devices SET last_seen_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await?;

        Ok(())
    }

    /// 分页查询设备
    pub async fn list(&self, page: i64, page_size: i64) -> Result<(Vec<Device>, i64), AppError> {
        let offset = (page - 1) * page_size;

        let devices = sqlx::query_as::<_, Device>(
            "SELECT * FROM devices ORDER BY registered_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(page_size)
        .bind(offset)
        .fetch_all(self.pool.pool())
        .await?;

        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM devices")
            .fetch_one(self.pool.pool())
            .await?;

        Ok((devices, total.0))
    }
}
