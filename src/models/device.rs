//! 设备模型

use crate::models::Location;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// 设备记录
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Device {
    pub id: Uuid,
    /// 业务侧设备唯一标识（接入协议中使用）
    pub device_id: String,
    pub name: String,
    pub device_type: String,
    /// API Key 的 argon2 哈希（完整 Key 仅在创建时返回一次）
    #[serde(skip_serializing)]
    pub api_key_hash: String,
    /// API Key 搜索前缀（用于查找与展示）
    pub api_key_prefix: String,
    pub building_id: Option<String>,
    pub floor_id: Option<String>,
    pub room_id: Option<String>,
    pub zone_id: Option<String>,
    pub enabled: bool,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub metadata: Option<String>,
}

impl Device {
    /// 设备的位置标签
    pub fn location(&self) -> Location {
        Location {
            building: self.building_id.clone(),
            floor: self.floor_id.clone(),
            room: self.room_id.clone(),
            zone: self.zone_id.clone(),
        }
    }
}

/// 设备注册请求
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateDeviceRequest {
    #[validate(length(min = 1, max = 64, message = "设备标识长度应在 1-64 字符之间"))]
    pub device_id: String,

    #[validate(length(min = 1, max = 100, message = "设备名称长度应在 1-100 字符之间"))]
    pub name: String,

    #[validate(length(min = 1, max = 32, message = "设备类型长度应在 1-32 字符之间"))]
    pub device_type: String,

    pub building_id: Option<String>,
    pub floor_id: Option<String>,
    pub room_id: Option<String>,
    pub zone_id: Option<String>,
    pub metadata: Option<String>,
}

/// 设备注册响应（API Key 仅此一次返回）
#[derive(Debug, Clone, Serialize)]
pub struct CreateDeviceResponse {
    pub device: Device,
    pub api_key: String,
}

/// 设备在线状态（写入状态缓存，TTL 略大于读空闲超时）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
}
