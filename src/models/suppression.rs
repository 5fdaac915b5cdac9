//! 消防抑制模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 抑制介质类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuppressionType {
    Water,
    Foam,
    Gas,
}

impl SuppressionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressionType::Water => "water",
            SuppressionType::Foam => "foam",
            SuppressionType::Gas => "gas",
        }
    }

    /// 按房间标签选择抑制介质：
    /// 机房 / 数据中心用气体，厨房 / 实验室用泡沫，其余用水
    pub fn for_room(room_id: Option<&str>) -> Self {
        let Some(room) = room_id else {
            return SuppressionType::Water;
        };
        let room = room.to_lowercase();

        if room.contains("server") || room.contains("data") {
            SuppressionType::Gas
        } else if room.contains("kitchen") || room.contains("lab") {
            SuppressionType::Foam
        } else {
            SuppressionType::Water
        }
    }
}

impl std::str::FromStr for SuppressionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "water" => Ok(SuppressionType::Water),
            "foam" => Ok(SuppressionType::Foam),
            "gas" => Ok(SuppressionType::Gas),
            other => Err(format!("未知的抑制类型: {}", other)),
        }
    }
}

impl std::fmt::Display for SuppressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 设备当前的抑制状态（每设备至多一个）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionState {
    #[serde(rename = "type")]
    pub suppression_type: SuppressionType,
    pub zone_id: String,
    /// 强度 0-100
    pub intensity: u8,
    /// 激活时间（毫秒时间戳）
    pub activated_at: i64,
    /// 最近一次更新时间（毫秒时间戳）
    pub last_updated: i64,
}

/// 抑制激活的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// 新建抑制记录
    Activated,
    /// 同类型抑制已存在，更新了强度与时间
    Updated,
    /// 设备上已有不同类型的抑制在运行
    Conflict,
    /// 设备缺失 / 已禁用 / 未连接
    DeviceUnavailable,
}

/// 抑制激活事件（激活成功后发布）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionEvent {
    pub event: String,
    pub device_id: String,
    pub zone_id: String,
    #[serde(rename = "type")]
    pub suppression_type: SuppressionType,
    pub intensity: u8,
    /// 毫秒时间戳
    pub timestamp: i64,
}

impl SuppressionEvent {
    pub fn activated(
        device_id: &str,
        zone_id: &str,
        suppression_type: SuppressionType,
        intensity: u8,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            event: "suppression_activated".to_string(),
            device_id: device_id.to_string(),
            zone_id: zone_id.to_string(),
            suppression_type,
            intensity,
            timestamp: at.timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suppression_type_for_room() {
        assert_eq!(
            SuppressionType::for_room(Some("server-rack-2")),
            SuppressionType::Gas
        );
        assert_eq!(
            SuppressionType::for_room(Some("Data-Center-1")),
            SuppressionType::Gas
        );
        assert_eq!(
            SuppressionType::for_room(Some("kitchen-3f")),
            SuppressionType::Foam
        );
        assert_eq!(
            SuppressionType::for_room(Some("chem-lab")),
            SuppressionType::Foam
        );
        assert_eq!(
            SuppressionType::for_room(Some("office-201")),
            SuppressionType::Water
        );
        assert_eq!(SuppressionType::for_room(None), SuppressionType::Water);
    }

    #[test]
    fn test_event_envelope_shape() {
        let event = SuppressionEvent::activated(
            "device-1",
            "zone-7",
            SuppressionType::Gas,
            100,
            Utc::now(),
        );
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], "suppression_activated");
        assert_eq!(json["type"], "gas");
        assert_eq!(json["intensity"], 100);
        assert!(json["timestamp"].is_i64());
    }
}
