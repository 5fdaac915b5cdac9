//! 传感器读数模型

use crate::models::Location;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 传感器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    Temperature,
    Humidity,
    Smoke,
    Co,
}

impl SensorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorType::Temperature => "temperature",
            SensorType::Humidity => "humidity",
            SensorType::Smoke => "smoke",
            SensorType::Co => "co",
        }
    }

    /// 物理有效范围（闭区间）。超出范围的读数视为无效
    pub fn valid_range(&self) -> (f64, f64) {
        match self {
            SensorType::Temperature => (-50.0, 100.0),
            SensorType::Humidity => (0.0, 100.0),
            SensorType::Smoke | SensorType::Co => (0.0, f64::INFINITY),
        }
    }

    /// 累积型传感器：平凡变化的判定基于绝对告警下限而非差值
    pub fn is_accumulative(&self) -> bool {
        matches!(self, SensorType::Smoke | SensorType::Co)
    }
}

impl std::str::FromStr for SensorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temperature" => Ok(SensorType::Temperature),
            "humidity" => Ok(SensorType::Humidity),
            "smoke" => Ok(SensorType::Smoke),
            "co" => Ok(SensorType::Co),
            other => Err(format!("未知的传感器类型: {}", other)),
        }
    }
}

impl std::fmt::Display for SensorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单条传感器数据（进入流水线的最小单元）
///
/// `id` 由 ID 分配器生成；`timestamp` 为设备侧时间，
/// `preprocessed_at` 为预过滤通过时打上的服务器时间。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorData {
    pub id: i64,
    pub device_id: String,
    pub sensor_type: SensorType,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preprocessed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_type_serde_roundtrip() {
        let json = serde_json::to_string(&SensorType::Temperature).unwrap();
        assert_eq!(json, "\"temperature\"");

        let parsed: SensorType = serde_json::from_str("\"co\"").unwrap();
        assert_eq!(parsed, SensorType::Co);
    }

    #[test]
    fn test_valid_ranges() {
        assert_eq!(SensorType::Temperature.valid_range(), (-50.0, 100.0));
        assert_eq!(SensorType::Humidity.valid_range(), (0.0, 100.0));
        let (lo, hi) = SensorType::Smoke.valid_range();
        assert_eq!(lo, 0.0);
        assert!(hi.is_infinite());
    }

    #[test]
    fn test_accumulative_classification() {
        assert!(SensorType::Smoke.is_accumulative());
        assert!(SensorType::Co.is_accumulative());
        assert!(!SensorType::Temperature.is_accumulative());
        assert!(!SensorType::Humidity.is_accumulative());
    }
}
