//! 告警事件模型

use crate::models::{AlarmSeverity, Location};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 告警事件
///
/// 由候选告警富化生成后即不可变，仅 ack / resolve 两个状态迁移例外。
/// 通知信封中 `id` 以字符串形式传输（64 位 ID 超出 JS 安全整数范围）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmEvent {
    #[serde(with = "id_as_string")]
    pub id: i64,
    pub device_id: String,
    pub alarm_type: String,
    pub severity: AlarmSeverity,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub location: Location,
    pub acknowledged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

impl AlarmEvent {
    /// 标记为已确认
    pub fn acknowledge(&mut self, by: &str, at: DateTime<Utc>) {
        self.acknowledged = true;
        self.acknowledged_at = Some(at);
        self.acknowledged_by = Some(by.to_string());
    }

    /// 标记为已解除
    pub fn resolve(&mut self, by: &str, at: DateTime<Utc>) {
        self.resolved = true;
        self.resolved_at = Some(at);
        self.resolved_by = Some(by.to_string());
    }
}

/// 64 位 ID 与 JSON 字符串互转
mod id_as_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&id.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_alarm() -> AlarmEvent {
        AlarmEvent {
            id: 7_205_759_403_792_793_601,
            device_id: "device-1".into(),
            alarm_type: "SMOKE".into(),
            severity: AlarmSeverity::High,
            value: 80.0,
            unit: "ppm".into(),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            location: Location {
                building: Some("b1".into()),
                floor: Some("f2".into()),
                room: Some("server-rack-2".into()),
                zone: Some("z3".into()),
            },
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved: false,
            resolved_at: None,
            resolved_by: None,
            notes: None,
            metadata: None,
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let alarm = sample_alarm();
        let json = serde_json::to_string(&alarm).unwrap();
        let decoded: AlarmEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.id, alarm.id);
        assert_eq!(decoded.device_id, alarm.device_id);
        assert_eq!(decoded.severity, alarm.severity);
        assert_eq!(decoded.value, alarm.value);
        assert_eq!(decoded.timestamp, alarm.timestamp);
        assert_eq!(decoded.location, alarm.location);
        assert!(!decoded.acknowledged);
        assert!(!decoded.resolved);
    }

    #[test]
    fn test_id_serialized_as_string() {
        let alarm = sample_alarm();
        let json: serde_json::Value = serde_json::to_value(&alarm).unwrap();
        assert_eq!(json["id"], "7205759403792793601");
        assert_eq!(json["severity"], "HIGH");
    }

    #[test]
    fn test_ack_resolve_transitions() {
        let mut alarm = sample_alarm();
        let now = Utc::now();

        alarm.acknowledge("operator-1", now);
        assert!(alarm.acknowledged);
        assert_eq!(alarm.acknowledged_by.as_deref(), Some("operator-1"));

        alarm.resolve("operator-2", now);
        assert!(alarm.resolved);
        assert_eq!(alarm.resolved_by.as_deref(), Some("operator-2"));
    }
}
