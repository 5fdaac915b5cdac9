//! 告警规则模型

use crate::models::{Location, SensorType};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// 告警级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlarmSeverity {
    Low,
    Medium,
    High,
}

impl AlarmSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmSeverity::Low => "LOW",
            AlarmSeverity::Medium => "MEDIUM",
            AlarmSeverity::High => "HIGH",
        }
    }

    /// 主题后缀（`alarm/low` 等）
    pub fn topic_suffix(&self) -> &'static str {
        match self {
            AlarmSeverity::Low => "low",
            AlarmSeverity::Medium => "medium",
            AlarmSeverity::High => "high",
        }
    }
}

/// 比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleOperator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl RuleOperator {
    /// 按声明语义比较。`==` / `!=` 在调用方提供 epsilon 时做容差比较，
    /// epsilon 为 None 时是精确比较
    pub fn apply(&self, value: f64, threshold: f64, epsilon: Option<f64>) -> bool {
        match self {
            RuleOperator::Gt => value > threshold,
            RuleOperator::Ge => value >= threshold,
            RuleOperator::Lt => value < threshold,
            RuleOperator::Le => value <= threshold,
            RuleOperator::Eq => match epsilon {
                Some(eps) => (value - threshold).abs() <= eps,
                None => value == threshold,
            },
            RuleOperator::Ne => match epsilon {
                Some(eps) => (value - threshold).abs() > eps,
                None => value != threshold,
            },
        }
    }
}

impl std::str::FromStr for RuleOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ">" => Ok(RuleOperator::Gt),
            ">=" => Ok(RuleOperator::Ge),
            "<" => Ok(RuleOperator::Lt),
            "<=" => Ok(RuleOperator::Le),
            "==" | "=" => Ok(RuleOperator::Eq),
            "!=" => Ok(RuleOperator::Ne),
            other => Err(format!("无效的运算符: {}", other)),
        }
    }
}

/// 告警规则
///
/// 同一 (device_id, sensor_type) 可以挂多条规则，评估时全部生效。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmRule {
    pub id: String,
    pub name: String,
    pub device_id: String,
    pub sensor_type: SensorType,
    pub operator: RuleOperator,
    pub threshold: f64,
    /// 时间窗口（秒），0 表示不开窗；开窗时每个指纹窗口内最多触发一次
    #[serde(default)]
    pub window_seconds: u32,
    pub severity: AlarmSeverity,
    pub alarm_type: String,
    pub building_id: Option<String>,
    pub floor_id: Option<String>,
    pub room_id: Option<String>,
    pub zone_id: Option<String>,
    pub enabled: bool,
    pub metadata: Option<String>,
}

impl AlarmRule {
    /// 规则的位置标签（复制到由它触发的告警上）
    pub fn location(&self) -> Location {
        Location {
            building: self.building_id.clone(),
            floor: self.floor_id.clone(),
            room: self.room_id.clone(),
            zone: self.zone_id.clone(),
        }
    }

    /// 告警指纹：逻辑上重复的告警共享同一指纹
    pub fn fingerprint(&self) -> String {
        format!("{}:{}:{}", self.id, self.device_id, self.sensor_type)
    }
}

/// 创建规则请求
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateRuleRequest {
    #[validate(length(min = 1, max = 100, message = "规则名称长度应在 1-100 字符之间"))]
    pub name: String,

    #[validate(length(min = 1, max = 64, message = "设备标识长度应在 1-64 字符之间"))]
    pub device_id: String,

    pub sensor_type: SensorType,
    pub operator: RuleOperator,
    pub threshold: f64,

    #[validate(range(max = 86400, message = "时间窗口不能超过 86400 秒"))]
    #[serde(default)]
    pub window_seconds: u32,

    pub severity: AlarmSeverity,

    #[validate(length(min = 1, max = 32, message = "告警类型长度应在 1-32 字符之间"))]
    pub alarm_type: String,

    pub building_id: Option<String>,
    pub floor_id: Option<String>,
    pub room_id: Option<String>,
    pub zone_id: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    pub metadata: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// 更新规则请求（缺省字段保持原值）
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateRuleRequest {
    #[validate(length(min = 1, max = 100, message = "规则名称长度应在 1-100 字符之间"))]
    pub name: Option<String>,
    pub operator: Option<RuleOperator>,
    pub threshold: Option<f64>,
    pub window_seconds: Option<u32>,
    pub severity: Option<AlarmSeverity>,
    pub alarm_type: Option<String>,
    pub enabled: Option<bool>,
    pub metadata: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_strict_semantics() {
        assert!(RuleOperator::Gt.apply(50.1, 50.0, None));
        assert!(!RuleOperator::Gt.apply(50.0, 50.0, None));
        assert!(RuleOperator::Ge.apply(50.0, 50.0, None));
        assert!(RuleOperator::Lt.apply(49.9, 50.0, None));
        assert!(!RuleOperator::Lt.apply(50.0, 50.0, None));
        assert!(RuleOperator::Le.apply(50.0, 50.0, None));
    }

    #[test]
    fn test_operator_equality_exact_by_default() {
        assert!(RuleOperator::Eq.apply(50.0, 50.0, None));
        assert!(!RuleOperator::Eq.apply(50.0000001, 50.0, None));
        assert!(RuleOperator::Ne.apply(50.0000001, 50.0, None));
    }

    #[test]
    fn test_operator_equality_with_epsilon() {
        assert!(RuleOperator::Eq.apply(50.0000001, 50.0, Some(1e-3)));
        assert!(!RuleOperator::Ne.apply(50.0000001, 50.0, Some(1e-3)));
        assert!(RuleOperator::Ne.apply(50.1, 50.0, Some(1e-3)));
    }

    #[test]
    fn test_operator_serde_symbols() {
        let op: RuleOperator = serde_json::from_str("\">\"").unwrap();
        assert_eq!(op, RuleOperator::Gt);
        assert_eq!(serde_json::to_string(&RuleOperator::Ne).unwrap(), "\"!=\"");
    }

    #[test]
    fn test_fingerprint_shape() {
        let rule = AlarmRule {
            id: "r1".into(),
            name: "烟雾超标".into(),
            device_id: "d1".into(),
            sensor_type: SensorType::Smoke,
            operator: RuleOperator::Gt,
            threshold: 50.0,
            window_seconds: 60,
            severity: AlarmSeverity::High,
            alarm_type: "SMOKE".into(),
            building_id: None,
            floor_id: None,
            room_id: None,
            zone_id: None,
            enabled: true,
            metadata: None,
        };
        assert_eq!(rule.fingerprint(), "r1:d1:smoke");
    }

    #[test]
    fn test_severity_topic_suffix() {
        assert_eq!(AlarmSeverity::High.topic_suffix(), "high");
        assert_eq!(
            serde_json::to_string(&AlarmSeverity::Medium).unwrap(),
            "\"MEDIUM\""
        );
    }
}
