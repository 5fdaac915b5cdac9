//! 设备接入协议消息定义
//!
//! 长连接上传输行分隔 JSON。除 auth / heartbeat / data 之外的任何
//! 形态都按协议错误处理并关闭连接。

use crate::models::SensorType;
use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 设备发送的消息类型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    /// 认证消息
    Auth(AuthMessage),

    /// 心跳
    Heartbeat,

    /// 传感器数据上报
    Data(DataMessage),
}

/// 认证消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthMessage {
    pub token: String,
}

/// 传感器数据消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMessage {
    pub readings: Vec<WireReading>,
    /// 设备侧毫秒时间戳
    pub timestamp: i64,
    /// 预过滤通过时打上的服务器毫秒时间戳
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocessed_at: Option<i64>,
}

/// 单条上报读数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireReading {
    #[serde(rename = "type")]
    pub sensor_type: SensorType,
    pub value: f64,
    pub unit: String,
}

/// 服务器发送的响应类型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
    /// 认证结果
    AuthResponse(AuthResponseMessage),

    /// 心跳响应
    HeartbeatResponse(HeartbeatResponseMessage),
}

/// 认证结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponseMessage {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// 心跳响应（携带服务器时间）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponseMessage {
    pub timestamp: String,
}

impl ServerReply {
    /// 认证成功响应
    pub fn auth_success() -> Self {
        ServerReply::AuthResponse(AuthResponseMessage {
            status: "success".to_string(),
            reason: None,
        })
    }

    /// 认证失败响应
    pub fn auth_failure(reason: impl Into<String>) -> Self {
        ServerReply::AuthResponse(AuthResponseMessage {
            status: "failure".to_string(),
            reason: Some(reason.into()),
        })
    }

    /// 心跳响应
    pub fn heartbeat(now: DateTime<Utc>) -> Self {
        ServerReply::HeartbeatResponse(HeartbeatResponseMessage {
            timestamp: utils::format_iso8601(&now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_auth_message() {
        let msg: DeviceMessage = serde_json::from_str(r#"{"type":"auth","token":"T1"}"#).unwrap();
        match msg {
            DeviceMessage::Auth(auth) => assert_eq!(auth.token, "T1"),
            other => panic!("意外的消息类型: {:?}", other),
        }
    }

    #[test]
    fn test_parse_heartbeat() {
        let msg: DeviceMessage = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(matches!(msg, DeviceMessage::Heartbeat));
    }

    #[test]
    fn test_parse_data_message() {
        let raw = r#"{"type":"data","readings":[{"type":"temperature","value":25.0,"unit":"C"}],"timestamp":1700000000000}"#;
        let msg: DeviceMessage = serde_json::from_str(raw).unwrap();
        match msg {
            DeviceMessage::Data(data) => {
                assert_eq!(data.readings.len(), 1);
                assert_eq!(data.readings[0].sensor_type, SensorType::Temperature);
                assert_eq!(data.timestamp, 1_700_000_000_000);
                assert!(data.preprocessed_at.is_none());
            }
            other => panic!("意外的消息类型: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_shape_rejected() {
        assert!(serde_json::from_str::<DeviceMessage>(r#"{"type":"subscribe"}"#).is_err());
        assert!(serde_json::from_str::<DeviceMessage>(r#"{"hello":"world"}"#).is_err());
    }

    #[test]
    fn test_auth_response_envelope() {
        let reply = ServerReply::auth_success();
        let json: serde_json::Value = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "auth_response");
        assert_eq!(json["status"], "success");
        assert!(json.get("reason").is_none());

        let reply = ServerReply::auth_failure("Invalid token");
        let json: serde_json::Value = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["reason"], "Invalid token");
    }

    #[test]
    fn test_heartbeat_response_envelope() {
        let reply = ServerReply::heartbeat(Utc::now());
        let json: serde_json::Value = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "heartbeat_response");
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }
}
