//! 仪表盘 WebSocket 消息协议
//!
//! 定义仪表盘客户端和服务器之间的消息协议。

use crate::services::AlarmSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 客户端发送的消息类型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// 订阅告警主题
    Subscribe(SubscribeMessage),

    /// 取消订阅
    Unsubscribe(UnsubscribeMessage),

    /// 拉取快照
    Snapshot(SnapshotRequest),

    /// 拉取增量（自上次快照以来）
    Delta,

    /// 心跳
    Ping,
}

/// 服务器发送的消息类型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// 连接成功
    Connected(ConnectedMessage),

    /// 订阅结果
    SubscribeResult(SubscribeResultMessage),

    /// 快照响应
    Snapshot(AlarmSnapshot),

    /// 增量响应
    Delta(AlarmSnapshot),

    /// 心跳响应
    Pong,

    /// 错误消息
    Error(ErrorMessage),
}

/// 订阅消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeMessage {
    /// 要订阅的主题列表（alarm/all、alarm/{low|medium|high}、alarm/snapshot）
    pub topics: Vec<String>,
}

/// 取消订阅消息（为空则取消全部）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeMessage {
    #[serde(default)]
    pub topics: Vec<String>,
}

/// 快照请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    /// 起始时间（缺省为一小时前）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}

/// 订阅结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeResultMessage {
    pub success: bool,
    pub subscribed_topics: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 连接成功消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedMessage {
    pub message: String,
    pub client_id: String,
    pub server_time: DateTime<Utc>,
}

/// 错误消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
}

impl ServerMessage {
    /// 创建错误消息
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorMessage {
            code: code.into(),
            message: message.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","topics":["alarm/all","alarm/high"]}"#)
                .unwrap();
        match msg {
            ClientMessage::Subscribe(sub) => assert_eq!(sub.topics.len(), 2),
            other => panic!("意外的消息类型: {:?}", other),
        }
    }

    #[test]
    fn test_parse_snapshot_request() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"snapshot"}"#).unwrap();
        match msg {
            ClientMessage::Snapshot(req) => assert!(req.since.is_none()),
            other => panic!("意外的消息类型: {:?}", other),
        }
    }

    #[test]
    fn test_server_message_envelope() {
        let json: serde_json::Value =
            serde_json::to_value(ServerMessage::error("INVALID_TOPIC", "未知主题")).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "INVALID_TOPIC");
    }
}
