//! 告警通道
//!
//! 每个通道实现 `AlarmSink` 能力：历史归档、WebSocket 主题、
//! Redis 发布订阅主题与数据同步推送。通道之间互不感知，
//! 失败隔离由装饰器与分发监督者保证。

use crate::db::RedisPool;
use crate::errors::AppError;
use crate::models::AlarmEvent;
use crate::services::{HistoryService, SyncService};
use crate::websocket::{severity_topic, WsHub, TOPIC_ALL};
use async_trait::async_trait;
use std::sync::Arc;

/// 告警通道能力
#[async_trait]
pub trait AlarmSink: Send + Sync {
    fn name(&self) -> &str;

    /// 投递一条告警
    async fn deliver(&self, alarm: &AlarmEvent) -> Result<(), AppError>;
}

/// 历史归档通道
pub struct HistorySink {
    history: Arc<HistoryService>,
}

impl HistorySink {
    pub fn new(history: Arc<HistoryService>) -> Self {
        Self { history }
    }
}

#[async_trait]
impl AlarmSink for HistorySink {
    fn name(&self) -> &str {
        "history"
    }

    async fn deliver(&self, alarm: &AlarmEvent) -> Result<(), AppError> {
        self.history.store(alarm).await
    }
}

/// WebSocket 主题通道（alarm/all + alarm/{severity}）
pub struct WebSocketSink {
    hub: Arc<WsHub>,
}

impl WebSocketSink {
    pub fn new(hub: Arc<WsHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl AlarmSink for WebSocketSink {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn deliver(&self, alarm: &AlarmEvent) -> Result<(), AppError> {
        let payload = serde_json::to_string(alarm)?;

        self.hub.publish(TOPIC_ALL, &payload);
        self.hub.publish(&severity_topic(alarm.severity), &payload);
        Ok(())
    }
}

/// 发布订阅通道（Redis PUBLISH，主题后缀与 WebSocket 相同）
pub struct PubSubSink {
    redis_pool: Arc<RedisPool>,
}

impl PubSubSink {
    pub fn new(redis_pool: Arc<RedisPool>) -> Self {
        Self { redis_pool }
    }
}

#[async_trait]
impl AlarmSink for PubSubSink {
    fn name(&self) -> &str {
        "pubsub"
    }

    async fn deliver(&self, alarm: &AlarmEvent) -> Result<(), AppError> {
        let payload = serde_json::to_string(alarm)?;

        self.redis_pool.publish(TOPIC_ALL, &payload).await?;
        self.redis_pool
            .publish(&severity_topic(alarm.severity), &payload)
            .await?;
        Ok(())
    }
}

/// 数据同步推送通道
pub struct SyncSink {
    sync_service: Arc<SyncService>,
}

impl SyncSink {
    pub fn new(sync_service: Arc<SyncService>) -> Self {
        Self { sync_service }
    }
}

#[async_trait]
impl AlarmSink for SyncSink {
    fn name(&self) -> &str {
        "sync"
    }

    async fn deliver(&self, alarm: &AlarmEvent) -> Result<(), AppError> {
        self.sync_service.push_alarm_update(alarm).await
    }
}
