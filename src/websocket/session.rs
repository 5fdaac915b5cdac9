//! 仪表盘 WebSocket 连接 Actor
//!
//! 每个仪表盘连接对应一个 Actor 实例，负责主题订阅管理、
//! 快照 / 增量拉取与告警实时推送。

use crate::services::SyncService;
use crate::websocket::hub::{is_valid_topic, TopicEvent, WsHub};
use crate::websocket::messages::*;

use actix::{Actor, ActorContext, ActorFutureExt, AsyncContext, Handler, Running, StreamHandler};
use actix_web_actors::ws;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 心跳间隔
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// 客户端超时时间
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
/// 单连接最大订阅主题数
const MAX_SUBSCRIBED_TOPICS: usize = 8;

/// 仪表盘 WebSocket Session
pub struct WsSession {
    /// 连接唯一 ID（同时作为同步服务的客户端标识）
    pub id: Uuid,

    /// 最后心跳时间
    pub last_heartbeat: Instant,

    /// 已订阅的主题
    pub subscribed_topics: HashSet<String>,

    /// 客户端 IP
    pub client_ip: Option<String>,

    // 服务依赖
    pub hub: Arc<WsHub>,
    pub sync_service: Arc<SyncService>,
}

impl WsSession {
    pub fn new(client_ip: Option<String>, hub: Arc<WsHub>, sync_service: Arc<SyncService>) -> Self {
        Self {
            id: Uuid::new_v4(),
            last_heartbeat: Instant::now(),
            subscribed_topics: HashSet::new(),
            client_ip,
            hub,
            sync_service,
        }
    }

    /// 启动心跳检查
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket 客户端心跳超时，断开连接: {}", act.id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    /// 发送服务器消息
    fn send_message(&self, ctx: &mut ws::WebsocketContext<Self>, msg: ServerMessage) {
        match serde_json::to_string(&msg) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("序列化消息失败: {}", e),
        }
    }

    /// 处理订阅请求
    fn handle_subscribe(&mut self, ctx: &mut ws::WebsocketContext<Self>, sub: SubscribeMessage) {
        let invalid: Vec<&String> = sub
            .topics
            .iter()
            .filter(|topic| !is_valid_topic(topic))
            .collect();
        if !invalid.is_empty() {
            self.send_message(
                ctx,
                ServerMessage::SubscribeResult(SubscribeResultMessage {
                    success: false,
                    subscribed_topics: self.subscribed_topics.iter().cloned().collect(),
                    error: Some(format!("未知主题: {:?}", invalid)),
                }),
            );
            return;
        }

        if self.subscribed_topics.len() + sub.topics.len() > MAX_SUBSCRIBED_TOPICS {
            self.send_message(
                ctx,
                ServerMessage::SubscribeResult(SubscribeResultMessage {
                    success: false,
                    subscribed_topics: self.subscribed_topics.iter().cloned().collect(),
                    error: Some(format!("订阅主题数超过限制 (最大 {})", MAX_SUBSCRIBED_TOPICS)),
                }),
            );
            return;
        }

        let recipient = ctx.address().recipient();
        for topic in &sub.topics {
            self.hub.subscribe(topic, self.id, recipient.clone());
            self.subscribed_topics.insert(topic.clone());
        }

        info!("会话 {} 订阅了 {} 个主题", self.id, sub.topics.len());

        self.send_message(
            ctx,
            ServerMessage::SubscribeResult(SubscribeResultMessage {
                success: true,
                subscribed_topics: self.subscribed_topics.iter().cloned().collect(),
                error: None,
            }),
        );
    }

    /// 处理取消订阅
    fn handle_unsubscribe(&mut self, ctx: &mut ws::WebsocketContext<Self>, unsub: UnsubscribeMessage) {
        if unsub.topics.is_empty() {
            for topic in self.subscribed_topics.drain() {
                self.hub.unsubscribe(&topic, self.id);
            }
        } else {
            for topic in unsub.topics {
                self.hub.unsubscribe(&topic, self.id);
                self.subscribed_topics.remove(&topic);
            }
        }

        self.send_message(
            ctx,
            ServerMessage::SubscribeResult(SubscribeResultMessage {
                success: true,
                subscribed_topics: self.subscribed_topics.iter().cloned().collect(),
                error: None,
            }),
        );
    }

    /// 处理快照拉取
    fn handle_snapshot(&mut self, ctx: &mut ws::WebsocketContext<Self>, request: SnapshotRequest) {
        let sync_service = self.sync_service.clone();
        let client_id = self.id.to_string();

        let fut = async move { sync_service.snapshot(&client_id, request.since).await };

        ctx.spawn(actix::fut::wrap_future(fut).map(|result, act: &mut Self, ctx| {
            match result {
                Ok(snapshot) => {
                    debug!("快照拉取成功: session={}, count={}", act.id, snapshot.count);
                    act.send_message(ctx, ServerMessage::Snapshot(snapshot));
                }
                Err(e) => {
                    error!("快照拉取失败: session={}, error={}", act.id, e);
                    act.send_message(ctx, ServerMessage::error("SNAPSHOT_FAILED", e.to_string()));
                }
            }
        }));
    }

    /// 处理增量拉取
    fn handle_delta(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let sync_service = self.sync_service.clone();
        let client_id = self.id.to_string();

        let fut = async move { sync_service.delta(&client_id).await };

        ctx.spawn(actix::fut::wrap_future(fut).map(|result, act: &mut Self, ctx| {
            match result {
                Ok(delta) => act.send_message(ctx, ServerMessage::Delta(delta)),
                Err(e) => {
                    error!("增量拉取失败: session={}, error={}", act.id, e);
                    act.send_message(ctx, ServerMessage::error("DELTA_FAILED", e.to_string()));
                }
            }
        }));
    }

    /// 处理客户端消息
    fn handle_client_message(&mut self, ctx: &mut ws::WebsocketContext<Self>, text: &str) {
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                self.send_message(
                    ctx,
                    ServerMessage::error("INVALID_MESSAGE", format!("消息格式错误: {}", e)),
                );
                return;
            }
        };

        match msg {
            ClientMessage::Subscribe(sub) => self.handle_subscribe(ctx, sub),
            ClientMessage::Unsubscribe(unsub) => self.handle_unsubscribe(ctx, unsub),
            ClientMessage::Snapshot(request) => self.handle_snapshot(ctx, request),
            ClientMessage::Delta => self.handle_delta(ctx),
            ClientMessage::Ping => self.send_message(ctx, ServerMessage::Pong),
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("仪表盘连接建立: session={}, ip={:?}", self.id, self.client_ip);

        self.start_heartbeat(ctx);

        self.send_message(
            ctx,
            ServerMessage::Connected(ConnectedMessage {
                message: "连接已建立".to_string(),
                client_id: self.id.to_string(),
                server_time: Utc::now(),
            }),
        );
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        info!("仪表盘连接关闭: session={}", self.id);
        self.hub.unsubscribe_all(self.id);
        Running::Stop
    }
}

/// 处理 WebSocket 协议消息
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                error!("WebSocket 协议错误: session={}, error={}", self.id, e);
                ctx.stop();
                return;
            }
        };

        match msg {
            ws::Message::Text(text) => {
                self.last_heartbeat = Instant::now();
                self.handle_client_message(ctx, &text);
            }
            ws::Message::Ping(msg) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&msg);
            }
            ws::Message::Pong(_) => {
                self.last_heartbeat = Instant::now();
            }
            ws::Message::Close(reason) => {
                info!("仪表盘客户端关闭连接: session={}, reason={:?}", self.id, reason);
                ctx.close(reason);
                ctx.stop();
            }
            _ => {}
        }
    }
}

/// 告警推送：只转发给订阅了该主题的会话
impl Handler<TopicEvent> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: TopicEvent, ctx: &mut Self::Context) {
        if self.subscribed_topics.contains(&msg.topic) {
            // 负载已是序列化好的 JSON，包一层推送信封
            ctx.text(format!(
                r#"{{"type":"push","topic":"{}","data":{}}}"#,
                msg.topic, msg.payload
            ));
        }
    }
}
