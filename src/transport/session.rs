//! 设备会话处理
//!
//! 每个 TCP 连接一个任务。会话状态机：
//! 握手（仅接受 auth）→ 已认证（heartbeat / data）→ 关闭。
//! 读空闲超时、慢消费者与协议错误都会终止会话。

use crate::config::SessionSettings;
use crate::errors::AppError;
use crate::models::{SensorData, SensorType};
use crate::queue::TopicProducer;
use crate::repositories::DeviceRepository;
use crate::services::{CacheService, TokenService};
use crate::transport::messages::{DataMessage, DeviceMessage, ServerReply};
use crate::transport::prefilter::{FilterDecision, PreFilter};
use crate::transport::registry::SessionRegistry;
use crate::utils::{self, IdAllocator, TYPE_READING};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 会话依赖集合
pub struct SessionContext {
    pub settings: SessionSettings,
    pub token_service: Arc<TokenService>,
    pub cache: Arc<CacheService>,
    pub device_repo: Arc<DeviceRepository>,
    pub prefilter: Arc<PreFilter>,
    pub producer: Arc<TopicProducer<SensorData>>,
    pub allocator: Arc<IdAllocator>,
    pub registry: Arc<SessionRegistry>,
    /// 协议错误计数（静默丢弃的畸形帧）
    pub protocol_errors: AtomicU64,
}

/// 会话状态
#[derive(Debug, PartialEq)]
enum SessionState {
    Handshake,
    Authenticated(String),
}

/// 处理单个设备连接，连接关闭时返回
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
    shutdown: CancellationToken,
) {
    let session_id = Uuid::new_v4();
    let cancel = shutdown.child_token();
    tracing::debug!(%session_id, %peer, "设备连接建立");

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // 发送走独立任务与有界队列：会话侧写永不阻塞
    let (write_tx, mut write_rx) = mpsc::channel::<String>(ctx.settings.max_pending_writes);
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        while let Some(mut line) = write_rx.recv().await {
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                writer_cancel.cancel();
                break;
            }
        }
    });

    let mut state = SessionState::Handshake;
    let idle = Duration::from_secs(ctx.settings.idle_seconds);
    let mut line = String::new();

    loop {
        line.clear();

        let read_result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tokio::time::timeout(idle, reader.read_line(&mut line)) => result,
        };

        let bytes = match read_result {
            // 读空闲超时
            Err(_) => {
                tracing::info!(%session_id, "连接空闲超时，关闭会话");
                break;
            }
            Ok(Err(e)) => {
                tracing::debug!(%session_id, error = %e, "读取失败，关闭会话");
                break;
            }
            Ok(Ok(n)) => n,
        };

        if bytes == 0 {
            tracing::debug!(%session_id, "对端关闭连接");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let message: DeviceMessage = match serde_json::from_str(trimmed) {
            Ok(msg) => msg,
            Err(e) => {
                // 协议错误：静默计数并关闭，不回复
                ctx.protocol_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%session_id, error = %e, "畸形帧，关闭连接");
                break;
            }
        };

        match (&state, message) {
            (SessionState::Handshake, DeviceMessage::Auth(auth)) => {
                match authenticate(&ctx, &peer, &auth.token, session_id, &cancel).await {
                    Ok(device_id) => {
                        if !send(&write_tx, &ServerReply::auth_success()) {
                            break;
                        }
                        state = SessionState::Authenticated(device_id);
                    }
                    Err(e) => {
                        let reason = match &e {
                            AppError::TokenExpired(_) => "Token expired",
                            AppError::TokenRevoked(_) => "Token revoked",
                            AppError::RateLimited(_) => "Too many attempts",
                            _ => "Invalid token",
                        };
                        send(&write_tx, &ServerReply::auth_failure(reason));
                        tracing::warn!(%session_id, %peer, error = %e, "设备认证失败");
                        break;
                    }
                }
            }

            // 握手阶段收到非认证消息：回复失败并终止
            (SessionState::Handshake, _) => {
                send(&write_tx, &ServerReply::auth_failure("Not authenticated"));
                break;
            }

            (SessionState::Authenticated(device_id), DeviceMessage::Heartbeat) => {
                if !heartbeat(&ctx, device_id).await {
                    // 设备已被禁用，会话在一个空闲周期内关闭
                    break;
                }
                if !send(&write_tx, &ServerReply::heartbeat(Utc::now())) {
                    break;
                }
            }

            (SessionState::Authenticated(device_id), DeviceMessage::Data(data)) => {
                forward_data(&ctx, device_id, &data).await;
            }

            // 已认证会话上的重复认证：按新的凭证重新校验
            (SessionState::Authenticated(prev_device), DeviceMessage::Auth(auth)) => {
                let prev_device = prev_device.clone();
                match authenticate(&ctx, &peer, &auth.token, session_id, &cancel).await {
                    Ok(device_id) => {
                        // 换绑到新设备时注销旧设备的映射
                        if device_id != prev_device
                            && ctx.registry.remove(&prev_device, session_id)
                        {
                            if let Err(e) =
                                ctx.cache.publish_device_status(&prev_device, false).await
                            {
                                tracing::warn!(device_id = %prev_device, error = %e, "离线状态发布失败");
                            }
                        }
                        if !send(&write_tx, &ServerReply::auth_success()) {
                            break;
                        }
                        state = SessionState::Authenticated(device_id);
                    }
                    Err(_) => {
                        send(&write_tx, &ServerReply::auth_failure("Invalid token"));
                        break;
                    }
                }
            }
        }
    }

    // 会话收尾：注销映射并发布离线状态
    if let SessionState::Authenticated(device_id) = &state {
        if ctx.registry.remove(device_id, session_id) {
            if let Err(e) = ctx.cache.publish_device_status(device_id, false).await {
                tracing::warn!(device_id = %device_id, error = %e, "离线状态发布失败");
            }
            tracing::info!(%session_id, device_id = %device_id, "设备会话关闭");
        }
    }

    cancel.cancel();
    writer.abort();
}

/// 认证：令牌校验 + 限流 + 单会话注册 + 状态发布
async fn authenticate(
    ctx: &SessionContext,
    peer: &SocketAddr,
    token: &str,
    session_id: Uuid,
    cancel: &CancellationToken,
) -> Result<String, AppError> {
    let client_ip = peer.ip().to_string();

    if ctx.cache.auth_failure_count(&client_ip).await
        >= i64::from(ctx.settings.auth_attempts_per_minute)
    {
        return Err(AppError::RateLimited(client_ip));
    }

    let device_id = match ctx.token_service.validate(token).await {
        Ok(device_id) => device_id,
        Err(e) => {
            ctx.cache.record_auth_failure(&client_ip).await;
            return Err(e);
        }
    };

    // 注册新会话，同设备旧会话被关闭
    ctx.registry.register(&device_id, session_id, cancel.clone());

    ctx.cache.publish_device_status(&device_id, true).await?;

    if let Ok(Some(device)) = ctx.device_repo.find_by_device_id(&device_id).await {
        if let Err(e) = ctx.device_repo.update_last_seen(device.id).await {
            tracing::warn!(device_id = %device_id, error = %e, "更新最后在线时间失败");
        }
    }

    tracing::info!(%session_id, device_id = %device_id, "设备认证成功");
    Ok(device_id)
}

/// 心跳：刷新在线状态。设备已被禁用时返回 false 触发关闭
async fn heartbeat(ctx: &SessionContext, device_id: &str) -> bool {
    // 禁用检查走设备缓存，保证禁用后的会话在一个空闲周期内关闭
    match ctx.cache.get_cached_device(device_id).await {
        Ok(Some(device)) if !device.enabled => {
            tracing::info!(device_id, "设备已禁用，关闭会话");
            return false;
        }
        _ => {}
    }

    if let Err(e) = ctx.cache.publish_device_status(device_id, true).await {
        tracing::warn!(device_id, error = %e, "心跳状态刷新失败");
    }
    true
}

/// 数据消息：预过滤后拆条发布到 sensor-data 主题
async fn forward_data(ctx: &SessionContext, device_id: &str, data: &DataMessage) {
    let enriched = match ctx.prefilter.process(device_id, data) {
        FilterDecision::Forward(enriched) => enriched,
        FilterDecision::DropTrivial => {
            tracing::debug!(device_id, "平凡变化数据已过滤");
            return;
        }
        FilterDecision::DropInvalid => {
            tracing::debug!(device_id, "无效数据已过滤");
            return;
        }
    };

    for reading in &enriched.readings {
        let reading_data = match build_sensor_data(ctx, device_id, &enriched, reading.sensor_type, reading.value, &reading.unit) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(device_id, error = %e, "读数 ID 分配失败");
                continue;
            }
        };

        // 发布失败按卸载处理：计入日志，连接不中断
        if let Err(e) = ctx.producer.publish(device_id, reading_data).await {
            tracing::error!(device_id, error = %e, "读数发布失败，消息已卸载");
        }
    }
}

fn build_sensor_data(
    ctx: &SessionContext,
    device_id: &str,
    message: &DataMessage,
    sensor_type: SensorType,
    value: f64,
    unit: &str,
) -> Result<SensorData, AppError> {
    Ok(SensorData {
        id: ctx.allocator.next(TYPE_READING)?,
        device_id: device_id.to_string(),
        sensor_type,
        value,
        unit: unit.to_string(),
        timestamp: utils::from_millis(message.timestamp),
        location: None,
        metadata: None,
        preprocessed_at: message.preprocessed_at.map(utils::from_millis),
    })
}

/// 非阻塞发送。队列满视为慢消费者，返回 false 触发关闭
fn send(tx: &mpsc::Sender<String>, reply: &ServerReply) -> bool {
    let payload = match serde_json::to_string(reply) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "响应序列化失败");
            return false;
        }
    };

    match tx.try_send(payload) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!("发送队列溢出，按慢消费者关闭连接");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}
