//! WebSocket 路由处理器

use crate::services::SyncService;
use crate::websocket::hub::WsHub;
use crate::websocket::session::WsSession;

use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::sync::Arc;
use tracing::info;

/// 获取客户端 IP
fn get_client_ip(req: &HttpRequest) -> Option<String> {
    if let Some(forwarded) = req.headers().get("X-Forwarded-For") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            return forwarded_str.split(',').next().map(|s| s.trim().to_string());
        }
    }

    req.peer_addr().map(|addr| addr.ip().to_string())
}

/// WebSocket 连接升级处理器
///
/// 端点: GET /ws/alarms
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    hub: web::Data<Arc<WsHub>>,
    sync_service: web::Data<Arc<SyncService>>,
) -> Result<HttpResponse, Error> {
    let client_ip = get_client_ip(&req);

    info!("仪表盘 WebSocket 连接请求: ip={:?}", client_ip);

    let session = WsSession::new(
        client_ip,
        hub.get_ref().clone(),
        sync_service.get_ref().clone(),
    );

    ws::start(session, &req, stream)
}

/// 配置 WebSocket 路由
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws/alarms", web::get().to(ws_handler));
}
