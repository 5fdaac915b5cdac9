//! 设备 TCP 接入服务器
//!
//! 监听设备连接，每个连接派生一个会话任务。停机时先停止接受
//! 新连接，再等待在途会话在宽限时间内退出。

use crate::errors::AppError;
use crate::transport::session::{handle_connection, SessionContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// 运行设备接入服务器，直到 shutdown 被触发
pub async fn run(
    addr: &str,
    ctx: Arc<SessionContext>,
    shutdown: CancellationToken,
    grace: Duration,
) -> Result<(), AppError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::ConfigError(format!("设备接入端口绑定失败 {}: {}", addr, e)))?;

    tracing::info!(addr, "设备接入服务器已启动");

    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(error = %e, "TCP_NODELAY 设置失败");
                        }
                        let ctx = ctx.clone();
                        let shutdown = shutdown.clone();
                        sessions.spawn(async move {
                            handle_connection(stream, peer, ctx, shutdown).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "接受连接失败");
                    }
                }
            }
            // 回收已结束的会话任务，避免 JoinSet 无界增长
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    // 两阶段停机：已停止接受新连接，等待在途会话退出
    tracing::info!(active = sessions.len(), "停止接受新连接，等待会话退出");
    let drained = tokio::time::timeout(grace, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        tracing::warn!(remaining = sessions.len(), "宽限期结束，强制终止剩余会话");
        sessions.abort_all();
    }

    tracing::info!("设备接入服务器已停止");
    Ok(())
}
