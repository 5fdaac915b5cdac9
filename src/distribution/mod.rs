//! 告警分发模块
//!
//! 把每条告警并发投递到历史、WebSocket、发布订阅与数据同步
//! 四个通道。每个通道都包着重试 + 熔断 + 超时 + 隔板装饰器，
//! 单通道故障不阻塞其他通道；全部通道失败时事件仍保留在
//! 历史降级缓冲中并计数。

mod resilience;
mod sink;

pub use resilience::{
    BulkheadSink, CircuitBreakerSink, CircuitState, RetrySink, TimeoutSink,
};
pub use sink::{AlarmSink, HistorySink, PubSubSink, SyncSink, WebSocketSink};

use crate::config::DistributorSettings;
use crate::db::RedisPool;
use crate::models::AlarmEvent;
use crate::services::{FallbackRing, HistoryService, SyncService};
use crate::websocket::WsHub;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 分发统计
#[derive(Debug, Clone, Serialize)]
pub struct DistributionStats {
    pub distributed: u64,
    pub total_failures: u64,
    pub sink_failures: HashMap<String, u64>,
}

/// 告警分发服务
pub struct DistributionService {
    sinks: Vec<Arc<dyn AlarmSink>>,
    /// 全部通道失败时的兜底保留
    fallback: Arc<FallbackRing>,
    distributed: AtomicU64,
    total_failures: AtomicU64,
    sink_failures: Mutex<HashMap<String, u64>>,
}

impl DistributionService {
    /// 构建四个通道并套上韧性装饰器
    pub fn new(
        settings: &DistributorSettings,
        history: Arc<HistoryService>,
        hub: Arc<WsHub>,
        redis_pool: Arc<RedisPool>,
        sync_service: Arc<SyncService>,
    ) -> Self {
        let fallback = history.fallback_ring();
        let sinks: Vec<Arc<dyn AlarmSink>> = vec![
            wrap(Arc::new(HistorySink::new(history)), settings),
            wrap(Arc::new(WebSocketSink::new(hub)), settings),
            wrap(Arc::new(PubSubSink::new(redis_pool)), settings),
            wrap(Arc::new(SyncSink::new(sync_service)), settings),
        ];

        Self::with_sinks(sinks, fallback)
    }

    /// 测试 / 定制用：直接注入已包装的通道集合
    pub fn with_sinks(sinks: Vec<Arc<dyn AlarmSink>>, fallback: Arc<FallbackRing>) -> Self {
        Self {
            sinks,
            fallback,
            distributed: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            sink_failures: Mutex::new(HashMap::new()),
        }
    }

    /// 分发一条告警到全部通道
    ///
    /// 通道并发执行且互不阻塞。历史通道的 `StoreUnavailable`
    /// 不影响其他实时通道；全部通道失败时兜底写入降级缓冲
    /// （历史通道的降级路径可能已写入，按 ID 去重）。
    pub async fn distribute(&self, alarm: &AlarmEvent) {
        let deliveries = self.sinks.iter().map(|sink| {
            let sink = sink.clone();
            async move {
                let result = sink.deliver(alarm).await;
                (sink.name().to_string(), result)
            }
        });

        let results = futures::future::join_all(deliveries).await;

        let mut failed = 0;
        for (name, result) in &results {
            if let Err(e) = result {
                failed += 1;
                *self
                    .sink_failures
                    .lock()
                    .expect("分发统计锁中毒")
                    .entry(name.clone())
                    .or_insert(0) += 1;
                tracing::warn!(alarm_id = alarm.id, sink = %name, error = %e, "通道投递失败");
            }
        }

        if failed == results.len() {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
            self.fallback.push_unique(alarm.clone());
            tracing::error!(alarm_id = alarm.id, "全部通道投递失败，事件已兜底保留");
        } else {
            self.distributed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                alarm_id = alarm.id,
                failed,
                total = results.len(),
                "告警分发完成"
            );
        }
    }

    /// 分发统计
    pub fn stats(&self) -> DistributionStats {
        DistributionStats {
            distributed: self.distributed.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            sink_failures: self
                .sink_failures
                .lock()
                .expect("分发统计锁中毒")
                .clone(),
        }
    }
}

/// 组合装饰器（外到内）：重试 → 熔断 → 超时 → 隔板
///
/// 重试在最外层，每次尝试都经过熔断判定并受单次时限约束。
fn wrap(sink: Arc<dyn AlarmSink>, settings: &DistributorSettings) -> Arc<dyn AlarmSink> {
    let bulkhead = Arc::new(BulkheadSink::new(sink, settings.bulkhead_concurrency));
    let timeout = Arc::new(TimeoutSink::new(
        bulkhead,
        Duration::from_millis(settings.timeout_ms),
    ));
    let circuit = Arc::new(CircuitBreakerSink::new(
        timeout,
        settings.circuit_failure_rate,
        settings.circuit_window,
        Duration::from_millis(settings.circuit_cooldown_ms),
    ));
    Arc::new(RetrySink::new(
        circuit,
        settings.retry_max_attempts,
        settings.retry_backoff_ms,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use crate::models::{AlarmSeverity, Location};
    use async_trait::async_trait;
    use chrono::Utc;

    fn alarm(id: i64) -> AlarmEvent {
        AlarmEvent {
            id,
            device_id: "d1".into(),
            alarm_type: "FIRE".into(),
            severity: AlarmSeverity::High,
            value: 99.0,
            unit: "ppm".into(),
            timestamp: Utc::now(),
            location: Location::default(),
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

    struct OkSink;

    #[async_trait]
    impl AlarmSink for OkSink {
        fn name(&self) -> &str {
            "ok"
        }
        async fn deliver(&self, _: &AlarmEvent) -> Result<(), AppError> {
            Ok(())
        }
    }

    struct FailSink;

    #[async_trait]
    impl AlarmSink for FailSink {
        fn name(&self) -> &str {
            "fail"
        }
        async fn deliver(&self, _: &AlarmEvent) -> Result<(), AppError> {
            Err(AppError::StoreUnavailable("下游不可用".into()))
        }
    }

    #[tokio::test]
    async fn test_one_sink_failure_does_not_block_others() {
        let fallback = Arc::new(FallbackRing::new(100));
        let service = DistributionService::with_sinks(
            vec![Arc::new(OkSink), Arc::new(FailSink)],
            fallback.clone(),
        );

        service.distribute(&alarm(1)).await;

        let stats = service.stats();
        assert_eq!(stats.distributed, 1);
        assert_eq!(stats.total_failures, 0);
        assert_eq!(stats.sink_failures.get("fail"), Some(&1));
        // 部分成功不触发兜底
        assert!(fallback.is_empty());
    }

    #[tokio::test]
    async fn test_all_sinks_failed_retains_event() {
        let fallback = Arc::new(FallbackRing::new(100));
        let service = DistributionService::with_sinks(
            vec![Arc::new(FailSink), Arc::new(FailSink)],
            fallback.clone(),
        );

        service.distribute(&alarm(7)).await;

        let stats = service.stats();
        assert_eq!(stats.total_failures, 1);
        // 事件保留在降级缓冲中
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback.snapshot()[0].id, 7);
    }

    #[tokio::test]
    async fn test_fallback_deduplicates_by_id() {
        let fallback = Arc::new(FallbackRing::new(100));
        let service =
            DistributionService::with_sinks(vec![Arc::new(FailSink)], fallback.clone());

        // 历史通道的降级路径可能已写入同一事件
        fallback.push(alarm(7));
        service.distribute(&alarm(7)).await;

        assert_eq!(fallback.len(), 1);
    }
}
