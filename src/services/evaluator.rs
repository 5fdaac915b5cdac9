//! 流式规则评估器
//!
//! 消费 sensor-data 主题，对每条读数匹配该 (设备, 传感器) 下的
//! 全部已启用规则。多条规则同时命中时全部触发，指纹级去重在
//! 下游完成。带窗口的规则按「窗口内首次命中」策略限流。
//!
//! 单条消息的处理失败（含 panic）不会终止消费循环。

use crate::errors::AppError;
use crate::models::SensorData;
use crate::queue::PartitionConsumer;
use crate::services::alarm_producer::AlarmProducerService;
use crate::services::dedup_service::AlarmDeduplicator;
use crate::services::rule_service::{CompiledRule, RuleSnapshot};
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

/// 消费异常后的退避时长，避免对持续失败的消息热循环
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// 评估统计
#[derive(Debug, Clone, Serialize)]
pub struct EvaluatorStats {
    pub processed: u64,
    pub matched: u64,
    pub suppressed_by_window: u64,
    pub suppressed_by_dedup: u64,
    pub errors: u64,
}

/// 流式规则评估器
pub struct EvaluatorService {
    snapshot_rx: watch::Receiver<Arc<RuleSnapshot>>,
    dedup: Arc<dyn AlarmDeduplicator>,
    alarm_producer: Arc<AlarmProducerService>,
    /// 消费组并发上限（跨分区共享）
    permits: Semaphore,
    /// 指纹 -> 窗口内最近一次触发的毫秒时间戳（事件时间）
    window_state: Mutex<HashMap<String, i64>>,
    processed: AtomicU64,
    matched: AtomicU64,
    suppressed_by_window: AtomicU64,
    suppressed_by_dedup: AtomicU64,
    errors: AtomicU64,
}

impl EvaluatorService {
    pub fn new(
        snapshot_rx: watch::Receiver<Arc<RuleSnapshot>>,
        dedup: Arc<dyn AlarmDeduplicator>,
        alarm_producer: Arc<AlarmProducerService>,
        concurrency: usize,
    ) -> Self {
        Self {
            snapshot_rx,
            dedup,
            alarm_producer,
            permits: Semaphore::new(concurrency.max(1)),
            window_state: Mutex::new(HashMap::new()),
            processed: AtomicU64::new(0),
            matched: AtomicU64::new(0),
            suppressed_by_window: AtomicU64::new(0),
            suppressed_by_dedup: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// 单分区消费循环，直到 shutdown 触发
    ///
    /// 偏移量在整条流水线（评估 → 去重 → 告警发布）成功后提交；
    /// 重试无意义的错误分类（协议 / 规则编译）也提交，其余错误
    /// 不提交以获得重投。
    pub async fn run_partition(
        self: Arc<Self>,
        consumer: PartitionConsumer<SensorData>,
        shutdown: CancellationToken,
    ) {
        tracing::info!(partition = consumer.partition(), "评估器消费循环启动");

        loop {
            let delivered = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivered = consumer.poll() => delivered,
            };

            let Ok(_permit) = self.permits.acquire().await else {
                break;
            };

            // 捕获 panic：损坏消息只影响自身，循环继续
            let outcome = std::panic::AssertUnwindSafe(self.handle_reading(&delivered.value))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => consumer.commit(delivered.offset),
                Ok(Err(e)) if e.commit_despite_error() => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        partition = delivered.partition,
                        offset = delivered.offset,
                        error = %e,
                        "消息处理失败（不可重试），提交偏移量"
                    );
                    consumer.commit(delivered.offset);
                }
                Ok(Err(e)) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        partition = delivered.partition,
                        offset = delivered.offset,
                        error = %e,
                        "消息处理失败，等待重投"
                    );
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
                Err(panic) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        partition = delivered.partition,
                        offset = delivered.offset,
                        reading_id = delivered.value.id,
                        panic = ?panic_message(&panic),
                        "消息处理 panic，跳过该消息"
                    );
                    consumer.commit(delivered.offset);
                }
            }
        }

        tracing::info!(partition = consumer.partition(), "评估器消费循环退出");
    }

    /// 评估一条读数
    pub async fn handle_reading(&self, reading: &SensorData) -> Result<(), AppError> {
        self.processed.fetch_add(1, Ordering::Relaxed);

        // watch 通道里的快照总是最新发布的版本：
        // 规则变更在下一条消息的评估周期内生效
        let snapshot = self.snapshot_rx.borrow().clone();
        let candidates = self.matching_rules(&snapshot, reading);

        for compiled in candidates {
            self.matched.fetch_add(1, Ordering::Relaxed);
            let fingerprint = compiled.rule.fingerprint();

            if !self.window_permits(&compiled, reading, &fingerprint) {
                self.suppressed_by_window.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%fingerprint, "窗口内已触发，跳过");
                continue;
            }

            // 去重是优化而非正确性保障，存储故障时 fail-open
            if !self.dedup.is_new(&fingerprint).await {
                self.suppressed_by_dedup.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%fingerprint, "去重窗口内的重复告警，跳过");
                continue;
            }

            self.alarm_producer.produce(&compiled.rule, reading).await?;
        }

        Ok(())
    }

    /// 匹配并按运算符评估，返回命中的规则
    fn matching_rules(
        &self,
        snapshot: &RuleSnapshot,
        reading: &SensorData,
    ) -> Vec<Arc<CompiledRule>> {
        snapshot
            .matching(&reading.device_id, reading.sensor_type)
            .iter()
            .filter(|compiled| {
                compiled.rule.operator.apply(
                    reading.value,
                    compiled.rule.threshold,
                    compiled.epsilon,
                )
            })
            .cloned()
            .collect()
    }

    /// 窗口策略：window_seconds > 0 时每个指纹窗口内最多触发一次
    ///
    /// 以事件时间（读数时间戳）计窗。允许触发时记录本次触发。
    fn window_permits(&self, compiled: &CompiledRule, reading: &SensorData, fingerprint: &str) -> bool {
        if compiled.rule.window_seconds == 0 {
            return true;
        }

        let event_ms = reading.timestamp.timestamp_millis();
        let window_ms = i64::from(compiled.rule.window_seconds) * 1000;
        let mut state = self.window_state.lock().expect("窗口状态锁中毒");

        match state.get(fingerprint) {
            Some(&last_emit) if event_ms - last_emit < window_ms => false,
            _ => {
                state.insert(fingerprint.to_string(), event_ms);
                true
            }
        }
    }

    /// 评估统计
    pub fn stats(&self) -> EvaluatorStats {
        EvaluatorStats {
            processed: self.processed.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            suppressed_by_window: self.suppressed_by_window.load(Ordering::Relaxed),
            suppressed_by_dedup: self.suppressed_by_dedup.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::models::{AlarmEvent, AlarmRule, AlarmSeverity, RuleOperator, SensorType};
    use crate::queue::{PartitionConsumer, PartitionedTopic, TopicProducer, TOPIC_ALARM_EVENTS};
    use crate::utils::IdAllocator;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;

    /// 恒判定为新告警的去重器
    struct PassDedup;

    #[async_trait]
    impl AlarmDeduplicator for PassDedup {
        async fn is_new(&self, _: &str) -> bool {
            true
        }
    }

    /// 记录已见指纹的去重器
    struct RecordingDedup {
        seen: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl AlarmDeduplicator for RecordingDedup {
        async fn is_new(&self, fingerprint: &str) -> bool {
            self.seen
                .lock()
                .expect("测试去重器锁中毒")
                .insert(fingerprint.to_string())
        }
    }

    fn queue_settings() -> QueueSettings {
        QueueSettings {
            partitions: 3,
            capacity: 64,
            publish_retry_attempts: 1,
            publish_backoff_ms: 1,
            normal_concurrency: 4,
            backpressure_concurrency: 1,
            backpressure_batch_size: 10,
            backpressure_linger_ms: 5,
        }
    }

    fn smoke_rule(id: &str, threshold: f64, window_seconds: u32) -> AlarmRule {
        AlarmRule {
            id: id.to_string(),
            name: format!("烟雾规则 {}", id),
            device_id: "d1".to_string(),
            sensor_type: SensorType::Smoke,
            operator: RuleOperator::Gt,
            threshold,
            window_seconds,
            severity: AlarmSeverity::High,
            alarm_type: "SMOKE".to_string(),
            building_id: None,
            floor_id: None,
            room_id: None,
            zone_id: None,
            enabled: true,
            metadata: None,
        }
    }

    fn reading(value: f64, ts_ms: i64) -> SensorData {
        SensorData {
            id: ts_ms,
            device_id: "d1".to_string(),
            sensor_type: SensorType::Smoke,
            value,
            unit: "ppm".to_string(),
            timestamp: Utc.timestamp_millis_opt(ts_ms).unwrap(),
            location: None,
            metadata: None,
            preprocessed_at: None,
        }
    }

    struct Harness {
        evaluator: EvaluatorService,
        snapshot_tx: watch::Sender<Arc<RuleSnapshot>>,
        consumers: Vec<PartitionConsumer<AlarmEvent>>,
    }

    fn harness(rules: Vec<AlarmRule>, dedup: Arc<dyn AlarmDeduplicator>) -> Harness {
        let settings = queue_settings();
        let topic = PartitionedTopic::new(TOPIC_ALARM_EVENTS, &settings);
        let consumers = topic.subscribe("test");
        let producer = Arc::new(TopicProducer::new(topic, &settings));
        let alarm_producer = Arc::new(AlarmProducerService::new(
            Arc::new(IdAllocator::new(Some(1))),
            producer,
        ));

        let (snapshot, failures) = RuleSnapshot::compile(rules.iter(), 1);
        assert!(failures.is_empty(), "测试规则不应编译失败");
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(snapshot));

        Harness {
            evaluator: EvaluatorService::new(snapshot_rx, dedup, alarm_producer, 4),
            snapshot_tx,
            consumers,
        }
    }

    fn drain(consumers: &[PartitionConsumer<AlarmEvent>]) -> Vec<AlarmEvent> {
        let mut alarms = Vec::new();
        for consumer in consumers {
            while let Some(delivered) = consumer.try_poll() {
                consumer.commit(delivered.offset);
                alarms.push(delivered.value);
            }
        }
        alarms
    }

    #[tokio::test]
    async fn test_matching_rule_emits_alarm() {
        let h = harness(vec![smoke_rule("r1", 50.0, 0)], Arc::new(PassDedup));

        h.evaluator.handle_reading(&reading(80.0, 0)).await.unwrap();
        h.evaluator.handle_reading(&reading(40.0, 1000)).await.unwrap();

        let alarms = drain(&h.consumers);
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].severity, AlarmSeverity::High);
        assert_eq!(alarms[0].alarm_type, "SMOKE");
        assert_eq!(alarms[0].value, 80.0);
    }

    #[tokio::test]
    async fn test_window_emits_once_per_fingerprint() {
        let h = harness(vec![smoke_rule("r1", 50.0, 60)], Arc::new(PassDedup));

        // t=0 触发，t=30s 在窗口内被抑制，t=61s 窗口已过再次触发
        h.evaluator.handle_reading(&reading(80.0, 0)).await.unwrap();
        h.evaluator.handle_reading(&reading(90.0, 30_000)).await.unwrap();
        h.evaluator.handle_reading(&reading(85.0, 61_000)).await.unwrap();

        let alarms = drain(&h.consumers);
        assert_eq!(alarms.len(), 2);
        assert_eq!(h.evaluator.stats().suppressed_by_window, 1);
    }

    #[tokio::test]
    async fn test_all_matching_rules_fire() {
        let h = harness(
            vec![smoke_rule("r1", 50.0, 0), smoke_rule("r2", 70.0, 0)],
            Arc::new(PassDedup),
        );

        h.evaluator.handle_reading(&reading(80.0, 0)).await.unwrap();

        // 两条规则同时命中，全部触发；指纹去重在下游
        let alarms = drain(&h.consumers);
        assert_eq!(alarms.len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_rule_ignored() {
        let mut rule = smoke_rule("r1", 50.0, 0);
        rule.enabled = false;
        let h = harness(vec![rule], Arc::new(PassDedup));

        h.evaluator.handle_reading(&reading(80.0, 0)).await.unwrap();
        assert!(drain(&h.consumers).is_empty());
    }

    #[tokio::test]
    async fn test_threshold_update_visible_next_reading() {
        let h = harness(vec![smoke_rule("r1", 50.0, 60)], Arc::new(PassDedup));

        // 阈值升到 100 后交换快照，低于新阈值的读数不再触发
        let updated = smoke_rule("r1", 100.0, 60);
        let (snapshot, _) = RuleSnapshot::compile([&updated], 2);
        h.snapshot_tx.send(Arc::new(snapshot)).unwrap();

        h.evaluator.handle_reading(&reading(80.0, 300)).await.unwrap();
        assert!(drain(&h.consumers).is_empty());
    }

    #[tokio::test]
    async fn test_dedup_suppresses_repeat_fingerprint() {
        let dedup = Arc::new(RecordingDedup {
            seen: Mutex::new(HashSet::new()),
        });
        let h = harness(vec![smoke_rule("r1", 50.0, 0)], dedup);

        h.evaluator.handle_reading(&reading(80.0, 0)).await.unwrap();
        h.evaluator.handle_reading(&reading(90.0, 1000)).await.unwrap();

        // 同一指纹窗口内至多一条告警流向下游
        let alarms = drain(&h.consumers);
        assert_eq!(alarms.len(), 1);
        assert_eq!(h.evaluator.stats().suppressed_by_dedup, 1);
    }

    #[tokio::test]
    async fn test_unmatched_sensor_type_ignored() {
        let h = harness(vec![smoke_rule("r1", 50.0, 0)], Arc::new(PassDedup));

        let mut temp_reading = reading(80.0, 0);
        temp_reading.sensor_type = SensorType::Temperature;

        h.evaluator.handle_reading(&temp_reading).await.unwrap();
        assert!(drain(&h.consumers).is_empty());
    }
}
