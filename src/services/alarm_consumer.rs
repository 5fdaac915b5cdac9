//! 告警事件消费者
//!
//! 消费 alarm-events 主题：维护内存活跃告警索引、对高级别火警
//! 触发消防抑制、把告警交给分发器。ack / resolve 是活跃索引上的
//! 状态迁移，解除时记录操作者与时间并移出索引。

use crate::distribution::DistributionService;
use crate::models::{ActivationOutcome, AlarmEvent, AlarmSeverity, SuppressionType};
use crate::queue::PartitionConsumer;
use crate::services::SuppressionService;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// 抑制激活使用的最大强度（火警不打折扣）
const FIRE_SUPPRESSION_INTENSITY: u8 = 100;

/// 消费统计
#[derive(Debug, Clone, Serialize)]
pub struct AlarmConsumerStats {
    pub total_processed: u64,
    pub high_severity: u64,
    pub medium_severity: u64,
    pub low_severity: u64,
    pub suppression_activations: u64,
    pub errors: u64,
    pub active_alarms: usize,
}

/// 告警事件消费者
pub struct AlarmConsumerService {
    suppression: Arc<SuppressionService>,
    distribution: Arc<DistributionService>,
    /// 活跃告警：告警 ID -> 事件
    active: Mutex<HashMap<i64, AlarmEvent>>,
    total_processed: AtomicU64,
    high_severity: AtomicU64,
    medium_severity: AtomicU64,
    low_severity: AtomicU64,
    suppression_activations: AtomicU64,
    errors: AtomicU64,
}

impl AlarmConsumerService {
    pub fn new(
        suppression: Arc<SuppressionService>,
        distribution: Arc<DistributionService>,
    ) -> Self {
        Self {
            suppression,
            distribution,
            active: Mutex::new(HashMap::new()),
            total_processed: AtomicU64::new(0),
            high_severity: AtomicU64::new(0),
            medium_severity: AtomicU64::new(0),
            low_severity: AtomicU64::new(0),
            suppression_activations: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// 单分区消费循环
    pub async fn run_partition(
        self: Arc<Self>,
        consumer: PartitionConsumer<AlarmEvent>,
        shutdown: CancellationToken,
    ) {
        tracing::info!(partition = consumer.partition(), "告警消费循环启动");

        loop {
            let delivered = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivered = consumer.poll() => delivered,
            };

            self.handle_alarm(delivered.value).await;
            consumer.commit(delivered.offset);
        }

        tracing::info!(partition = consumer.partition(), "告警消费循环退出");
    }

    /// 处理一条告警事件
    pub async fn handle_alarm(&self, alarm: AlarmEvent) {
        tracing::info!(
            alarm_id = alarm.id,
            device_id = %alarm.device_id,
            alarm_type = %alarm.alarm_type,
            severity = alarm.severity.as_str(),
            "收到告警事件"
        );

        self.total_processed.fetch_add(1, Ordering::Relaxed);
        match alarm.severity {
            AlarmSeverity::High => self.high_severity.fetch_add(1, Ordering::Relaxed),
            AlarmSeverity::Medium => self.medium_severity.fetch_add(1, Ordering::Relaxed),
            AlarmSeverity::Low => self.low_severity.fetch_add(1, Ordering::Relaxed),
        };

        // 记入活跃索引
        self.active
            .lock()
            .expect("活跃告警索引锁中毒")
            .insert(alarm.id, alarm.clone());

        // 高级别火警触发消防抑制
        if alarm.severity == AlarmSeverity::High && alarm.alarm_type.eq_ignore_ascii_case("FIRE")
        {
            self.trigger_suppression(&alarm).await;
        }

        // 交给分发器（分发器内部保证部分失败容忍）
        self.distribution.distribute(&alarm).await;
    }

    /// 按房间标签选择介质并激活抑制
    async fn trigger_suppression(&self, alarm: &AlarmEvent) {
        let suppression_type = SuppressionType::for_room(alarm.location.room.as_deref());
        let zone_id = alarm
            .location
            .zone
            .clone()
            .or_else(|| alarm.location.room.clone())
            .unwrap_or_else(|| "unknown".to_string());

        match self
            .suppression
            .activate(
                &alarm.device_id,
                &zone_id,
                suppression_type,
                FIRE_SUPPRESSION_INTENSITY,
            )
            .await
        {
            Ok(ActivationOutcome::Activated) => {
                self.suppression_activations.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    device_id = %alarm.device_id,
                    suppression_type = suppression_type.as_str(),
                    "消防抑制已激活"
                );
            }
            Ok(ActivationOutcome::Updated) => {
                tracing::info!(device_id = %alarm.device_id, "消防抑制状态已刷新");
            }
            Ok(ActivationOutcome::Conflict) => {
                tracing::warn!(
                    device_id = %alarm.device_id,
                    requested = suppression_type.as_str(),
                    "已有不同类型的抑制在运行"
                );
            }
            Ok(ActivationOutcome::DeviceUnavailable) => {
                tracing::warn!(device_id = %alarm.device_id, "设备不可用，抑制未激活");
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(device_id = %alarm.device_id, error = %e, "消防抑制激活失败");
            }
        }
    }

    // ========== 活跃索引 ==========

    /// 确认告警
    pub fn acknowledge(&self, alarm_id: i64, acknowledged_by: &str) -> bool {
        let mut active = self.active.lock().expect("活跃告警索引锁中毒");
        match active.get_mut(&alarm_id) {
            Some(alarm) => {
                alarm.acknowledge(acknowledged_by, Utc::now());
                tracing::info!(alarm_id, acknowledged_by, "告警已确认");
                true
            }
            None => false,
        }
    }

    /// 解除告警：记录解除者与时间并移出活跃索引
    pub fn resolve(&self, alarm_id: i64, resolved_by: &str) -> Option<AlarmEvent> {
        let mut active = self.active.lock().expect("活跃告警索引锁中毒");
        active.remove(&alarm_id).map(|mut alarm| {
            alarm.resolve(resolved_by, Utc::now());
            tracing::info!(alarm_id, resolved_by, "告警已解除");
            alarm
        })
    }

    /// 某设备的活跃告警
    pub fn active_for_device(&self, device_id: &str) -> Vec<AlarmEvent> {
        self.active
            .lock()
            .expect("活跃告警索引锁中毒")
            .values()
            .filter(|alarm| alarm.device_id == device_id)
            .cloned()
            .collect()
    }

    /// 全部活跃告警
    pub fn all_active(&self) -> Vec<AlarmEvent> {
        self.active
            .lock()
            .expect("活跃告警索引锁中毒")
            .values()
            .cloned()
            .collect()
    }

    /// 消费统计
    pub fn stats(&self) -> AlarmConsumerStats {
        AlarmConsumerStats {
            total_processed: self.total_processed.load(Ordering::Relaxed),
            high_severity: self.high_severity.load(Ordering::Relaxed),
            medium_severity: self.medium_severity.load(Ordering::Relaxed),
            low_severity: self.low_severity.load(Ordering::Relaxed),
            suppression_activations: self.suppression_activations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            active_alarms: self.active.lock().expect("活跃告警索引锁中毒").len(),
        }
    }
}
