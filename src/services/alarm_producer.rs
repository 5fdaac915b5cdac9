//! 告警事件生产者
//!
//! 把（规则 + 触发读数）富化为告警事件：分配告警 ID、复制规则的
//! 位置标签与元数据，发布到 alarm-events 主题（按设备分区）。

use crate::errors::AppError;
use crate::models::{AlarmEvent, AlarmRule, SensorData};
use crate::queue::TopicProducer;
use crate::utils::{IdAllocator, TYPE_ALARM};
use std::sync::Arc;

/// 告警事件生产者
pub struct AlarmProducerService {
    allocator: Arc<IdAllocator>,
    producer: Arc<TopicProducer<AlarmEvent>>,
}

impl AlarmProducerService {
    pub fn new(allocator: Arc<IdAllocator>, producer: Arc<TopicProducer<AlarmEvent>>) -> Self {
        Self {
            allocator,
            producer,
        }
    }

    /// 构建告警事件并发布
    pub async fn produce(
        &self,
        rule: &AlarmRule,
        reading: &SensorData,
    ) -> Result<AlarmEvent, AppError> {
        let alarm = self.build_alarm(rule, reading)?;
        self.producer.publish(&alarm.device_id, alarm.clone()).await?;

        tracing::info!(
            alarm_id = alarm.id,
            device_id = %alarm.device_id,
            alarm_type = %alarm.alarm_type,
            severity = alarm.severity.as_str(),
            value = alarm.value,
            "告警事件已发布"
        );
        Ok(alarm)
    }

    /// 富化：规则位置标签优先，读数位置兜底；元数据取规则侧
    fn build_alarm(&self, rule: &AlarmRule, reading: &SensorData) -> Result<AlarmEvent, AppError> {
        let mut location = rule.location();
        if location.is_empty() {
            if let Some(reading_location) = &reading.location {
                location = reading_location.clone();
            }
        }

        Ok(AlarmEvent {
            id: self.allocator.next(TYPE_ALARM)?,
            device_id: reading.device_id.clone(),
            alarm_type: rule.alarm_type.clone(),
            severity: rule.severity,
            value: reading.value,
            unit: reading.unit.clone(),
            timestamp: reading.timestamp,
            location,
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved: false,
            resolved_at: None,
            resolved_by: None,
            notes: Some(format!("触发规则: {}", rule.name)),
            metadata: rule.metadata.clone().or_else(|| reading.metadata.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::models::{AlarmSeverity, Location, RuleOperator, SensorType};
    use crate::queue::{PartitionedTopic, TOPIC_ALARM_EVENTS};
    use chrono::Utc;

    fn queue_settings() -> QueueSettings {
        QueueSettings {
            partitions: 3,
            capacity: 16,
            publish_retry_attempts: 1,
            publish_backoff_ms: 1,
            normal_concurrency: 1,
            backpressure_concurrency: 1,
            backpressure_batch_size: 10,
            backpressure_linger_ms: 5,
        }
    }

    fn smoke_rule() -> AlarmRule {
        AlarmRule {
            id: "r1".into(),
            name: "烟雾超标".into(),
            device_id: "d1".into(),
            sensor_type: SensorType::Smoke,
            operator: RuleOperator::Gt,
            threshold: 50.0,
            window_seconds: 60,
            severity: AlarmSeverity::High,
            alarm_type: "SMOKE".into(),
            building_id: Some("b1".into()),
            floor_id: Some("f3".into()),
            room_id: Some("server-rack-2".into()),
            zone_id: Some("z9".into()),
            enabled: true,
            metadata: None,
        }
    }

    fn smoke_reading(value: f64) -> SensorData {
        SensorData {
            id: 1,
            device_id: "d1".into(),
            sensor_type: SensorType::Smoke,
            value,
            unit: "ppm".into(),
            timestamp: Utc::now(),
            location: Some(Location::default()),
            metadata: None,
            preprocessed_at: None,
        }
    }

    #[tokio::test]
    async fn test_produce_enriches_and_publishes() {
        let settings = queue_settings();
        let topic = PartitionedTopic::new(TOPIC_ALARM_EVENTS, &settings);
        let consumers = topic.subscribe("g");
        let producer = Arc::new(TopicProducer::new(topic.clone(), &settings));
        let allocator = Arc::new(IdAllocator::new(Some(1)));
        let service = AlarmProducerService::new(allocator, producer);

        let alarm = service.produce(&smoke_rule(), &smoke_reading(80.0)).await.unwrap();

        assert_eq!(alarm.severity, AlarmSeverity::High);
        assert_eq!(alarm.alarm_type, "SMOKE");
        assert_eq!(alarm.location.room.as_deref(), Some("server-rack-2"));
        assert!(!alarm.acknowledged);
        assert!(!alarm.resolved);
        assert_eq!(crate::utils::IdAllocator::unpack(alarm.id).type_id, TYPE_ALARM);

        // 已发布到 alarm-events 主题
        let partition = crate::queue::partition_for("d1", topic.partition_count());
        let delivered = consumers[partition].poll().await;
        assert_eq!(delivered.value.id, alarm.id);
    }

    #[tokio::test]
    async fn test_alarm_ids_monotone_in_emission_order() {
        let settings = queue_settings();
        let topic = PartitionedTopic::new(TOPIC_ALARM_EVENTS, &settings);
        let _consumers = topic.subscribe("g");
        let producer = Arc::new(TopicProducer::new(topic, &settings));
        let allocator = Arc::new(IdAllocator::new(Some(1)));
        let service = AlarmProducerService::new(allocator, producer);

        let mut last = 0;
        for i in 0..20 {
            let alarm = service
                .produce(&smoke_rule(), &smoke_reading(60.0 + i as f64))
                .await
                .unwrap();
            assert!(alarm.id > last, "告警 ID 必须随发布顺序单调递增");
            last = alarm.id;
        }
    }
}
