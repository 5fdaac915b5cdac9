//! 分区消息队列
//!
//! `sensor-data` 与 `alarm-events` 两个逻辑主题的进程内实现，
//! 对外只暴露窄的生产 / 消费契约：按 device_id 哈希分区保证
//! 每设备有序，手动提交偏移量获得至少一次语义。

mod consumer;
mod log;
mod producer;

pub use consumer::PartitionConsumer;
pub use log::Delivered;
pub use producer::TopicProducer;

use crate::config::QueueSettings;
use log::PartitionLog;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// 传感器数据主题
pub const TOPIC_SENSOR_DATA: &str = "sensor-data";
/// 告警事件主题
pub const TOPIC_ALARM_EVENTS: &str = "alarm-events";

/// 普通消费组（单条消息处理，高并发）
pub const GROUP_EVALUATOR: &str = "evaluator";
/// 背压消费组（批量处理，低并发）
pub const GROUP_BACKPRESSURE: &str = "backpressure";
/// 告警消费组
pub const GROUP_ALARM: &str = "alarm-consumer";

/// 按键哈希选择分区：同一 device_id 恒定落在同一分区
pub fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % partitions
}

/// 分区主题
pub struct PartitionedTopic<T> {
    name: String,
    partitions: Vec<Arc<PartitionLog<T>>>,
}

impl<T: Clone + Send + Sync + 'static> PartitionedTopic<T> {
    /// 创建主题。分区数越界时收敛到 3-10 的有效区间
    pub fn new(name: &str, settings: &QueueSettings) -> Arc<Self> {
        let partitions = settings.partitions.clamp(3, 10);
        if partitions != settings.partitions {
            tracing::warn!(
                topic = name,
                configured = settings.partitions,
                effective = partitions,
                "分区数超出有效区间，已收敛"
            );
        }

        let logs = (0..partitions)
            .map(|p| Arc::new(PartitionLog::new(p, settings.capacity)))
            .collect();

        tracing::info!(topic = name, partitions, "分区主题已创建");

        Arc::new(Self {
            name: name.to_string(),
            partitions: logs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// 注册消费组，返回每分区一个消费者
    pub fn subscribe(&self, group: &str) -> Vec<PartitionConsumer<T>> {
        self.partitions
            .iter()
            .enumerate()
            .map(|(partition, log)| {
                log.register_group(group);
                PartitionConsumer::new(group, partition, log.clone())
            })
            .collect()
    }

    pub(crate) fn log_for_key(&self, key: &str) -> &Arc<PartitionLog<T>> {
        &self.partitions[partition_for(key, self.partitions.len())]
    }
}
