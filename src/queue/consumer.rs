//! 分区消费者

use crate::queue::log::{Delivered, PartitionLog};
use std::sync::Arc;
use std::time::Duration;

/// 单分区消费者
///
/// 每个消费组在每个分区上持有一个消费者，消费循环一个任务一个分区。
/// poll 不推进游标，commit 才推进；提交前失败的消息会被重投。
pub struct PartitionConsumer<T> {
    group: String,
    partition: usize,
    log: Arc<PartitionLog<T>>,
}

impl<T: Clone + Send + Sync + 'static> PartitionConsumer<T> {
    pub(crate) fn new(group: &str, partition: usize, log: Arc<PartitionLog<T>>) -> Self {
        Self {
            group: group.to_string(),
            partition,
            log,
        }
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// 等待并取出游标处的消息
    pub async fn poll(&self) -> Delivered<T> {
        self.log.poll(&self.group).await
    }

    /// 非阻塞取消息
    pub fn try_poll(&self) -> Option<Delivered<T>> {
        self.log.try_poll(&self.group)
    }

    /// 批量取消息：先等首条，再在 linger 窗口内攒批到 max 条
    pub async fn poll_batch(&self, max: usize, linger: Duration) -> Vec<Delivered<T>> {
        let first = self.log.poll(&self.group).await;
        if max <= 1 {
            return vec![first];
        }

        tokio::time::sleep(linger).await;
        let batch = self.log.try_poll_batch(&self.group, max);
        // linger 期间日志未被裁剪（本组游标未提交），首条必然仍在批首
        if batch.is_empty() {
            vec![first]
        } else {
            batch
        }
    }

    /// 提交偏移量（本分区内小于等于 offset 的消息均视为处理完成）
    pub fn commit(&self, offset: u64) {
        self.log.commit(&self.group, offset);
    }

    /// 未消费消息数
    pub fn lag(&self) -> u64 {
        self.log.lag(&self.group)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::QueueSettings;
    use crate::queue::{PartitionedTopic, TopicProducer};
    use std::time::Duration;

    fn test_settings() -> QueueSettings {
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

    #[tokio::test]
    async fn test_batch_consumption() {
        let settings = test_settings();
        let topic = PartitionedTopic::new("sensor-data", &settings);
        let consumers = topic.subscribe("backpressure");
        let producer = TopicProducer::new(topic.clone(), &settings);

        for i in 0..8 {
            producer.publish("d1", i).await.unwrap();
        }

        let partition = crate::queue::partition_for("d1", topic.partition_count());
        let consumer = &consumers[partition];

        let batch = consumer.poll_batch(5, Duration::from_millis(5)).await;
        assert!(!batch.is_empty());
        assert!(batch.len() <= 5);
        consumer.commit(batch.last().unwrap().offset);

        let rest = consumer.poll_batch(10, Duration::from_millis(5)).await;
        assert_eq!(batch.len() + rest.len(), 8);
    }

    #[tokio::test]
    async fn test_uncommitted_message_redelivered() {
        let settings = test_settings();
        let topic = PartitionedTopic::new("sensor-data", &settings);
        let consumers = topic.subscribe("g");
        let producer = TopicProducer::new(topic.clone(), &settings);

        producer.publish("d2", 99).await.unwrap();
        let partition = crate::queue::partition_for("d2", topic.partition_count());
        let consumer = &consumers[partition];

        // 模拟处理失败：poll 后不提交
        let first = consumer.poll().await;
        assert_eq!(first.value, 99);

        // 重投同一条消息
        let redelivered = consumer.poll().await;
        assert_eq!(redelivered.offset, first.offset);
        consumer.commit(redelivered.offset);
        assert_eq!(consumer.lag(), 0);
    }
}
