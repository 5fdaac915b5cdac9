//! 主题生产者

use crate::config::QueueSettings;
use crate::errors::AppError;
use crate::queue::PartitionedTopic;
use std::sync::Arc;
use std::time::Duration;

/// 确认式生产者
///
/// 发布在分区日志接纳消息后才算确认；单次尝试超时则退避重试，
/// 预算耗尽返回 `PublishError`，调用方决定如何处理（丢弃 / 卸载）。
pub struct TopicProducer<T> {
    topic: Arc<PartitionedTopic<T>>,
    retry_attempts: u32,
    backoff_ms: u64,
    /// 单次发布尝试的确认等待上限
    ack_timeout: Duration,
}

impl<T: Clone + Send + Sync + 'static> TopicProducer<T> {
    pub fn new(topic: Arc<PartitionedTopic<T>>, settings: &QueueSettings) -> Self {
        Self {
            topic,
            retry_attempts: settings.publish_retry_attempts,
            backoff_ms: settings.publish_backoff_ms,
            ack_timeout: Duration::from_millis(1000),
        }
    }

    /// 发布一条消息，按 key 选择分区
    pub async fn publish(&self, key: &str, value: T) -> Result<(), AppError> {
        let log = self.topic.log_for_key(key);

        for attempt in 0..=self.retry_attempts {
            match tokio::time::timeout(self.ack_timeout, log.publish(value.clone())).await {
                Ok(()) => return Ok(()),
                Err(_) => {
                    if attempt < self.retry_attempts {
                        // 指数退避后重试
                        let backoff = self.backoff_ms.saturating_mul(1 << attempt.min(6));
                        tracing::warn!(
                            topic = self.topic.name(),
                            key,
                            attempt = attempt + 1,
                            backoff_ms = backoff,
                            "发布未确认，退避后重试"
                        );
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }

        Err(AppError::PublishError(format!(
            "主题 {} 发布失败：重试 {} 次后仍未确认",
            self.topic.name(),
            self.retry_attempts
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;

    fn test_settings() -> QueueSettings {
        QueueSettings {
            partitions: 4,
            capacity: 8,
            publish_retry_attempts: 2,
            publish_backoff_ms: 1,
            normal_concurrency: 4,
            backpressure_concurrency: 1,
            backpressure_batch_size: 10,
            backpressure_linger_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_publish_then_consume_in_order() {
        let settings = test_settings();
        let topic = PartitionedTopic::new("sensor-data", &settings);
        let consumers = topic.subscribe("g");
        let producer = TopicProducer::new(topic.clone(), &settings);

        for i in 0..10 {
            producer.publish("device-1", i).await.unwrap();
        }

        // 同一 key 的消息全部落在同一分区且保持发布顺序
        let partition = crate::queue::partition_for("device-1", topic.partition_count());
        let consumer = &consumers[partition];

        for expected in 0..10 {
            let delivered = consumer.poll().await;
            assert_eq!(delivered.value, expected);
            consumer.commit(delivered.offset);
        }
    }
}
