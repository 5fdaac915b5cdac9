//! 分区日志
//!
//! 单个分区内的有序消息日志。每个消费组持有独立的已提交游标，
//! poll 返回游标处的消息但不推进游标，只有 commit 才推进；
//! 处理失败不提交即可获得至少一次的重投语义。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::Notify;

/// 投递给消费者的消息
#[derive(Debug, Clone)]
pub struct Delivered<T> {
    pub partition: usize,
    pub offset: u64,
    pub value: T,
}

pub(crate) struct PartitionLog<T> {
    partition: usize,
    capacity: usize,
    inner: Mutex<LogInner<T>>,
    data_available: Notify,
    space_available: Notify,
}

struct LogInner<T> {
    /// entries[0] 对应的偏移量
    base_offset: u64,
    entries: VecDeque<T>,
    /// 消费组 -> 下一个待读偏移量
    cursors: HashMap<String, u64>,
}

impl<T: Clone> PartitionLog<T> {
    pub fn new(partition: usize, capacity: usize) -> Self {
        Self {
            partition,
            capacity,
            inner: Mutex::new(LogInner {
                base_offset: 0,
                entries: VecDeque::new(),
                cursors: HashMap::new(),
            }),
            data_available: Notify::new(),
            space_available: Notify::new(),
        }
    }

    /// 注册消费组，游标从当前尾部开始
    pub fn register_group(&self, group: &str) {
        let mut inner = self.inner.lock().expect("分区日志锁中毒");
        let tail = inner.base_offset + inner.entries.len() as u64;
        inner.cursors.entry(group.to_string()).or_insert(tail);
    }

    /// 追加一条消息；日志写满时等待消费组腾出空间。
    /// 没有任何消费组时按环形缓冲处理（丢弃最旧的消息）。
    pub async fn publish(&self, value: T) {
        let mut value = Some(value);
        loop {
            if self.try_publish(&mut value) {
                return;
            }

            // 先注册等待再复查，避免错过裁剪通知
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_publish(&mut value) {
                return;
            }
            notified.await;
        }
    }

    fn try_publish(&self, value: &mut Option<T>) -> bool {
        let mut inner = self.inner.lock().expect("分区日志锁中毒");

        if inner.entries.len() >= self.capacity {
            if !inner.cursors.is_empty() {
                return false;
            }
            // 无消费组：按环形缓冲丢弃最旧的消息
            inner.entries.pop_front();
            inner.base_offset += 1;
        }

        inner
            .entries
            .push_back(value.take().expect("消息已被消费"));
        drop(inner);
        self.data_available.notify_waiters();
        true
    }

    /// 取游标处的消息（不推进游标），无消息时等待
    pub async fn poll(&self, group: &str) -> Delivered<T> {
        loop {
            if let Some(delivered) = self.try_poll(group) {
                return delivered;
            }

            // 先注册等待再复查，避免错过发布通知
            let notified = self.data_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivered) = self.try_poll(group) {
                return delivered;
            }
            notified.await;
        }
    }

    /// 取游标处的消息（不推进游标），无消息时返回 None
    pub fn try_poll(&self, group: &str) -> Option<Delivered<T>> {
        let inner = self.inner.lock().expect("分区日志锁中毒");
        let cursor = *inner.cursors.get(group)?;
        let tail = inner.base_offset + inner.entries.len() as u64;

        if cursor < tail {
            let index = (cursor - inner.base_offset) as usize;
            Some(Delivered {
                partition: self.partition,
                offset: cursor,
                value: inner.entries[index].clone(),
            })
        } else {
            None
        }
    }

    /// 从游标处批量取至多 max 条消息（不推进游标）
    pub fn try_poll_batch(&self, group: &str, max: usize) -> Vec<Delivered<T>> {
        let inner = self.inner.lock().expect("分区日志锁中毒");
        let Some(&cursor) = inner.cursors.get(group) else {
            return Vec::new();
        };
        let tail = inner.base_offset + inner.entries.len() as u64;

        (cursor..tail)
            .take(max)
            .map(|offset| {
                let index = (offset - inner.base_offset) as usize;
                Delivered {
                    partition: self.partition,
                    offset,
                    value: inner.entries[index].clone(),
                }
            })
            .collect()
    }

    /// 提交偏移量：游标推进到 offset + 1，并裁剪所有组都已越过的前缀
    pub fn commit(&self, group: &str, offset: u64) {
        let mut inner = self.inner.lock().expect("分区日志锁中毒");

        if let Some(cursor) = inner.cursors.get_mut(group) {
            if offset + 1 > *cursor {
                *cursor = offset + 1;
            }
        }

        let min_cursor = inner.cursors.values().copied().min().unwrap_or(0);
        let mut trimmed = false;
        while inner.base_offset < min_cursor && !inner.entries.is_empty() {
            inner.entries.pop_front();
            inner.base_offset += 1;
            trimmed = true;
        }
        drop(inner);

        if trimmed {
            self.space_available.notify_waiters();
        }
    }

    /// 游标之后仍未消费的消息数
    pub fn lag(&self, group: &str) -> u64 {
        let inner = self.inner.lock().expect("分区日志锁中毒");
        let tail = inner.base_offset + inner.entries.len() as u64;
        inner
            .cursors
            .get(group)
            .map(|cursor| tail.saturating_sub(*cursor))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_redelivers_until_commit() {
        let log = PartitionLog::new(0, 16);
        log.register_group("g1");
        log.publish(1).await;
        log.publish(2).await;

        // 未提交前重复 poll 拿到同一条消息
        let first = log.try_poll("g1").unwrap();
        let again = log.try_poll("g1").unwrap();
        assert_eq!(first.offset, again.offset);
        assert_eq!(first.value, 1);

        log.commit("g1", first.offset);
        let second = log.try_poll("g1").unwrap();
        assert_eq!(second.value, 2);
    }

    #[tokio::test]
    async fn test_independent_group_cursors() {
        let log = PartitionLog::new(0, 16);
        log.register_group("a");
        log.register_group("b");
        log.publish(10).await;

        let from_a = log.try_poll("a").unwrap();
        log.commit("a", from_a.offset);
        assert!(log.try_poll("a").is_none());

        // b 组游标独立，依然能读到
        let from_b = log.try_poll("b").unwrap();
        assert_eq!(from_b.value, 10);
    }

    #[tokio::test]
    async fn test_trim_waits_for_all_groups() {
        let log = PartitionLog::new(0, 2);
        log.register_group("a");
        log.register_group("b");
        log.publish(1).await;
        log.publish(2).await;

        let d = log.try_poll("a").unwrap();
        log.commit("a", d.offset);
        // b 组未提交，日志仍满
        assert_eq!(log.lag("b"), 2);

        let d = log.try_poll("b").unwrap();
        log.commit("b", d.offset);
        // 两组都越过 offset 0 后空间被释放，publish 不再阻塞
        log.publish(3).await;
        assert_eq!(log.lag("b"), 2);
    }

    #[tokio::test]
    async fn test_batch_poll_preserves_order() {
        let log = PartitionLog::new(0, 16);
        log.register_group("g");
        for i in 0..5 {
            log.publish(i).await;
        }

        let batch = log.try_poll_batch("g", 3);
        assert_eq!(batch.len(), 3);
        assert_eq!(
            batch.iter().map(|d| d.value).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        log.commit("g", batch.last().unwrap().offset);
        let rest = log.try_poll_batch("g", 10);
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].value, 3);
    }

    #[tokio::test]
    async fn test_ring_behavior_without_groups() {
        let log = PartitionLog::new(0, 2);
        log.publish(1).await;
        log.publish(2).await;
        // 无消费组时丢弃最旧消息而不是阻塞
        log.publish(3).await;

        log.register_group("late");
        assert!(log.try_poll("late").is_none());
    }
}
