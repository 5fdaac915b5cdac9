//! 主题分发中心
//!
//! 维护主题到订阅会话的映射。分发器与同步服务通过它把告警
//! 负载推送给订阅了对应主题的仪表盘会话。

use actix::prelude::*;
use crate::models::AlarmSeverity;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// 全量告警主题
pub const TOPIC_ALL: &str = "alarm/all";
/// 周期性快照主题（新加入的客户端用于引导）
pub const TOPIC_SNAPSHOT: &str = "alarm/snapshot";

/// 级别主题（`alarm/low` / `alarm/medium` / `alarm/high`）
pub fn severity_topic(severity: AlarmSeverity) -> String {
    format!("alarm/{}", severity.topic_suffix())
}

/// 主题是否是合法的订阅目标
pub fn is_valid_topic(topic: &str) -> bool {
    matches!(
        topic,
        TOPIC_ALL | TOPIC_SNAPSHOT | "alarm/low" | "alarm/medium" | "alarm/high"
    )
}

/// 推送给订阅会话的主题消息
#[derive(Message, Clone, Debug)]
#[rtype(result = "()")]
pub struct TopicEvent {
    pub topic: String,
    pub payload: String,
}

/// 主题分发中心
#[derive(Default)]
pub struct WsHub {
    topics: RwLock<HashMap<String, HashMap<Uuid, Recipient<TopicEvent>>>>,
}

impl WsHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅主题
    pub fn subscribe(&self, topic: &str, session_id: Uuid, recipient: Recipient<TopicEvent>) {
        let mut topics = self.topics.write().expect("主题表锁中毒");
        topics
            .entry(topic.to_string())
            .or_default()
            .insert(session_id, recipient);
    }

    /// 取消订阅单个主题
    pub fn unsubscribe(&self, topic: &str, session_id: Uuid) {
        let mut topics = self.topics.write().expect("主题表锁中毒");
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.remove(&session_id);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// 会话关闭时移除其全部订阅
    pub fn unsubscribe_all(&self, session_id: Uuid) {
        let mut topics = self.topics.write().expect("主题表锁中毒");
        topics.retain(|_, subscribers| {
            subscribers.remove(&session_id);
            !subscribers.is_empty()
        });
    }

    /// 向主题发布负载，返回接收方数量（do_send 非阻塞）
    pub fn publish(&self, topic: &str, payload: &str) -> usize {
        let topics = self.topics.read().expect("主题表锁中毒");
        let Some(subscribers) = topics.get(topic) else {
            return 0;
        };

        for recipient in subscribers.values() {
            recipient.do_send(TopicEvent {
                topic: topic.to_string(),
                payload: payload.to_string(),
            });
        }
        subscribers.len()
    }

    /// 主题当前的订阅数
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .expect("主题表锁中毒")
            .get(topic)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Probe {
        received: Arc<Mutex<Vec<TopicEvent>>>,
    }

    impl Actor for Probe {
        type Context = Context<Self>;
    }

    impl Handler<TopicEvent> for Probe {
        type Result = ();

        fn handle(&mut self, msg: TopicEvent, _: &mut Self::Context) {
            self.received.lock().unwrap().push(msg);
        }
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(severity_topic(AlarmSeverity::High), "alarm/high");
        assert!(is_valid_topic("alarm/all"));
        assert!(is_valid_topic("alarm/snapshot"));
        assert!(!is_valid_topic("alarm/critical"));
    }

    #[actix_web::test]
    async fn test_publish_reaches_subscribers() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let probe = Probe {
            received: received.clone(),
        }
        .start();

        let hub = WsHub::new();
        let session_id = Uuid::new_v4();
        hub.subscribe(TOPIC_ALL, session_id, probe.recipient());
        assert_eq!(hub.subscriber_count(TOPIC_ALL), 1);

        let delivered = hub.publish(TOPIC_ALL, r#"{"id":"1"}"#);
        assert_eq!(delivered, 1);

        // 等待 actor 邮箱处理
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let events = received.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic, TOPIC_ALL);
    }

    #[actix_web::test]
    async fn test_unsubscribe_all_removes_session() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let probe = Probe {
            received: received.clone(),
        }
        .start();

        let hub = WsHub::new();
        let session_id = Uuid::new_v4();
        hub.subscribe(TOPIC_ALL, session_id, probe.clone().recipient());
        hub.subscribe(TOPIC_SNAPSHOT, session_id, probe.recipient());

        hub.unsubscribe_all(session_id);
        assert_eq!(hub.subscriber_count(TOPIC_ALL), 0);
        assert_eq!(hub.publish(TOPIC_ALL, "{}"), 0);
    }
}
