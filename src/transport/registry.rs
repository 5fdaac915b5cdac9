//! 设备会话注册表
//!
//! 维护 device_id 到活跃会话的映射。每设备最多一个活跃会话，
//! 注册新会话时旧会话被要求关闭。

use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct RegisteredSession {
    session_id: Uuid,
    cancel: CancellationToken,
}

/// 会话注册表
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<String, RegisteredSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册会话。同设备已有其他会话时旧会话被取消；
    /// 同一会话重复认证只刷新映射
    pub fn register(&self, device_id: &str, session_id: Uuid, cancel: CancellationToken) {
        let mut inner = self.inner.lock().expect("会话注册表锁中毒");
        if let Some(prev) = inner.insert(
            device_id.to_string(),
            RegisteredSession { session_id, cancel },
        ) {
            if prev.session_id != session_id {
                tracing::info!(
                    device_id,
                    prev_session = %prev.session_id,
                    "同设备新会话建立，关闭旧会话"
                );
                prev.cancel.cancel();
            }
        }
    }

    /// 注销会话（仅当映射仍指向该会话时移除）
    pub fn remove(&self, device_id: &str, session_id: Uuid) -> bool {
        let mut inner = self.inner.lock().expect("会话注册表锁中毒");
        match inner.get(device_id) {
            Some(current) if current.session_id == session_id => {
                inner.remove(device_id);
                true
            }
            _ => false,
        }
    }

    /// 主动关闭某设备的会话（设备被禁用时调用）
    pub fn close_device(&self, device_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("会话注册表锁中毒");
        if let Some(session) = inner.remove(device_id) {
            session.cancel.cancel();
            true
        } else {
            false
        }
    }

    /// 设备当前是否在线
    pub fn is_connected(&self, device_id: &str) -> bool {
        self.inner
            .lock()
            .expect("会话注册表锁中毒")
            .contains_key(device_id)
    }

    /// 当前活跃会话数
    pub fn active_count(&self) -> usize {
        self.inner.lock().expect("会话注册表锁中毒").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_session_per_device() {
        let registry = SessionRegistry::new();
        let first = CancellationToken::new();
        let first_id = Uuid::new_v4();
        registry.register("d1", first_id, first.clone());

        // 第二个会话注册后，旧会话被取消
        let second = CancellationToken::new();
        registry.register("d1", Uuid::new_v4(), second.clone());

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(registry.active_count(), 1);

        // 旧会话退出清理时不能移除新会话的映射
        assert!(!registry.remove("d1", first_id));
        assert!(registry.is_connected("d1"));
    }

    #[test]
    fn test_close_device() {
        let registry = SessionRegistry::new();
        let cancel = CancellationToken::new();
        registry.register("d1", Uuid::new_v4(), cancel.clone());

        assert!(registry.close_device("d1"));
        assert!(cancel.is_cancelled());
        assert!(!registry.is_connected("d1"));
        assert!(!registry.close_device("d1"));
    }
}
