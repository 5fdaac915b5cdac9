//! 通道韧性装饰器
//!
//! 重试、熔断、隔板与超时都实现为接受 `AlarmSink`、返回
//! `AlarmSink` 的可组合装饰器。组合顺序（外到内）：
//! 重试 → 熔断 → 超时 → 隔板，保证每次重试尝试都经过熔断
//! 判定且整体受时限约束。

use crate::distribution::sink::AlarmSink;
use crate::errors::AppError;
use crate::models::AlarmEvent;
use async_trait::async_trait;
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// 重试装饰器：有界尝试 + 指数退避 + 抖动
pub struct RetrySink {
    inner: Arc<dyn AlarmSink>,
    max_attempts: u32,
    backoff_ms: u64,
    rng: SystemRandom,
}

impl RetrySink {
    pub fn new(inner: Arc<dyn AlarmSink>, max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            inner,
            max_attempts,
            backoff_ms,
            rng: SystemRandom::new(),
        }
    }

    fn jitter(&self, max_ms: u64) -> u64 {
        if max_ms == 0 {
            return 0;
        }
        let mut buf = [0u8; 4];
        if self.rng.fill(&mut buf).is_ok() {
            u64::from(u32::from_be_bytes(buf)) % max_ms
        } else {
            0
        }
    }
}

#[async_trait]
impl AlarmSink for RetrySink {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn deliver(&self, alarm: &AlarmEvent) -> Result<(), AppError> {
        let mut last_error = None;

        for attempt in 0..self.max_attempts.max(1) {
            match self.inner.deliver(alarm).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(
                        sink = self.inner.name(),
                        attempt = attempt + 1,
                        error = %e,
                        "通道投递失败"
                    );
                    last_error = Some(e);

                    if attempt + 1 < self.max_attempts {
                        let backoff =
                            self.backoff_ms.saturating_mul(1 << attempt.min(6));
                        let sleep_ms = backoff + self.jitter(backoff / 2 + 1);
                        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| AppError::InternalError("重试预算为零".to_string())))
    }
}

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitInner {
    state: CircuitState,
    open_until: Instant,
    /// 滚动结果窗口：true 表示成功
    window: VecDeque<bool>,
}

/// 熔断装饰器：滚动失败率超阈值后熔断，冷却后半开试探
pub struct CircuitBreakerSink {
    inner: Arc<dyn AlarmSink>,
    failure_rate: f64,
    window_size: usize,
    cooldown: Duration,
    circuit: Mutex<CircuitInner>,
}

impl CircuitBreakerSink {
    pub fn new(
        inner: Arc<dyn AlarmSink>,
        failure_rate: f64,
        window_size: usize,
        cooldown: Duration,
    ) -> Self {
        Self {
            inner,
            failure_rate,
            window_size: window_size.max(1),
            cooldown,
            circuit: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                open_until: Instant::now(),
                window: VecDeque::new(),
            }),
        }
    }

    /// 当前熔断状态
    pub fn state(&self) -> CircuitState {
        self.circuit.lock().expect("熔断器锁中毒").state
    }

    /// 进入前判定：开启且未冷却完毕时直接拒绝
    fn admit(&self) -> Result<(), AppError> {
        let mut circuit = self.circuit.lock().expect("熔断器锁中毒");
        match circuit.state {
            CircuitState::Open if Instant::now() < circuit.open_until => Err(
                AppError::StoreUnavailable(format!("{} 通道熔断中", self.inner.name())),
            ),
            CircuitState::Open => {
                // 冷却结束，放一个试探请求
                circuit.state = CircuitState::HalfOpen;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn record(&self, success: bool) {
        let mut circuit = self.circuit.lock().expect("熔断器锁中毒");

        match circuit.state {
            CircuitState::HalfOpen => {
                if success {
                    tracing::info!(sink = self.inner.name(), "熔断器恢复闭合");
                    circuit.state = CircuitState::Closed;
                    circuit.window.clear();
                } else {
                    tracing::warn!(sink = self.inner.name(), "半开试探失败，重新熔断");
                    circuit.state = CircuitState::Open;
                    circuit.open_until = Instant::now() + self.cooldown;
                }
            }
            _ => {
                circuit.window.push_back(success);
                if circuit.window.len() > self.window_size {
                    circuit.window.pop_front();
                }

                if circuit.window.len() >= self.window_size {
                    let failures = circuit.window.iter().filter(|ok| !**ok).count();
                    let rate = failures as f64 / circuit.window.len() as f64;
                    if rate >= self.failure_rate {
                        tracing::warn!(
                            sink = self.inner.name(),
                            failure_rate = rate,
                            "失败率超阈值，熔断器开启"
                        );
                        circuit.state = CircuitState::Open;
                        circuit.open_until = Instant::now() + self.cooldown;
                        circuit.window.clear();
                    }
                }
            }
        }
    }
}

#[async_trait]
impl AlarmSink for CircuitBreakerSink {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn deliver(&self, alarm: &AlarmEvent) -> Result<(), AppError> {
        self.admit()?;

        let result = self.inner.deliver(alarm).await;
        self.record(result.is_ok());
        result
    }
}

/// 隔板装饰器：每通道有界并发，防止队头阻塞扩散
pub struct BulkheadSink {
    inner: Arc<dyn AlarmSink>,
    permits: Arc<Semaphore>,
}

impl BulkheadSink {
    pub fn new(inner: Arc<dyn AlarmSink>, concurrency: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }
}

#[async_trait]
impl AlarmSink for BulkheadSink {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn deliver(&self, alarm: &AlarmEvent) -> Result<(), AppError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AppError::InternalError("隔板信号量已关闭".to_string()))?;
        self.inner.deliver(alarm).await
    }
}

/// 超时装饰器：超过截止时间即放弃，丢弃部分结果
pub struct TimeoutSink {
    inner: Arc<dyn AlarmSink>,
    timeout: Duration,
}

impl TimeoutSink {
    pub fn new(inner: Arc<dyn AlarmSink>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl AlarmSink for TimeoutSink {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn deliver(&self, alarm: &AlarmEvent) -> Result<(), AppError> {
        match tokio::time::timeout(self.timeout, self.inner.deliver(alarm)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(format!(
                "{} 通道投递超时",
                self.inner.name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlarmSeverity, Location};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn alarm() -> AlarmEvent {
        AlarmEvent {
            id: 1,
            device_id: "d1".into(),
            alarm_type: "SMOKE".into(),
            severity: AlarmSeverity::High,
            value: 80.0,
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

    /// 前 N 次失败然后恒成功的通道
    struct FlakySink {
        calls: AtomicU32,
        fail_first: u32,
    }

    impl FlakySink {
        fn new(fail_first: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
            }
        }
    }

    #[async_trait]
    impl AlarmSink for FlakySink {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn deliver(&self, _: &AlarmEvent) -> Result<(), AppError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(AppError::StoreUnavailable("不可用".into()))
            } else {
                Ok(())
            }
        }
    }

    /// 永不返回的通道
    struct StuckSink;

    #[async_trait]
    impl AlarmSink for StuckSink {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn deliver(&self, _: &AlarmEvent) -> Result<(), AppError> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let flaky = Arc::new(FlakySink::new(2));
        let retry = RetrySink::new(flaky.clone(), 3, 1);

        assert!(retry.deliver(&alarm()).await.is_ok());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_budget() {
        let flaky = Arc::new(FlakySink::new(10));
        let retry = RetrySink::new(flaky.clone(), 3, 1);

        assert!(retry.deliver(&alarm()).await.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_circuit_opens_on_failure_rate() {
        let failing = Arc::new(FlakySink::new(u32::MAX));
        let circuit =
            CircuitBreakerSink::new(failing.clone(), 0.5, 4, Duration::from_secs(60));

        for _ in 0..4 {
            let _ = circuit.deliver(&alarm()).await;
        }
        assert_eq!(circuit.state(), CircuitState::Open);

        // 熔断期间请求被直接拒绝，不再触达内部通道
        let calls_before = failing.calls.load(Ordering::SeqCst);
        assert!(circuit.deliver(&alarm()).await.is_err());
        assert_eq!(failing.calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn test_circuit_half_open_recovery() {
        let flaky = Arc::new(FlakySink::new(4));
        let circuit = CircuitBreakerSink::new(flaky, 0.5, 4, Duration::from_millis(10));

        for _ in 0..4 {
            let _ = circuit.deliver(&alarm()).await;
        }
        assert_eq!(circuit.state(), CircuitState::Open);

        // 冷却结束后半开试探成功，熔断器闭合
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(circuit.deliver(&alarm()).await.is_ok());
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_timeout_bounds_stuck_sink() {
        let timeout = TimeoutSink::new(Arc::new(StuckSink), Duration::from_millis(20));

        let result = timeout.deliver(&alarm()).await;
        assert!(matches!(result, Err(AppError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_bulkhead_limits_concurrency() {
        use std::sync::atomic::AtomicUsize;

        struct CountingSink {
            current: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl AlarmSink for CountingSink {
            fn name(&self) -> &str {
                "counting"
            }

            async fn deliver(&self, _: &AlarmEvent) -> Result<(), AppError> {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let counting = Arc::new(CountingSink {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let bulkhead = Arc::new(BulkheadSink::new(counting.clone(), 2));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let bulkhead = bulkhead.clone();
                tokio::spawn(async move { bulkhead.deliver(&alarm()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(counting.peak.load(Ordering::SeqCst) <= 2);
    }
}
