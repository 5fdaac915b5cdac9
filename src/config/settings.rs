//! 应用配置加载和管理

use config::{Config, ConfigError, Environment, File};
use secrecy::SecretString;
use serde::Deserialize;
use std::env;

/// 应用配置结构
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub tcp: TcpSettings,
    pub session: SessionSettings,
    pub prefilter: PrefilterSettings,
    pub queue: QueueSettings,
    pub rule: RuleSettings,
    pub dedup: DedupSettings,
    pub suppression: SuppressionSettings,
    pub history: HistorySettings,
    pub distributor: DistributorSettings,
    pub sync: SyncSettings,
    pub token: TokenSettings,
    pub id: IdSettings,
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub logging: LoggingSettings,
    pub shutdown: ShutdownSettings,
}

/// HTTP / WebSocket 服务器配置
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

/// 设备 TCP 接入配置
#[derive(Debug, Clone, Deserialize)]
pub struct TcpSettings {
    pub host: String,
    pub port: u16,
}

/// 设备会话配置
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    /// 读空闲超时（秒），超时后关闭连接
    #[serde(default = "default_idle_seconds")]
    pub idle_seconds: u64,
    /// 每会话待发送消息上限，溢出即关闭连接（慢消费者保护）
    #[serde(default = "default_max_pending_writes")]
    pub max_pending_writes: usize,
    /// 每 IP 每分钟允许的认证失败次数
    #[serde(default = "default_auth_attempts")]
    pub auth_attempts_per_minute: u32,
}

fn default_idle_seconds() -> u64 { 10 }
fn default_max_pending_writes() -> usize { 64 }
fn default_auth_attempts() -> u32 { 10 }

/// 预过滤阈值配置
#[derive(Debug, Clone, Deserialize)]
pub struct PrefilterSettings {
    #[serde(default = "default_temperature_threshold")]
    pub temperature_threshold: f64,
    #[serde(default = "default_humidity_threshold")]
    pub humidity_threshold: f64,
    /// 烟雾为累积型传感器：低于该绝对值的读数才可能视为平凡变化
    #[serde(default = "default_smoke_threshold")]
    pub smoke_threshold: f64,
    #[serde(default = "default_co_threshold")]
    pub co_threshold: f64,
}

fn default_temperature_threshold() -> f64 { 0.5 }
fn default_humidity_threshold() -> f64 { 1.0 }
fn default_smoke_threshold() -> f64 { 5.0 }
fn default_co_threshold() -> f64 { 5.0 }

/// 分区队列配置
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    /// 每个主题的分区数（3-10）
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    /// 单分区容量（消息条数），写满时生产者等待
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// 发布重试次数
    #[serde(default = "default_publish_retry")]
    pub publish_retry_attempts: u32,
    /// 发布重试退避基数（毫秒）
    #[serde(default = "default_publish_backoff")]
    pub publish_backoff_ms: u64,
    /// 普通消费组并发度（单条消息处理）
    #[serde(default = "default_normal_concurrency")]
    pub normal_concurrency: usize,
    /// 背压消费组并发度（批量处理）
    #[serde(default = "default_backpressure_concurrency")]
    pub backpressure_concurrency: usize,
    /// 背压消费组批量大小
    #[serde(default = "default_backpressure_batch")]
    pub backpressure_batch_size: usize,
    /// 背压消费组攒批等待（毫秒）
    #[serde(default = "default_backpressure_linger")]
    pub backpressure_linger_ms: u64,
}

fn default_partitions() -> usize { 10 }
fn default_queue_capacity() -> usize { 4096 }
fn default_publish_retry() -> u32 { 3 }
fn default_publish_backoff() -> u64 { 50 }
fn default_normal_concurrency() -> usize { 4 }
fn default_backpressure_concurrency() -> usize { 1 }
fn default_backpressure_batch() -> usize { 100 }
fn default_backpressure_linger() -> u64 { 200 }

/// 规则引擎配置
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSettings {
    /// 阈值更新端到端时延目标（95 分位，毫秒），超过时记录告警日志
    #[serde(default = "default_update_p95")]
    pub update_p95_ms: u64,
}

fn default_update_p95() -> u64 { 200 }

/// 告警去重配置
#[derive(Debug, Clone, Deserialize)]
pub struct DedupSettings {
    #[serde(default = "default_dedup_window")]
    pub window_seconds: u64,
    #[serde(default = "default_dedup_enabled")]
    pub enabled: bool,
}

fn default_dedup_window() -> u64 { 300 }
fn default_dedup_enabled() -> bool { true }

/// 消防抑制配置
#[derive(Debug, Clone, Deserialize)]
pub struct SuppressionSettings {
    /// 抑制状态自动过期上限（秒）
    #[serde(default = "default_auto_expire")]
    pub auto_expire_seconds: u64,
    /// 分布式锁等待上限（毫秒）
    #[serde(default = "default_lock_wait")]
    pub lock_wait_ms: u64,
    /// 分布式锁租约时长（毫秒），到期自动释放
    #[serde(default = "default_lock_lease")]
    pub lock_lease_ms: u64,
}

fn default_auto_expire() -> u64 { 1800 }
fn default_lock_wait() -> u64 { 5000 }
fn default_lock_lease() -> u64 { 10000 }

/// 告警历史配置
#[derive(Debug, Clone, Deserialize)]
pub struct HistorySettings {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// 降级内存环形缓冲容量
    #[serde(default = "default_fallback_size")]
    pub in_memory_fallback_size: usize,
    /// 过期清理执行间隔（秒）
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_retention_days() -> u32 { 30 }
fn default_fallback_size() -> usize { 1000 }
fn default_sweep_interval() -> u64 { 3600 }

/// 告警分发韧性配置
#[derive(Debug, Clone, Deserialize)]
pub struct DistributorSettings {
    #[serde(default = "default_retry_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// 熔断器开启阈值（滚动窗口失败率，0.0-1.0）
    #[serde(default = "default_failure_rate")]
    pub circuit_failure_rate: f64,
    /// 熔断器滚动窗口大小（次数）
    #[serde(default = "default_circuit_window")]
    pub circuit_window: usize,
    /// 熔断器冷却时长（毫秒），之后进入半开态
    #[serde(default = "default_cooldown")]
    pub circuit_cooldown_ms: u64,
    /// 每通道并发上限（隔板）
    #[serde(default = "default_bulkhead")]
    pub bulkhead_concurrency: usize,
    /// 每通道单次投递超时（毫秒）
    #[serde(default = "default_sink_timeout")]
    pub timeout_ms: u64,
}

fn default_retry_attempts() -> u32 { 3 }
fn default_retry_backoff() -> u64 { 100 }
fn default_failure_rate() -> f64 { 0.5 }
fn default_circuit_window() -> usize { 20 }
fn default_cooldown() -> u64 { 10000 }
fn default_bulkhead() -> usize { 8 }
fn default_sink_timeout() -> u64 { 2000 }

/// 数据同步配置
#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_seconds: u64,
    #[serde(default = "default_max_events")]
    pub max_events_per_snapshot: usize,
    /// 周期性快照广播间隔（秒）
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_seconds: u64,
}

fn default_snapshot_interval() -> u64 { 300 }
fn default_max_events() -> usize { 1000 }
fn default_broadcast_interval() -> u64 { 3600 }

/// 设备令牌配置
#[derive(Debug, Clone, Deserialize)]
pub struct TokenSettings {
    #[serde(default = "default_access_ttl")]
    pub access_ttl_seconds: u64,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_seconds: u64,
}

fn default_access_ttl() -> u64 { 300 }
fn default_refresh_ttl() -> u64 { 86400 }

/// ID 分配器配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct IdSettings {
    /// 节点 ID（0-1023）。未配置时从网卡硬件地址推导
    pub node_id: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub require_ssl: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    pub pool_size: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

/// 优雅停机配置
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownSettings {
    /// 两阶段停机：停止接收新工作后，等待在途工作的宽限时长（秒）
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
}

fn default_grace_seconds() -> u64 { 15 }

impl Settings {
    /// 从配置文件和环境变量加载配置
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("APP_ENV").unwrap_or_else(|_| "development".into());

        let settings = Config::builder()
            // 加载默认配置
            .add_source(File::with_name("config/development"))
            // 根据环境加载对应配置
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // 环境变量覆盖，前缀 VESTA，分隔符 __
            .add_source(
                Environment::with_prefix("VESTA")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }

    /// 获取数据库连接 URL（从环境变量）
    pub fn database_url() -> SecretString {
        SecretString::new(
            env::var("DATABASE_URL").expect("DATABASE_URL must be set in environment"),
        )
    }

    /// 获取 Redis 连接 URL（从环境变量）
    pub fn redis_url() -> SecretString {
        SecretString::new(env::var("REDIS_URL").expect("REDIS_URL must be set in environment"))
    }

    /// 获取 HTTP 服务器地址
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// 获取设备 TCP 接入地址
    pub fn tcp_addr(&self) -> String {
        format!("{}:{}", self.tcp.host, self.tcp.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        assert_eq!(default_idle_seconds(), 10);
        assert_eq!(default_dedup_window(), 300);
        assert_eq!(default_auto_expire(), 1800);
        assert_eq!(default_retention_days(), 30);
        assert_eq!(default_fallback_size(), 1000);
        assert_eq!(default_access_ttl(), 300);
        assert_eq!(default_refresh_ttl(), 86400);
        assert_eq!(default_snapshot_interval(), 300);
        assert_eq!(default_max_events(), 1000);
        assert_eq!(default_update_p95(), 200);
    }

    #[test]
    fn test_partitions_in_range() {
        let partitions = default_partitions();
        assert!((3..=10).contains(&partitions));
    }
}
