//! PostgreSQL 连接池管理
//!
//! Postgres 只承载设备注册表：遥测与告警历史都走 Redis 与分区
//! 队列，连接池按低并发配置即可。建池时一并应用迁移，设备表
//! 缺失的实例无法接入任何设备。

use crate::config::{DatabaseSettings, Settings};
use crate::errors::AppError;
use secrecy::ExposeSecret;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;

/// 设备注册库连接池
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    /// 连接设备注册库并应用迁移
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, AppError> {
        let database_url = Settings::database_url();

        let mut options = PgConnectOptions::from_str(database_url.expose_secret())
            .map_err(|e| AppError::ConfigError(format!("数据库 URL 无效: {}", e)))?
            .application_name("vesta");

        if settings.require_ssl {
            options = options.ssl_mode(PgSslMode::Require);
        }

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(Duration::from_secs(settings.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(settings.idle_timeout_seconds))
            // 设备认证热路径容不下坏连接，取用前先探活
            .test_before_acquire(true)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AppError::ConfigError(format!("设备注册表迁移失败: {}", e)))?;

        tracing::info!(
            max_connections = settings.max_connections,
            "设备注册库连接就绪"
        );

        Ok(Self { pool })
    }

    /// 获取内部连接池引用
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 就绪检查：设备注册表必须可读，返回已登记的设备数
    pub async fn ready(&self) -> Result<u64, AppError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM devices")
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }
}
