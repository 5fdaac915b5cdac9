//! 统一错误类型定义

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;

/// 应用错误类型
///
/// 覆盖接入层、流水线与存储层的完整错误分类。单条消息的处理错误
/// 只中止该消息本身，绝不终止消费循环。
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // 认证错误：凭证无效（设备不存在 / 已禁用 / API Key 不匹配）
    #[error("认证失败")]
    Unauthorized(String),

    // 认证错误：令牌已过期
    #[error("令牌已过期")]
    TokenExpired(String),

    // 认证错误：令牌已被吊销
    #[error("令牌已吊销")]
    TokenRevoked(String),

    // 协议错误：帧格式非法，连接将被关闭且不回复
    #[error("协议错误")]
    ProtocolError(String),

    // 队列发布在重试预算耗尽后仍失败
    #[error("消息发布失败")]
    PublishError(String),

    // 后端存储不可达，触发降级路径（历史 / 去重均为 fail-open）
    #[error("存储服务不可用")]
    StoreUnavailable(String),

    // 单条规则编译失败，仅隔离该规则
    #[error("规则编译失败: {rule_id}")]
    RuleCompileError { rule_id: String, cause: String },

    // 抑制系统激活冲突：同一设备已有不同类型的抑制在运行
    #[error("抑制类型冲突")]
    SuppressionConflict(String),

    // 超过截止时间，部分结果已丢弃
    #[error("操作超时")]
    Timeout(String),

    // 请求验证错误
    #[error("请求参数无效")]
    ValidationError(String),

    // 资源不存在
    #[error("资源不存在")]
    NotFound(String),

    // 资源冲突
    #[error("资源冲突")]
    Conflict(String),

    // 限流错误
    #[error("请求过于频繁")]
    RateLimited(String),

    // 数据库错误
    #[error("数据库错误")]
    DatabaseError(#[from] sqlx::Error),

    // Redis 错误
    #[error("缓存服务错误")]
    RedisError(#[from] redis::RedisError),

    // 内部错误：记录上下文后继续
    #[error("内部服务错误")]
    InternalError(String),

    // 配置错误
    #[error("配置错误")]
    ConfigError(String),
}

impl AppError {
    /// 该错误是否应视为存储不可达（用于降级判定）
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self,
            AppError::StoreUnavailable(_) | AppError::RedisError(_)
        )
    }

    /// 消费循环中遇到该错误时是否仍应提交偏移量
    ///
    /// 协议错误与规则编译错误重试也必然失败，重投只会造成死循环。
    pub fn commit_despite_error(&self) -> bool {
        matches!(
            self,
            AppError::ProtocolError(_) | AppError::RuleCompileError { .. }
        )
    }
}

/// API 错误响应结构
#[derive(Serialize)]
struct ErrorResponse {
    code: u16,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_)
            | AppError::TokenExpired(_)
            | AppError::TokenRevoked(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ValidationError(_) | AppError::ProtocolError(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) | AppError::SuppressionConflict(_) => StatusCode::CONFLICT,
            AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::StoreUnavailable(_) | AppError::RedisError(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        // 对外只暴露分类信息，不泄露内部细节
        let (message, err_type) = match self {
            AppError::Unauthorized(_) => ("认证失败".to_string(), Some("unauthorized")),
            AppError::TokenExpired(_) => ("令牌已过期".to_string(), Some("token_expired")),
            AppError::TokenRevoked(_) => ("令牌已吊销".to_string(), Some("token_revoked")),
            AppError::NotFound(_) => ("资源不存在".to_string(), Some("not_found")),
            AppError::ValidationError(msg) => (msg.clone(), Some("validation_error")),
            AppError::Conflict(msg) => (msg.clone(), Some("conflict")),
            AppError::SuppressionConflict(msg) => {
                (msg.clone(), Some("suppression_conflict"))
            }
            AppError::RateLimited(_) => {
                ("请求过于频繁，请稍后重试".to_string(), Some("rate_limited"))
            }
            AppError::StoreUnavailable(_) | AppError::RedisError(_) => (
                "服务降级中，请稍后重试".to_string(),
                Some("store_unavailable"),
            ),
            AppError::Timeout(_) => ("操作超时".to_string(), Some("timeout")),
            _ => ("服务内部错误".to_string(), None),
        };

        tracing::error!(
            error_type = %self,
            status = %status,
            "请求处理错误"
        );

        HttpResponse::build(status).json(ErrorResponse {
            code: status.as_u16(),
            message,
            error: err_type.map(str::to_string),
        })
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InternalError(format!("序列化失败: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_despite_error() {
        assert!(AppError::ProtocolError("bad frame".into()).commit_despite_error());
        assert!(AppError::RuleCompileError {
            rule_id: "r1".into(),
            cause: "bad operator".into()
        }
        .commit_despite_error());
        assert!(!AppError::StoreUnavailable("redis down".into()).commit_despite_error());
        assert!(!AppError::Timeout("deadline".into()).commit_despite_error());
    }

    #[test]
    fn test_store_unavailable_classification() {
        assert!(AppError::StoreUnavailable("x".into()).is_store_unavailable());
        assert!(!AppError::PublishError("x".into()).is_store_unavailable());
    }
}
