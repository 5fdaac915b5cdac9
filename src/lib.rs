//! Vesta - 消防安全遥测平台核心
//!
//! 高吞吐实时流水线，支持：
//! - 设备 TCP 长连接接入（令牌认证 + 心跳活性）
//! - 数据预过滤与分区有序摄入
//! - 流式规则评估（时间窗口 + 指纹去重）
//! - 多通道告警分发（部分失败容忍）
//! - 时间索引的告警历史与降级缓冲
//! - 原子化消防抑制原语

pub mod config;
pub mod db;
pub mod distribution;
pub mod errors;
pub mod models;
pub mod queue;
pub mod repositories;
pub mod security;
pub mod services;
pub mod transport;
pub mod utils;
pub mod websocket;

pub use errors::AppError;
