//! WebSocket 模块
//!
//! 仪表盘实时通道：
//! - 告警主题订阅与实时推送
//! - 快照 / 增量拉取
//! - 周期性快照广播

mod handler;
mod hub;
mod messages;
mod session;

pub use handler::{configure as configure_ws_routes, ws_handler};
pub use hub::{is_valid_topic, severity_topic, TopicEvent, WsHub, TOPIC_ALL, TOPIC_SNAPSHOT};
pub use messages::*;
pub use session::WsSession;
