//! 设备接入模块
//!
//! 长连接 TCP 传输层：行分隔 JSON 帧、认证状态机、
//! 心跳活性维护与数据预过滤。

pub mod messages;
mod prefilter;
mod registry;
mod server;
mod session;

pub use messages::{DataMessage, DeviceMessage, ServerReply, WireReading};
pub use prefilter::{FilterDecision, PreFilter, PreFilterStats};
pub use registry::SessionRegistry;
pub use server::run as run_device_server;
pub use session::{handle_connection, SessionContext};
