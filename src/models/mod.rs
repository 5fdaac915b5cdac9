//! 数据模型模块

mod alarm;
mod common;
mod device;
mod reading;
mod rule;
mod suppression;

pub use alarm::AlarmEvent;
pub use common::{Location, PaginatedResponse, Pagination};
pub use device::{CreateDeviceRequest, CreateDeviceResponse, Device, DeviceStatus};
pub use reading::{SensorData, SensorType};
pub use rule::{AlarmRule, AlarmSeverity, CreateRuleRequest, RuleOperator, UpdateRuleRequest};
pub use suppression::{
    ActivationOutcome, SuppressionEvent, SuppressionState, SuppressionType,
};
