//! 工具函数模块

mod snowflake;
mod time;

pub use snowflake::{IdAllocator, IdParts, TYPE_ALARM, TYPE_READING};
pub use time::*;
