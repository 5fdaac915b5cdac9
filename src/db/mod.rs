//! 数据库连接模块

mod postgres;
mod redis_client;

pub use postgres::PostgresPool;
pub use redis_client::RedisPool;
