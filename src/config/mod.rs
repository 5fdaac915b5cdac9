//! 配置管理模块

mod settings;

pub use settings::{
    DatabaseSettings,
    DedupSettings,
    DistributorSettings,
    HistorySettings,
    IdSettings,
    LoggingSettings,
    PrefilterSettings,
    QueueSettings,
    RedisSettings,
    RuleSettings,
    ServerSettings,
    SessionSettings,
    Settings,
    ShutdownSettings,
    SuppressionSettings,
    SyncSettings,
    TcpSettings,
    TokenSettings,
};
