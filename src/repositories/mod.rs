//! 数据仓库模块

mod device_repo;

pub use device_repo::DeviceRepository;
