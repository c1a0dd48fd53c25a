//! 配置管理
//!
//! 配置按以下顺序分层加载，后者覆盖前者：
//!
//! 1. 模型内置默认值
//! 2. TOML配置文件（显式路径或默认搜索路径）
//! 3. 环境变量（前缀 `IDENTITY_WORKER_`，嵌套键以 `__` 连接）
//!
//! 例如 `IDENTITY_WORKER_TRANSPORT__QUEUE_NAME=ad-actions` 覆盖 `transport.queue_name`。

pub mod models;

pub use models::*;
