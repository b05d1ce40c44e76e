//! 配置管理
//!
//! 配置来源按优先级从低到高:
//!
//! 1. 各配置段的 `Default` 实现
//! 2. TOML 配置文件（`--config` 指定，或按 [`models::app_config::DEFAULT_CONFIG_PATHS`] 查找）
//! 3. `TENANT__` 前缀的环境变量，例如 `TENANT__MESSAGE_QUEUE__URL`
//!
//! 加载完成后会对每个配置段执行 `validate()`。

pub mod models;

pub use models::*;
