pub mod config;
pub mod errors;
pub mod models;

pub use config::{
    AppConfig, MessageQueueConfig, MessageQueueType, ObservabilityConfig, OverflowPolicy,
    RelayConfig,
};
pub use errors::*;
pub use models::{Task, TaskStatus, INITIAL_PROGRESS};

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, TaskClientError>;
