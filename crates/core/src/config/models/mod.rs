pub mod app_config;
pub mod message_queue;
pub mod observability;
pub mod relay;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use message_queue::{MessageQueueConfig, MessageQueueType};
pub use observability::ObservabilityConfig;
pub use relay::{OverflowPolicy, RelayConfig};
