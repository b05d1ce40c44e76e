use serde::{Deserialize, Serialize};

/// 转发队列满时的处理策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// 丢弃最早的消息，为新消息腾出位置
    #[default]
    DropOldest,
    /// 丢弃新到达的消息
    DropNewest,
}

/// 消费消息转发到 websocket 中继的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.capacity == 0 {
            return Err(anyhow::anyhow!("转发队列容量必须大于0"));
        }
        Ok(())
    }
}
