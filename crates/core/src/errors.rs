use thiserror::Error;

/// 任务队列客户端错误类型定义
#[derive(Debug, Error)]
pub enum TaskClientError {
    #[error("与RabbitMQ的连接已断开，正在尝试重连")]
    Disconnected,

    #[error("消息队列错误: {0}")]
    MessageQueue(String),

    #[error("消息被Broker拒绝确认(nack)")]
    PublishNacked,

    #[error("等待发布确认超时，已尝试 {attempts} 次")]
    ConfirmTimeout { attempts: u32 },

    #[error("无法解析的消息体: {0}")]
    InvalidPayload(String),

    #[error("消息缺少任务状态")]
    MissingStatus,

    #[error("未知的任务状态: {0}")]
    UnknownStatus(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type TaskClientResult<T> = std::result::Result<T, TaskClientError>;

impl TaskClientError {
    pub fn message_queue<S: Into<String>>(msg: S) -> Self {
        Self::MessageQueue(msg.into())
    }

    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 调用方可以稍后重试的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskClientError::Disconnected
                | TaskClientError::MessageQueue(_)
                | TaskClientError::PublishNacked
                | TaskClientError::ConfirmTimeout { .. }
        )
    }

    /// 毒消息: 无论重投多少次都无法处理，只能永久拒绝
    pub fn is_poison(&self) -> bool {
        matches!(
            self,
            TaskClientError::InvalidPayload(_)
                | TaskClientError::MissingStatus
                | TaskClientError::UnknownStatus(_)
        )
    }
}

impl From<serde_json::Error> for TaskClientError {
    fn from(err: serde_json::Error) -> Self {
        TaskClientError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for TaskClientError {
    fn from(err: anyhow::Error) -> Self {
        TaskClientError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(TaskClientError::Disconnected.is_retryable());
        assert!(TaskClientError::PublishNacked.is_retryable());
        assert!(TaskClientError::ConfirmTimeout { attempts: 3 }.is_retryable());
        assert!(TaskClientError::message_queue("channel closed").is_retryable());
        assert!(!TaskClientError::MissingStatus.is_retryable());
        assert!(!TaskClientError::config_error("bad url").is_retryable());
    }

    #[test]
    fn test_poison_errors() {
        assert!(TaskClientError::InvalidPayload("eof".to_string()).is_poison());
        assert!(TaskClientError::MissingStatus.is_poison());
        assert!(TaskClientError::UnknownStatus("paused".to_string()).is_poison());
        assert!(!TaskClientError::Disconnected.is_poison());
    }

    #[test]
    fn test_error_display() {
        let err = TaskClientError::ConfirmTimeout { attempts: 2 };
        assert_eq!(err.to_string(), "等待发布确认超时，已尝试 2 次");

        let err = TaskClientError::UnknownStatus("paused".to_string());
        assert_eq!(err.to_string(), "未知的任务状态: paused");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: TaskClientError = json_err.into();
        assert!(matches!(err, TaskClientError::Serialization(_)));
    }
}
