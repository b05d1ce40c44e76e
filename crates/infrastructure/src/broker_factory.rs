use std::sync::Arc;

use tenant_core::{MessageQueueConfig, MessageQueueType, TaskClientError, TaskClientResult};
use tracing::{debug, info};

use crate::broker::{Broker, InMemoryBroker, RabbitMqBroker};

pub struct BrokerFactory;

impl BrokerFactory {
    /// 根据配置选择Broker驱动；驱动只负责拨号，连接由客户端的重连循环建立
    pub fn create(config: &MessageQueueConfig) -> TaskClientResult<Arc<dyn Broker>> {
        debug!("Creating broker with type: {:?}", config.r#type);

        config
            .validate()
            .map_err(|e| TaskClientError::Configuration(e.to_string()))?;

        match config.r#type {
            MessageQueueType::Rabbitmq => {
                info!("使用RabbitMQ驱动");
                Ok(Arc::new(RabbitMqBroker::new()))
            }
            MessageQueueType::InMemory => {
                info!("使用内存Broker驱动，消息不会持久化");
                Ok(Arc::new(InMemoryBroker::new()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_in_memory_broker() {
        let config = MessageQueueConfig {
            r#type: MessageQueueType::InMemory,
            url: "memory://local".to_string(),
            ..Default::default()
        };
        assert!(BrokerFactory::create(&config).is_ok());
    }

    #[test]
    fn test_create_rabbitmq_broker_does_not_connect() {
        let config = MessageQueueConfig::default();
        assert!(BrokerFactory::create(&config).is_ok());
    }

    #[test]
    fn test_invalid_rabbitmq_url_rejected() {
        let config = MessageQueueConfig {
            url: "http://localhost".to_string(),
            ..Default::default()
        };
        match BrokerFactory::create(&config) {
            Err(TaskClientError::Configuration(msg)) => assert!(msg.contains("AMQP")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected configuration error"),
        }
    }
}
