pub mod amqp_client;
pub mod backoff;
pub mod broker;
pub mod broker_factory;
pub mod relay;
pub mod task_client;

pub use amqp_client::{AmqpClient, ConnectionSnapshot, DeliveryOutcome, LinkState};
pub use backoff::ReconnectBackoff;
pub use broker::{Broker, BrokerChannel, BrokerConnection, InMemoryBroker, RabbitMqBroker};
pub use broker_factory::BrokerFactory;
pub use relay::{MessageRelay, RelayOutcome};
pub use task_client::{TaskClient, TaskPublisher};
