//! Broker 抽象
//!
//! 连接监督器只通过这里的三个 trait 与 Broker 交互:
//!
//! - [`Broker`]: 拨号，建立一条新连接
//! - [`BrokerConnection`]: 打开通道、订阅关闭通知、关闭连接
//! - [`BrokerChannel`]: 声明队列、发布、消费、确认
//!
//! 生产环境使用 [`rabbitmq::RabbitMqBroker`]，测试与本地开发使用
//! [`in_memory::InMemoryBroker`]。

pub mod in_memory;
pub mod rabbitmq;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tenant_core::TaskClientResult;
use tokio::sync::oneshot;

pub use in_memory::{ConfirmBehavior, InMemoryBroker};
pub use rabbitmq::RabbitMqBroker;

/// 单次发布的确认结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
}

/// 单次发布对应的确认句柄，与发布一一对应，因此并发发布之间不会混淆确认
pub type ConfirmFuture = BoxFuture<'static, TaskClientResult<Confirmation>>;

/// 消费者收到的消息流；流结束表示消费者被取消或通道已关闭
pub type DeliveryStream = BoxStream<'static, TaskClientResult<Delivery>>;

/// 从队列收到的一条消息
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// 建立一条新连接
    async fn dial(&self, address: &str) -> TaskClientResult<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> TaskClientResult<Arc<dyn BrokerChannel>>;

    /// 订阅 Broker 主动关闭连接的通知，接收到的是关闭原因
    ///
    /// 每条连接只应订阅一次；重连后需要为新连接重新订阅。
    fn notify_close(&self) -> oneshot::Receiver<String>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> TaskClientResult<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// 开启发布确认模式
    async fn enable_publisher_confirms(&self) -> TaskClientResult<()>;

    /// 声明持久化、非独占、不自动删除的队列
    async fn declare_durable_queue(&self, queue: &str) -> TaskClientResult<()>;

    /// 以持久化模式发布消息到默认交换机，返回该消息的确认句柄
    async fn publish_persistent(&self, queue: &str, payload: &[u8])
        -> TaskClientResult<ConfirmFuture>;

    async fn set_prefetch(&self, prefetch_count: u16) -> TaskClientResult<()>;

    /// 以手动确认模式注册消费者
    async fn consume(&self, queue: &str, consumer_tag: &str) -> TaskClientResult<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> TaskClientResult<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> TaskClientResult<()>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> TaskClientResult<()>;

    async fn cancel(&self, consumer_tag: &str) -> TaskClientResult<()>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> TaskClientResult<()>;
}
