use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use lapin::{
    options::*, types::FieldTable, BasicProperties, Channel, Connection, ConnectionProperties,
    Event,
};
use tenant_core::{TaskClientError, TaskClientResult};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{
    Broker, BrokerChannel, BrokerConnection, ConfirmFuture, Confirmation, Delivery,
    DeliveryStream,
};

const DELIVERY_MODE_PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// 基于 lapin 的 RabbitMQ 驱动
#[derive(Debug, Default, Clone)]
pub struct RabbitMqBroker;

impl RabbitMqBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    async fn dial(&self, address: &str) -> TaskClientResult<Arc<dyn BrokerConnection>> {
        let connection = Connection::connect(address, ConnectionProperties::default())
            .await
            .map_err(|e| TaskClientError::MessageQueue(format!("连接RabbitMQ失败: {e}")))?;

        debug!("已建立RabbitMQ连接: {}", address);
        Ok(Arc::new(RabbitMqConnection { connection }))
    }
}

pub struct RabbitMqConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for RabbitMqConnection {
    async fn create_channel(&self) -> TaskClientResult<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| TaskClientError::MessageQueue(format!("创建通道失败: {e}")))?;

        Ok(Arc::new(RabbitMqChannel { channel }))
    }

    fn notify_close(&self) -> oneshot::Receiver<String> {
        let (mut tx, rx) = oneshot::channel();
        let mut events = Box::pin(self.connection.events_listener());

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    // 接收端已丢弃，不再需要通知
                    _ = tx.closed() => return,
                    event = events.next() => event,
                };

                match event {
                    Some(Event::Error(err)) => {
                        warn!("RabbitMQ连接异常关闭: {}", err);
                        let _ = tx.send(err.to_string());
                        return;
                    }
                    Some(Event::ConnectionBlocked(reason)) => {
                        warn!("RabbitMQ连接被Broker阻塞: {}", reason);
                    }
                    Some(_) => {}
                    None => {
                        let _ = tx.send("连接事件流已结束".to_string());
                        return;
                    }
                }
            }
        });

        rx
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> TaskClientResult<()> {
        if !self.is_open() {
            return Ok(());
        }

        self.connection
            .close(REPLY_SUCCESS, "正常关闭")
            .await
            .map_err(|e| TaskClientError::MessageQueue(format!("关闭连接失败: {e}")))?;

        info!("RabbitMQ连接已关闭");
        Ok(())
    }
}

pub struct RabbitMqChannel {
    channel: Channel,
}

impl RabbitMqChannel {
    /// 通道已经失效时返回可重试的 Disconnected，其余错误原样上报
    fn transport_error(&self, action: &str, err: lapin::Error) -> TaskClientError {
        if self.is_open() {
            TaskClientError::MessageQueue(format!("{action}失败: {err}"))
        } else {
            debug!("{}时通道已关闭: {}", action, err);
            TaskClientError::Disconnected
        }
    }
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    async fn enable_publisher_confirms(&self) -> TaskClientResult<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| self.transport_error("开启发布确认", e))
    }

    async fn declare_durable_queue(&self, queue: &str) -> TaskClientResult<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.transport_error(&format!("声明队列 {queue} "), e))?;

        debug!("队列 {} 声明成功", queue);
        Ok(())
    }

    async fn publish_persistent(
        &self,
        queue: &str,
        payload: &[u8],
    ) -> TaskClientResult<ConfirmFuture> {
        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
                    .with_content_type("text/plain".into()),
            )
            .await
            .map_err(|e| self.transport_error(&format!("发布消息到队列 {queue} "), e))?;

        Ok(async move {
            let confirmation = confirm
                .await
                .map_err(|e| TaskClientError::MessageQueue(format!("消息发布确认失败: {e}")))?;
            if confirmation.is_nack() {
                Ok(Confirmation::Nack)
            } else {
                Ok(Confirmation::Ack)
            }
        }
        .boxed())
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> TaskClientResult<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| self.transport_error("设置QoS", e))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> TaskClientResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    exclusive: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.transport_error(&format!("创建消费者 {consumer_tag} "), e))?;

        debug!("为队列 {} 创建消费者: {}", queue, consumer_tag);

        let stream = consumer.map(|result| {
            result
                .map(|delivery| Delivery {
                    delivery_tag: delivery.delivery_tag,
                    body: delivery.data,
                    redelivered: delivery.redelivered,
                })
                .map_err(|e| TaskClientError::MessageQueue(format!("接收消息失败: {e}")))
        });

        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> TaskClientResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| self.transport_error("确认消息", e))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> TaskClientResult<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| self.transport_error("否定确认消息", e))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> TaskClientResult<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| self.transport_error("拒绝消息", e))
    }

    async fn cancel(&self, consumer_tag: &str) -> TaskClientResult<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| self.transport_error(&format!("取消消费者 {consumer_tag} "), e))
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> TaskClientResult<()> {
        if !self.is_open() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "正常关闭")
            .await
            .map_err(|e| TaskClientError::MessageQueue(format!("关闭通道失败: {e}")))
    }
}
