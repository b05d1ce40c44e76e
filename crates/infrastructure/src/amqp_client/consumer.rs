use std::sync::Arc;

use futures::StreamExt;
use tenant_core::{Task, TaskClientError, TaskClientResult};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::AmqpClient;
use crate::broker::{BrokerChannel, Delivery, DeliveryStream};
use crate::relay::MessageRelay;

/// 单条消息的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 已确认并转发
    Acked,
    /// 消息体无法解析或缺少状态，已丢弃
    Nacked,
    /// 状态未知，已丢弃
    Rejected,
    /// 确认失败，消息会在通道关闭后重新投递
    SettleFailed,
}

/// 工作者退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    Stopped,
    StreamClosed,
}

fn consumer_name(index: usize) -> String {
    format!("consumer-{index}")
}

impl AmqpClient {
    /// 在监听队列上启动 `threads` 个消费者，阻塞直到全部退出
    ///
    /// 返回 `Ok(())` 表示调用方取消或客户端关闭；返回 `Err` 表示当前链路已失效，
    /// 调用方应在重连后再次调用。
    pub async fn stream(&self, cancel: CancellationToken) -> TaskClientResult<()> {
        let channel = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            channel = self.wait_for_channel() => match channel {
                Ok(channel) => channel,
                // 客户端已关闭
                Err(_) => return Ok(()),
            },
        };
        channel.set_prefetch(self.prefetch_count).await?;

        let mut deliveries = Vec::with_capacity(self.threads);
        for index in 1..=self.threads {
            let tag = consumer_name(index);
            match channel.consume(&self.listen_queue, &tag).await {
                Ok(stream) => {
                    self.active_consumers().insert(tag.clone());
                    deliveries.push((tag, stream));
                }
                Err(e) => {
                    error!("注册消费者 {} 失败: {}", tag, e);
                    let tags: Vec<String> = deliveries.into_iter().map(|(tag, _)| tag).collect();
                    self.release_consumers(&*channel, &tags, self.is_alive()).await;
                    return Err(e);
                }
            }
        }

        info!(
            threads = self.threads,
            queue = %self.listen_queue,
            "开始等待RabbitMQ事件..."
        );

        let stop = cancel.child_token();
        let mut tags = Vec::with_capacity(deliveries.len());
        let mut workers = JoinSet::new();
        for (tag, stream) in deliveries {
            tags.push(tag.clone());
            let worker = ConsumerWorker {
                tag,
                channel: Arc::clone(&channel),
                relay: self.relay.clone(),
                stop: stop.clone(),
                shutdown: self.shutdown.clone(),
            };
            workers.spawn(self.workers.track_future(worker.run(stream)));
        }

        let mut link_lost = false;
        while let Some(joined) = workers.join_next().await {
            let exit = joined.unwrap_or_else(|e| {
                error!("消费者任务异常退出: {}", e);
                WorkerExit::StreamClosed
            });
            if exit == WorkerExit::StreamClosed {
                link_lost = true;
                // 一个消费者失效时其余消费者一并退出，由调用方统一重启
                stop.cancel();
            }
        }

        // 关闭流程可能已先一步清空活跃列表，这里注册的标签仍需移除
        self.release_consumers(&*channel, &tags, self.is_alive()).await;

        if link_lost && self.is_alive() && !cancel.is_cancelled() {
            warn!("消费者消息流已关闭，等待重连");
            return Err(TaskClientError::Disconnected);
        }

        info!("消费者已全部退出");
        Ok(())
    }

    /// 从活跃列表移除消费者，`cancel_on_broker` 为真时同时在Broker侧注销
    async fn release_consumers(
        &self,
        channel: &dyn BrokerChannel,
        tags: &[String],
        cancel_on_broker: bool,
    ) {
        for tag in tags {
            if cancel_on_broker && channel.is_open() {
                if let Err(e) = channel.cancel(tag).await {
                    debug!("取消消费者 {} 失败: {}", tag, e);
                }
            }
            self.active_consumers().remove(tag);
        }
    }
}

struct ConsumerWorker {
    tag: String,
    channel: Arc<dyn BrokerChannel>,
    relay: MessageRelay,
    stop: CancellationToken,
    shutdown: CancellationToken,
}

impl ConsumerWorker {
    async fn run(self, mut deliveries: DeliveryStream) -> WorkerExit {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return WorkerExit::Stopped,
                _ = self.shutdown.cancelled() => return WorkerExit::Stopped,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    handle_delivery(&*self.channel, &self.relay, &self.tag, delivery).await;
                }
                Some(Err(e)) => {
                    warn!(consumer = %self.tag, "接收消息失败: {}", e);
                    return WorkerExit::StreamClosed;
                }
                None if self.stop.is_cancelled() || self.shutdown.is_cancelled() => {
                    return WorkerExit::Stopped;
                }
                None => {
                    debug!(consumer = %self.tag, "消息流已结束");
                    return WorkerExit::StreamClosed;
                }
            }
        }
    }
}

/// 处理一条消息
///
/// - 消息体不是合法的任务JSON，或缺少状态: 否定确认且不重新入队
/// - 状态不在已知集合中: 拒绝且不重新入队
/// - 其余情况: 先确认，再把原始消息体转发给中继
pub(crate) async fn handle_delivery(
    channel: &dyn BrokerChannel,
    relay: &MessageRelay,
    consumer_tag: &str,
    delivery: Delivery,
) -> DeliveryOutcome {
    let started = Instant::now();

    match Task::decode(&delivery.body) {
        Ok(task) => {
            if let Err(e) = channel.ack(delivery.delivery_tag).await {
                error!(consumer = consumer_tag, task_id = %task.id, "确认消息失败: {}", e);
                metrics::counter!("task_queue_settle_failed_total").increment(1);
                return DeliveryOutcome::SettleFailed;
            }

            metrics::counter!("task_queue_consumed_total", "outcome" => "acked").increment(1);
            info!(
                consumer = consumer_tag,
                task_id = %task.id,
                status = %task.status,
                redelivered = delivery.redelivered,
                took_ms = started.elapsed().as_millis() as u64,
                "任务 {} 解析成功",
                task.description
            );
            relay.send(delivery.body);
            DeliveryOutcome::Acked
        }
        Err(TaskClientError::UnknownStatus(status)) => {
            warn!(consumer = consumer_tag, "未知的任务状态 {:?}，拒绝消息", status);
            if let Err(e) = channel.reject(delivery.delivery_tag, false).await {
                error!(consumer = consumer_tag, "拒绝消息失败: {}", e);
                metrics::counter!("task_queue_settle_failed_total").increment(1);
                return DeliveryOutcome::SettleFailed;
            }
            metrics::counter!("task_queue_consumed_total", "outcome" => "rejected").increment(1);
            DeliveryOutcome::Rejected
        }
        Err(e) => {
            error!(consumer = consumer_tag, "无法解析消息: {}", e);
            if let Err(e) = channel.nack(delivery.delivery_tag, false).await {
                error!(consumer = consumer_tag, "否定确认消息失败: {}", e);
                metrics::counter!("task_queue_settle_failed_total").increment(1);
                return DeliveryOutcome::SettleFailed;
            }
            metrics::counter!("task_queue_consumed_total", "outcome" => "nacked").increment(1);
            DeliveryOutcome::Nacked
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, InMemoryBroker};
    use std::time::Duration;
    use tenant_core::{MessageQueueConfig, MessageQueueType, OverflowPolicy, TaskStatus};
    use tokio::time::{sleep, timeout};

    async fn deliver(broker: &InMemoryBroker, body: &[u8]) -> (Arc<dyn BrokerChannel>, Delivery) {
        let connection = broker.dial("memory://test").await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.declare_durable_queue("task_status").await.unwrap();
        broker.inject("task_status", body.to_vec());

        let mut stream = channel.consume("task_status", "consumer-1").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        (channel, delivery)
    }

    #[test]
    fn test_consumer_name() {
        assert_eq!(consumer_name(1), "consumer-1");
        assert_eq!(consumer_name(12), "consumer-12");
    }

    #[tokio::test]
    async fn test_valid_task_is_acked_and_relayed() {
        let broker = InMemoryBroker::new();
        let relay = MessageRelay::new(8, OverflowPolicy::DropOldest);
        let body = Task::new(vec!["tenant".into()], "创建租户")
            .with_status(TaskStatus::Completed)
            .encode()
            .unwrap();

        let (channel, delivery) = deliver(&broker, &body).await;
        let outcome = handle_delivery(&*channel, &relay, "consumer-1", delivery).await;

        assert_eq!(outcome, DeliveryOutcome::Acked);
        assert_eq!(broker.acked(), vec![body.clone()]);
        assert_eq!(relay.try_recv(), Some(body));
        assert!(relay.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_is_nacked_without_requeue() {
        let broker = InMemoryBroker::new();
        let relay = MessageRelay::new(8, OverflowPolicy::DropOldest);

        let (channel, delivery) = deliver(&broker, b"not json").await;
        let outcome = handle_delivery(&*channel, &relay, "consumer-1", delivery).await;

        assert_eq!(outcome, DeliveryOutcome::Nacked);
        assert_eq!(broker.nacked(), vec![(b"not json".to_vec(), false)]);
        assert!(broker.ready_messages("task_status").is_empty());
        assert!(relay.is_empty());
    }

    #[tokio::test]
    async fn test_missing_status_is_nacked() {
        let broker = InMemoryBroker::new();
        let relay = MessageRelay::new(8, OverflowPolicy::DropOldest);
        let body = br#"{"id":"00000000-0000-0000-0000-000000000000","description":"x","tags":[],"progress":0.5}"#;

        let (channel, delivery) = deliver(&broker, body).await;
        let outcome = handle_delivery(&*channel, &relay, "consumer-1", delivery).await;

        assert_eq!(outcome, DeliveryOutcome::Nacked);
        assert_eq!(broker.nacked().len(), 1);
        assert!(broker.rejected().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_status_is_rejected_without_requeue() {
        let broker = InMemoryBroker::new();
        let relay = MessageRelay::new(8, OverflowPolicy::DropOldest);
        let body = br#"{"id":"00000000-0000-0000-0000-000000000000","description":"x","tags":[],"status":"paused","progress":0.5}"#;

        let (channel, delivery) = deliver(&broker, body).await;
        let outcome = handle_delivery(&*channel, &relay, "consumer-1", delivery).await;

        assert_eq!(outcome, DeliveryOutcome::Rejected);
        assert_eq!(broker.rejected(), vec![(body.to_vec(), false)]);
        assert!(broker.nacked().is_empty());
        assert!(relay.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_exit_after_shutdown_clears_active_consumers() {
        let broker = InMemoryBroker::new();
        let config = MessageQueueConfig {
            r#type: MessageQueueType::InMemory,
            url: "memory://local".to_string(),
            consumer_concurrency: 2,
            ..Default::default()
        };
        let client = AmqpClient::new(
            Arc::new(broker.clone()),
            &config,
            MessageRelay::new(8, OverflowPolicy::DropOldest),
        );
        client.start().await;
        assert!(timeout(Duration::from_secs(10), client.wait_connected())
            .await
            .unwrap());

        let stream = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.stream(CancellationToken::new()).await })
        };
        while client.state().active_consumers.len() < client.threads() {
            sleep(Duration::from_millis(10)).await;
        }

        // 只触发关闭信号，不经过 close() 的清理
        client.shutdown.cancel();

        stream.await.unwrap().unwrap();
        assert!(client.state().active_consumers.is_empty());
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_ack_failure_does_not_relay() {
        let broker = InMemoryBroker::new();
        let relay = MessageRelay::new(8, OverflowPolicy::DropOldest);
        let body = Task::new(vec![], "x").encode().unwrap();

        let (channel, delivery) = deliver(&broker, &body).await;
        broker.sever_connections("broker restart");
        let outcome = handle_delivery(&*channel, &relay, "consumer-1", delivery).await;

        assert_eq!(outcome, DeliveryOutcome::SettleFailed);
        assert!(relay.is_empty());
        assert_eq!(broker.ready_messages("task_status"), vec![body]);
    }
}
