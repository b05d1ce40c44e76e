use tenant_core::{TaskClientError, TaskClientResult};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use super::AmqpClient;
use crate::broker::{ConfirmFuture, Confirmation};

impl AmqpClient {
    /// 发布消息并等待Broker确认
    ///
    /// 未连接时立即返回 [`TaskClientError::Disconnected`]，不会产生任何网络请求。
    /// 确认超时会重新发布；等待确认期间连接断开时，等重连成功后在新通道上重新发布。
    /// 因此同一条消息可能被投递多次，消费方需要按任务ID去重。
    pub async fn push(&self, payload: &[u8]) -> TaskClientResult<()> {
        if !self.is_alive() || !self.is_connected() {
            metrics::counter!("task_queue_publish_failed_total").increment(1);
            return Err(TaskClientError::Disconnected);
        }

        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            let confirm = match self.publish_once(payload).await {
                Ok(confirm) => confirm,
                Err(TaskClientError::Disconnected) if attempts < self.publish_max_attempts => {
                    warn!(attempts, "发布时连接已断开，等待重连后重试");
                    self.wait_for_reconnect().await?;
                    continue;
                }
                Err(e) => {
                    metrics::counter!("task_queue_publish_failed_total").increment(1);
                    return Err(e);
                }
            };

            match timeout(self.confirm_timeout, confirm).await {
                Ok(Ok(Confirmation::Ack)) => {
                    metrics::counter!("task_queue_published_total").increment(1);
                    debug!(
                        attempts,
                        took_ms = started.elapsed().as_millis() as u64,
                        "消息发布已确认"
                    );
                    return Ok(());
                }
                Ok(Ok(Confirmation::Nack)) => {
                    metrics::counter!("task_queue_publish_nacked_total").increment(1);
                    warn!(attempts, "消息发布被Broker否定确认");
                    return Err(TaskClientError::PublishNacked);
                }
                Ok(Err(e)) => {
                    warn!(attempts, "等待发布确认时连接中断: {}", e);
                    if attempts >= self.publish_max_attempts {
                        metrics::counter!("task_queue_publish_failed_total").increment(1);
                        return Err(TaskClientError::Disconnected);
                    }
                    self.wait_for_reconnect().await?;
                }
                Err(_) => {
                    metrics::counter!("task_queue_confirm_timeouts_total").increment(1);
                    warn!(
                        attempts,
                        timeout_ms = self.confirm_timeout.as_millis() as u64,
                        "发布确认超时，重新发布..."
                    );
                    if attempts >= self.publish_max_attempts {
                        metrics::counter!("task_queue_publish_failed_total").increment(1);
                        return Err(TaskClientError::ConfirmTimeout { attempts });
                    }
                }
            }
        }
    }

    /// 只发布不等待确认，无法保证Broker一定收到消息
    pub async fn unsafe_push(&self, payload: &[u8]) -> TaskClientResult<()> {
        self.publish_once(payload).await.map(|_| ())
    }

    async fn publish_once(&self, payload: &[u8]) -> TaskClientResult<ConfirmFuture> {
        if !self.is_alive() || !self.is_connected() {
            return Err(TaskClientError::Disconnected);
        }

        let channel = self.current_channel().await?;
        channel.publish_persistent(&self.push_queue, payload).await
    }

    /// 等待重连完成，最多等待 `publish_reconnect_wait`
    async fn wait_for_reconnect(&self) -> TaskClientResult<()> {
        timeout(self.publish_reconnect_wait, self.wait_for_channel())
            .await
            .unwrap_or(Err(TaskClientError::Disconnected))
            .map(|_| ())
    }
}
