use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tenant_core::{AppConfig, Task};
use tenant_infrastructure::{AmqpClient, Broker, BrokerFactory, MessageRelay, TaskClient};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 消费意外中断后重新开始前的等待时间
const STREAM_RESTART_DELAY: Duration = Duration::from_secs(1);

/// 主应用程序
pub struct Application {
    config: AppConfig,
    client: Arc<AmqpClient>,
    tasks: TaskClient,
}

impl Application {
    /// 根据配置选择Broker驱动创建应用
    pub fn new(config: AppConfig) -> Result<Self> {
        let broker = BrokerFactory::create(&config.message_queue).context("创建Broker驱动失败")?;
        Ok(Self::with_broker(config, broker))
    }

    pub fn with_broker(config: AppConfig, broker: Arc<dyn Broker>) -> Self {
        info!(
            listen_queue = %config.message_queue.listen_queue,
            push_queue = %config.message_queue.push_queue,
            "初始化应用程序"
        );

        let relay = MessageRelay::from_config(&config.relay);
        let client = AmqpClient::new(broker, &config.message_queue, relay);
        let tasks = TaskClient::new(client.clone());

        Self {
            config,
            client,
            tasks,
        }
    }

    pub fn client(&self) -> &Arc<AmqpClient> {
        &self.client
    }

    pub fn tasks(&self) -> &TaskClient {
        &self.tasks
    }

    /// 持续消费任务状态事件，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.client.start().await;

        let cancel = CancellationToken::new();
        let consumer_handle = {
            let client = Arc::clone(&self.client);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_consumer_loop(client, cancel).await;
            })
        };

        let forwarder_handle = {
            let relay = self.client.relay().clone();
            tokio::spawn(async move {
                run_relay_forwarder(relay).await;
            })
        };

        let _ = shutdown_rx.recv().await;
        info!("应用收到关闭信号");

        let close_result = self.client.close().await;
        cancel.cancel();
        self.client.relay().close();

        let _ = tokio::join!(consumer_handle, forwarder_handle);

        close_result.context("关闭RabbitMQ客户端失败")?;
        info!("应用已停止");
        Ok(())
    }

    /// 发布一个新任务，`complete` 为真时随后发布其完成状态
    pub async fn publish(
        &self,
        tags: Vec<String>,
        description: &str,
        complete: bool,
    ) -> Result<Task> {
        self.client.start().await;

        let wait = self.config.message_queue.publish_reconnect_wait();
        let connected = timeout(wait, self.client.wait_connected())
            .await
            .unwrap_or(false);
        if !connected {
            let _ = self.client.close().await;
            return Err(anyhow::anyhow!("在 {:?} 内未能连接到RabbitMQ", wait));
        }

        let result = self.publish_task(tags, description, complete).await;
        self.client.close().await.context("关闭RabbitMQ客户端失败")?;
        result
    }

    async fn publish_task(
        &self,
        tags: Vec<String>,
        description: &str,
        complete: bool,
    ) -> Result<Task> {
        let task = self.tasks.create_task(tags, description);
        self.tasks.push_task(&task).await.context("发布任务失败")?;

        if complete {
            return self
                .tasks
                .complete_task(&task)
                .await
                .context("发布任务完成状态失败");
        }
        Ok(task)
    }
}

/// 消费因断线中断时，等待重连后重新开始
async fn run_consumer_loop(client: Arc<AmqpClient>, cancel: CancellationToken) {
    loop {
        match client.stream(cancel.clone()).await {
            Ok(()) => break,
            Err(e) => {
                warn!("消费中断: {}，稍后重新开始", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(STREAM_RESTART_DELAY) => {}
                }
            }
        }
    }
    info!("消费循环已退出");
}

/// 把消费到的任务状态交给 websocket 中继
async fn run_relay_forwarder(relay: MessageRelay) {
    while let Some(body) = relay.recv().await {
        match Task::decode(&body) {
            Ok(task) => info!(
                task_id = %task.id,
                status = %task.status,
                progress = task.progress,
                "转发任务状态: {}",
                task.description
            ),
            Err(e) => error!("转发队列中出现无法解析的消息: {}", e),
        }
    }
    info!("转发队列已关闭");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenant_core::{MessageQueueConfig, MessageQueueType, TaskStatus};
    use tenant_infrastructure::{InMemoryBroker, LinkState};
    use tokio::time::Instant;

    fn in_memory_config() -> AppConfig {
        AppConfig {
            message_queue: MessageQueueConfig {
                r#type: MessageQueueType::InMemory,
                url: "memory://local".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn eventually(what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(60);
        while !condition() {
            assert!(Instant::now() < deadline, "等待超时: {what}");
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_new_with_in_memory_driver() {
        assert!(Application::new(in_memory_config()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_consumes_until_shutdown() {
        let broker = InMemoryBroker::new();
        let app = Arc::new(Application::with_broker(
            in_memory_config(),
            Arc::new(broker.clone()),
        ));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = {
            let app = Arc::clone(&app);
            tokio::spawn(async move { app.run(shutdown_rx).await })
        };

        let threads = app.client().threads();
        eventually("消费者注册", || {
            broker.consumer_tags("task_status").len() == threads
        })
        .await;

        let body = Task::new(vec!["tenant".into()], "Creating tenant X")
            .with_status(TaskStatus::Completed)
            .encode()
            .unwrap();
        broker.inject("task_status", body.clone());
        eventually("消息确认", || broker.acked() == vec![body.clone()]).await;

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(app.client().link_state(), LinkState::Stopped);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_restarts_stream_after_broker_restart() {
        let broker = InMemoryBroker::new();
        let app = Arc::new(Application::with_broker(
            in_memory_config(),
            Arc::new(broker.clone()),
        ));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = {
            let app = Arc::clone(&app);
            tokio::spawn(async move { app.run(shutdown_rx).await })
        };

        let threads = app.client().threads();
        eventually("消费者注册", || {
            broker.consumer_tags("task_status").len() == threads
        })
        .await;

        broker.sever_connections("broker restart");
        eventually("重新注册消费者", || {
            broker.dial_attempts().len() == 2
                && broker.consumer_tags("task_status").len() == threads
        })
        .await;

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_and_complete() {
        let broker = InMemoryBroker::new();
        let app = Application::with_broker(in_memory_config(), Arc::new(broker.clone()));

        let task = app
            .publish(vec!["create".into()], "Creating tenant X", true)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);

        let published: Vec<Task> = broker
            .ready_messages("task_queue")
            .iter()
            .map(|body| Task::decode(body).unwrap())
            .collect();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].status, TaskStatus::Waiting);
        assert_eq!(published[1], task);
        assert_eq!(app.client().link_state(), LinkState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_fails_when_broker_unreachable() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let mut config = in_memory_config();
        config.message_queue.publish_reconnect_wait_seconds = 3;
        let app = Application::with_broker(config, Arc::new(broker.clone()));

        let err = app
            .publish(vec![], "Creating tenant X", false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("未能连接"));
        assert!(broker.ready_messages("task_queue").is_empty());
    }
}
