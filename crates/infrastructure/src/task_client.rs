//! 任务客户端门面
//!
//! HTTP 处理器通过 [`TaskClient`] 上报异步工作的进展。任务状态的每一次变化都会作为
//! 一条新消息发布，消费方根据任务ID把多条消息合并为最新状态。

use std::sync::Arc;

use async_trait::async_trait;
use tenant_core::{Task, TaskClientResult, TaskStatus};
use tracing::{debug, info};

use crate::amqp_client::AmqpClient;

/// 发布原始消息的能力
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskPublisher: Send + Sync {
    /// 发布并等待Broker确认
    async fn push(&self, payload: &[u8]) -> TaskClientResult<()>;
}

#[async_trait]
impl TaskPublisher for AmqpClient {
    async fn push(&self, payload: &[u8]) -> TaskClientResult<()> {
        AmqpClient::push(self, payload).await
    }
}

#[derive(Clone)]
pub struct TaskClient {
    publisher: Arc<dyn TaskPublisher>,
}

impl TaskClient {
    pub fn new(publisher: Arc<dyn TaskPublisher>) -> Self {
        Self { publisher }
    }

    /// 创建一个新任务，不会发布
    pub fn create_task(&self, tags: Vec<String>, description: impl Into<String>) -> Task {
        let task = Task::new(tags, description);
        debug!(task_id = %task.id, "创建任务: {}", task.description);
        task
    }

    pub async fn push_task(&self, task: &Task) -> TaskClientResult<()> {
        let payload = task.encode()?;
        self.publisher.push(&payload).await?;

        info!(
            task_id = %task.id,
            status = %task.status,
            progress = task.progress,
            "任务已发布: {}",
            task.description
        );
        Ok(())
    }

    /// 以 completed 状态重新发布任务，返回发布的副本，进度保持不变
    pub async fn complete_task(&self, task: &Task) -> TaskClientResult<Task> {
        self.publish_transition(task.with_status(TaskStatus::Completed))
            .await
    }

    pub async fn start_task(&self, task: &Task) -> TaskClientResult<Task> {
        self.publish_transition(task.with_status(TaskStatus::Running))
            .await
    }

    /// 以 running 状态上报进度，进度被限制在 [0, 1]
    pub async fn report_progress(&self, task: &Task, progress: f32) -> TaskClientResult<Task> {
        self.publish_transition(
            task.with_status(TaskStatus::Running)
                .with_progress(progress),
        )
        .await
    }

    pub async fn fail_task(&self, task: &Task) -> TaskClientResult<Task> {
        self.publish_transition(task.with_status(TaskStatus::Failed))
            .await
    }

    async fn publish_transition(&self, next: Task) -> TaskClientResult<Task> {
        self.push_task(&next).await?;
        Ok(next)
    }
}
