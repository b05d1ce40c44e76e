use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tenant_core::{TaskClientError, TaskClientResult};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};

/// 结算记录和拨号记录保留的最近条目数
pub const HISTORY_CAPACITY: usize = 1024;

use super::{
    Broker, BrokerChannel, BrokerConnection, ConfirmFuture, Confirmation, Delivery,
    DeliveryStream,
};

/// 内存Broker对发布的确认方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmBehavior {
    #[default]
    Ack,
    Nack,
    /// 永远不确认，直到通道关闭
    Silent,
}

/// 内存消息Broker实现
///
/// 在进程内模拟 AMQP 语义: 持久化队列、默认交换机路由、手动确认、按消费者的预取限制、
/// 发布确认，以及 Broker 主动断开连接。适用于嵌入式部署和测试场景，
/// 并提供用于检查内部状态的辅助方法。
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    confirm_behavior: ConfirmBehavior,
    dial_attempts: History<Instant>,
    next_id: u64,
    queues: HashMap<String, QueueState>,
    // 只保存打开中的连接和通道，关闭时移除
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    acked: History<Vec<u8>>,
    nacked: History<(Vec<u8>, bool)>,
    rejected: History<(Vec<u8>, bool)>,
}

/// 只保留最近 `HISTORY_CAPACITY` 条的记录，同时统计总数
struct History<T> {
    recent: VecDeque<T>,
    total: u64,
}

impl<T> Default for History<T> {
    fn default() -> Self {
        Self {
            recent: VecDeque::new(),
            total: 0,
        }
    }
}

impl<T: Clone> History<T> {
    fn push(&mut self, item: T) {
        if self.recent.len() == HISTORY_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back(item);
        self.total += 1;
    }

    fn snapshot(&self) -> Vec<T> {
        self.recent.iter().cloned().collect()
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueuedMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

struct QueuedMessage {
    body: Vec<u8>,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    channel_id: u64,
    in_flight: usize,
    sender: mpsc::UnboundedSender<TaskClientResult<Delivery>>,
}

struct ConnectionState {
    close_notifiers: Vec<oneshot::Sender<String>>,
}

struct ChannelState {
    connection_id: u64,
    confirms: bool,
    prefetch: u16,
    next_delivery_tag: u64,
    unacked: HashMap<u64, Unacked>,
    pending_confirms: Vec<oneshot::Sender<Confirmation>>,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    body: Vec<u8>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel_id: u64) -> bool {
        self.channels.contains_key(&channel_id)
    }

    fn enqueue(&mut self, queue: &str, body: Vec<u8>, redelivered: bool) {
        if let Some(q) = self.queues.get_mut(queue) {
            q.ready.push_back(QueuedMessage { body, redelivered });
            self.dispatch(queue);
        } else {
            debug!("队列 {} 不存在，消息被丢弃", queue);
        }
    }

    /// 按轮询方式把就绪消息投递给未达到预取上限的消费者
    fn dispatch(&mut self, queue: &str) {
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };

        while !q.ready.is_empty() && !q.consumers.is_empty() {
            let count = q.consumers.len();
            let mut chosen = None;
            for offset in 0..count {
                let idx = (q.cursor + offset) % count;
                let slot = &q.consumers[idx];
                let prefetch = self
                    .channels
                    .get(&slot.channel_id)
                    .map(|c| c.prefetch)
                    .unwrap_or(0);
                if prefetch == 0 || slot.in_flight < prefetch as usize {
                    chosen = Some(idx);
                    break;
                }
            }

            let Some(idx) = chosen else {
                break;
            };
            q.cursor = (idx + 1) % count;

            let Some(message) = q.ready.pop_front() else {
                break;
            };
            let slot = &mut q.consumers[idx];
            let Some(channel) = self.channels.get_mut(&slot.channel_id) else {
                q.ready.push_front(message);
                break;
            };

            channel.next_delivery_tag += 1;
            let delivery_tag = channel.next_delivery_tag;
            channel.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue.to_string(),
                    consumer_tag: slot.tag.clone(),
                    body: message.body.clone(),
                },
            );
            slot.in_flight += 1;

            let delivery = Delivery {
                delivery_tag,
                body: message.body,
                redelivered: message.redelivered,
            };
            if slot.sender.send(Ok(delivery)).is_err() {
                // 消费端已经丢弃了消息流，视为取消
                if let Some(unacked) = channel.unacked.remove(&delivery_tag) {
                    q.ready.push_front(QueuedMessage {
                        body: unacked.body,
                        redelivered: true,
                    });
                }
                q.consumers.remove(idx);
                q.cursor = 0;
            }
        }
    }

    /// 结算一条未确认消息，返回消息体
    fn settle(&mut self, channel_id: u64, delivery_tag: u64) -> TaskClientResult<Unacked> {
        let channel = self
            .channels
            .get_mut(&channel_id)
            .ok_or(TaskClientError::Disconnected)?;
        let unacked = channel.unacked.remove(&delivery_tag).ok_or_else(|| {
            TaskClientError::MessageQueue(format!("未知的投递标签: {delivery_tag}"))
        })?;

        if let Some(q) = self.queues.get_mut(&unacked.queue) {
            if let Some(slot) = q
                .consumers
                .iter_mut()
                .find(|s| s.channel_id == channel_id && s.tag == unacked.consumer_tag)
            {
                slot.in_flight = slot.in_flight.saturating_sub(1);
            }
        }
        Ok(unacked)
    }

    /// 关闭通道: 取消其消费者，未确认消息重新入队，挂起的发布确认全部失败
    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return;
        };
        // 丢弃挂起的确认发送端，等待方收到 Disconnected
        drop(channel.pending_confirms);
        let unacked: Vec<Unacked> = channel.unacked.into_values().collect();

        for q in self.queues.values_mut() {
            q.consumers.retain(|slot| slot.channel_id != channel_id);
            q.cursor = 0;
        }

        let mut touched = Vec::new();
        for message in unacked {
            if let Some(q) = self.queues.get_mut(&message.queue) {
                q.ready.push_front(QueuedMessage {
                    body: message.body,
                    redelivered: true,
                });
                touched.push(message.queue);
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, connection_id: u64, reason: Option<&str>) {
        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for id in channel_ids {
            self.close_channel(id);
        }

        if let Some(connection) = self.connections.remove(&connection_id) {
            for notifier in connection.close_notifiers {
                if let Some(reason) = reason {
                    let _ = notifier.send(reason.to_string());
                }
            }
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 模拟Broker不可达，拨号将失败
    pub fn set_reachable(&self, reachable: bool) {
        self.state().unreachable = !reachable;
    }

    pub fn set_confirm_behavior(&self, behavior: ConfirmBehavior) {
        self.state().confirm_behavior = behavior;
    }

    /// 模拟Broker重启: 断开所有连接并发送关闭通知
    pub fn sever_connections(&self, reason: &str) {
        let mut state = self.state();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in &ids {
            state.close_connection(*id, Some(reason));
        }
        info!("内存Broker断开了 {} 个连接: {}", ids.len(), reason);
    }

    /// 以外部生产者身份向队列投递一条消息，队列不存在时自动声明
    pub fn inject(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let mut state = self.state();
        state.queues.entry(queue.to_string()).or_default();
        state.enqueue(queue, body.into(), false);
    }

    /// 最近的拨号时间
    pub fn dial_attempts(&self) -> Vec<Instant> {
        self.state().dial_attempts.snapshot()
    }

    pub fn open_connections(&self) -> usize {
        self.state().connections.len()
    }

    pub fn open_channels(&self) -> usize {
        self.state().channels.len()
    }

    pub fn declared_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// 队列中尚未投递的消息
    pub fn ready_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|s| s.tag.clone()).collect())
            .unwrap_or_default()
    }

    pub fn unacked_count(&self) -> usize {
        self.state()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    /// 最近确认的消息体
    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.state().acked.snapshot()
    }

    pub fn acked_total(&self) -> u64 {
        self.state().acked.total
    }

    /// 最近否定确认的 (消息体, 是否重新入队)
    pub fn nacked(&self) -> Vec<(Vec<u8>, bool)> {
        self.state().nacked.snapshot()
    }

    /// 最近拒绝的 (消息体, 是否重新入队)
    pub fn rejected(&self) -> Vec<(Vec<u8>, bool)> {
        self.state().rejected.snapshot()
    }

    /// 所有打开通道上设置过的预取数量
    pub fn prefetch_counts(&self) -> Vec<u16> {
        self.state()
            .channels
            .values()
            .map(|c| c.prefetch)
            .collect()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn dial(&self, address: &str) -> TaskClientResult<Arc<dyn BrokerConnection>> {
        let mut state = self.state();
        state.dial_attempts.push(Instant::now());

        if state.unreachable {
            return Err(TaskClientError::MessageQueue(format!(
                "连接内存Broker失败: {address} 不可达"
            )));
        }

        let id = state.next_id();
        state.connections.insert(
            id,
            ConnectionState {
                close_notifiers: Vec::new(),
            },
        );

        Ok(Arc::new(InMemoryConnection {
            id,
            broker: self.clone(),
        }))
    }
}

struct InMemoryConnection {
    id: u64,
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn create_channel(&self) -> TaskClientResult<Arc<dyn BrokerChannel>> {
        let mut state = self.broker.state();
        if !state.connections.contains_key(&self.id) {
            return Err(TaskClientError::Disconnected);
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                confirms: false,
                prefetch: 0,
                next_delivery_tag: 0,
                unacked: HashMap::new(),
                pending_confirms: Vec::new(),
            },
        );

        Ok(Arc::new(InMemoryChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    fn notify_close(&self) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.broker.state();
        match state.connections.get_mut(&self.id) {
            Some(connection) => connection.close_notifiers.push(tx),
            None => {
                let _ = tx.send("连接已关闭".to_string());
            }
        }
        rx
    }

    fn is_open(&self) -> bool {
        self.broker.state().connections.contains_key(&self.id)
    }

    async fn close(&self) -> TaskClientResult<()> {
        self.broker.state().close_connection(self.id, None);
        Ok(())
    }
}

struct InMemoryChannel {
    id: u64,
    broker: InMemoryBroker,
}

impl InMemoryChannel {
    fn ensure_open(&self, state: &BrokerState) -> TaskClientResult<()> {
        if state.channel_open(self.id) {
            Ok(())
        } else {
            Err(TaskClientError::Disconnected)
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn enable_publisher_confirms(&self) -> TaskClientResult<()> {
        let mut state = self.broker.state();
        self.ensure_open(&state)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.confirms = true;
        }
        Ok(())
    }

    async fn declare_durable_queue(&self, queue: &str) -> TaskClientResult<()> {
        let mut state = self.broker.state();
        self.ensure_open(&state)?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish_persistent(
        &self,
        queue: &str,
        payload: &[u8],
    ) -> TaskClientResult<ConfirmFuture> {
        let mut state = self.broker.state();
        self.ensure_open(&state)?;

        let behavior = state.confirm_behavior;
        let confirms = state
            .channels
            .get(&self.id)
            .is_some_and(|c| c.confirms);

        state.enqueue(queue, payload.to_vec(), false);

        if !confirms {
            return Ok(futures::future::ready(Ok(Confirmation::Ack)).boxed());
        }

        match behavior {
            ConfirmBehavior::Ack => Ok(futures::future::ready(Ok(Confirmation::Ack)).boxed()),
            ConfirmBehavior::Nack => Ok(futures::future::ready(Ok(Confirmation::Nack)).boxed()),
            ConfirmBehavior::Silent => {
                let (tx, rx) = oneshot::channel();
                if let Some(channel) = state.channels.get_mut(&self.id) {
                    channel.pending_confirms.push(tx);
                }
                Ok(rx.map(|r| r.map_err(|_| TaskClientError::Disconnected)).boxed())
            }
        }
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> TaskClientResult<()> {
        let mut state = self.broker.state();
        self.ensure_open(&state)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> TaskClientResult<DeliveryStream> {
        let mut state = self.broker.state();
        self.ensure_open(&state)?;

        let q = state.queues.get_mut(queue).ok_or_else(|| {
            TaskClientError::MessageQueue(format!("队列 {queue} 不存在"))
        })?;
        if q.consumers.iter().any(|s| s.tag == consumer_tag) {
            return Err(TaskClientError::MessageQueue(format!(
                "消费者标签 {consumer_tag} 已被使用"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        q.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_string(),
            channel_id: self.id,
            in_flight: 0,
            sender: tx,
        });
        state.dispatch(queue);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> TaskClientResult<()> {
        let mut state = self.broker.state();
        let unacked = state.settle(self.id, delivery_tag)?;
        state.acked.push(unacked.body);
        state.dispatch(&unacked.queue);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> TaskClientResult<()> {
        let mut state = self.broker.state();
        let unacked = state.settle(self.id, delivery_tag)?;
        state.nacked.push((unacked.body.clone(), requeue));
        if requeue {
            state.enqueue(&unacked.queue, unacked.body, true);
        } else {
            state.dispatch(&unacked.queue);
        }
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> TaskClientResult<()> {
        let mut state = self.broker.state();
        let unacked = state.settle(self.id, delivery_tag)?;
        state.rejected.push((unacked.body.clone(), requeue));
        if requeue {
            state.enqueue(&unacked.queue, unacked.body, true);
        } else {
            state.dispatch(&unacked.queue);
        }
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> TaskClientResult<()> {
        let mut state = self.broker.state();
        self.ensure_open(&state)?;
        for q in state.queues.values_mut() {
            q.consumers
                .retain(|s| !(s.channel_id == self.id && s.tag == consumer_tag));
            q.cursor = 0;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.state().channel_open(self.id)
    }

    async fn close(&self) -> TaskClientResult<()> {
        self.broker.state().close_channel(self.id);
        Ok(())
    }
}
