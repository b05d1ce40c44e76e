use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tenant_core::{OverflowPolicy, RelayConfig};
use tokio::sync::Notify;
use tracing::warn;

/// 一次转发的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Queued,
    /// 队列已满，最早的一条消息被丢弃
    DroppedOldest,
    /// 队列已满，本条消息被丢弃
    DroppedNewest,
    Closed,
}

/// 消费者与 websocket 中继之间的有界转发队列
///
/// 发送端永不阻塞，队列满时按 [`OverflowPolicy`] 丢弃消息，因此慢速的中继
/// 不会拖慢消息确认。每条消息只会被一个接收者取走一次。
#[derive(Clone)]
pub struct MessageRelay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    buffer: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    policy: OverflowPolicy,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl MessageRelay {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(RelayInner {
                buffer: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                policy,
                notify: Notify::new(),
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.capacity, config.overflow)
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.inner.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 非阻塞地转发一条原始消息
    pub fn send(&self, payload: Vec<u8>) -> RelayOutcome {
        if self.inner.closed.load(Ordering::Acquire) {
            return RelayOutcome::Closed;
        }

        let outcome = {
            let mut buffer = self.buffer();
            if buffer.len() < self.inner.capacity {
                buffer.push_back(payload);
                RelayOutcome::Queued
            } else {
                match self.inner.policy {
                    OverflowPolicy::DropOldest => {
                        buffer.pop_front();
                        buffer.push_back(payload);
                        RelayOutcome::DroppedOldest
                    }
                    OverflowPolicy::DropNewest => RelayOutcome::DroppedNewest,
                }
            }
        };

        match outcome {
            RelayOutcome::Queued => {}
            _ => {
                let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::counter!("task_queue_relay_dropped_total").increment(1);
                warn!(
                    capacity = self.inner.capacity,
                    dropped_total = total,
                    "转发队列已满，丢弃消息: {:?}",
                    outcome
                );
            }
        }

        if outcome != RelayOutcome::DroppedNewest {
            self.inner.notify.notify_one();
        }
        outcome
    }

    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.buffer().pop_front()
    }

    /// 等待下一条消息；转发队列关闭且已取空时返回 `None`
    pub async fn recv(&self) -> Option<Vec<u8>> {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(payload) = self.try_recv() {
                return Some(payload);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// 关闭后不再接收新消息，已缓存的消息仍可取出
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.buffer().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}
