//! 按键广播通道（Channel）
//!
//! 每个总线持有一个通道：
//! - 每个订阅者拥有独立的无界队列，发送方永远不会被慢订阅者阻塞；
//! - 回放策略为 0 或 1：`ReplayPolicy::Last` 时新订阅者先收到最近一次投递的值；
//! - 活跃订阅者数量通过 `watch` 推送，总线据此在数量归零时立即判定是否回收。
//!
//! 同一通道上的 `post` 在锁内完成扇出，因此同一订阅者看到的顺序与入队顺序一致。
//!
use futures_core::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};

/// 回放策略
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayPolicy {
    /// 只投递订阅之后的值
    None,
    /// 新订阅者先收到最近一次的值
    Last,
}

/// 通道内订阅的标识
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct ChannelState<T> {
    next_id: u64,
    subscribers: HashMap<SubscriptionId, mpsc::UnboundedSender<T>>,
    last: Option<T>,
}

struct ChannelInner<T> {
    replay: ReplayPolicy,
    state: Mutex<ChannelState<T>>,
    count: watch::Sender<usize>,
}

impl<T> ChannelInner<T> {
    fn lock(&self) -> MutexGuard<'_, ChannelState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn detach(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let removed = state.subscribers.remove(&id).is_some();
        if removed {
            self.count.send_replace(state.subscribers.len());
        }
        removed
    }
}

/// 带 0/1 回放的无界广播通道
pub struct Channel<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Channel<T> {
    pub fn new(replay: ReplayPolicy) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(ChannelInner {
                replay,
                state: Mutex::new(ChannelState {
                    next_id: 0,
                    subscribers: HashMap::new(),
                    last: None,
                }),
                count,
            }),
        }
    }

    pub fn replay(&self) -> ReplayPolicy {
        self.inner.replay
    }

    /// 向当前所有订阅者入队；`Last` 策略下同时覆盖回放槽
    pub fn post(&self, value: T) {
        let mut state = self.inner.lock();
        for tx in state.subscribers.values() {
            // 接收端关闭时会在 Drop 中先行摘除，这里的失败可以忽略
            let _ = tx.send(value.clone());
        }
        if self.inner.replay == ReplayPolicy::Last {
            state.last = Some(value);
        }
    }

    /// 新增订阅者，`Last` 策略下回放值是它收到的第一个元素
    pub fn subscribe(&self) -> ChannelReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock();
        if let Some(last) = state.last.as_ref() {
            let _ = tx.send(last.clone());
        }
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        state.subscribers.insert(id, tx);
        self.inner.count.send_replace(state.subscribers.len());
        drop(state);

        ChannelReceiver {
            id,
            rx,
            channel: self.inner.clone(),
        }
    }

    /// 摘除订阅者；重复调用无副作用
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.detach(id)
    }

    /// 摘除全部订阅者并清空回放槽，所有接收端随后读到结束
    pub fn close(&self) {
        let mut state = self.inner.lock();
        state.subscribers.clear();
        state.last = None;
        self.inner.count.send_replace(0);
    }

    pub fn subscriber_count(&self) -> usize {
        *self.inner.count.borrow()
    }

    /// 订阅者数量的推送流
    pub fn watch_subscribers(&self) -> watch::Receiver<usize> {
        self.inner.count.subscribe()
    }

    pub fn last_value(&self) -> Option<T> {
        self.inner.lock().last.clone()
    }

    pub fn has_last_value(&self) -> bool {
        self.inner.lock().last.is_some()
    }
}

/// 订阅者的接收端，Drop 时自动退订
pub struct ChannelReceiver<T> {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<T>,
    channel: Arc<ChannelInner<T>>,
}

impl<T> ChannelReceiver<T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// 通道关闭或本订阅被摘除且积压耗尽后返回 `None`
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Stream for ChannelReceiver<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<T> Drop for ChannelReceiver<T> {
    fn drop(&mut self) {
        self.channel.detach(self.id);
    }
}
