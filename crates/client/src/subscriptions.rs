//! 订阅表
//!
//! 以事件类型或会话范围为键登记订阅者。每个订阅返回一个 `Subscription`，
//! 丢弃即取消订阅。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use domain::{EventType, Scope, ServerFrame, DELIVERY_STATUS_EVENT, ERROR_EVENT};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// 线协议中的 `type`，包括 `delivery_status` 与 `error`
    Event(String),
    Scope(Scope),
}

impl Topic {
    pub fn event(event: EventType) -> Self {
        Topic::Event(event.as_str().to_string())
    }

    pub fn delivery_status() -> Self {
        Topic::Event(DELIVERY_STATUS_EVENT.to_string())
    }

    pub fn errors() -> Self {
        Topic::Event(ERROR_EVENT.to_string())
    }
}

type Subscribers = HashMap<Topic, Vec<(u64, mpsc::UnboundedSender<Arc<ServerFrame>>)>>;

#[derive(Default)]
struct TableInner {
    next_id: AtomicU64,
    subscribers: Mutex<Subscribers>,
}

impl TableInner {
    fn remove(&self, topic: &Topic, id: u64) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = subscribers.get_mut(topic) {
            list.retain(|(existing, _)| *existing != id);
            if list.is_empty() {
                subscribers.remove(topic);
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct SubscriberTable {
    inner: Arc<TableInner>,
}

impl SubscriberTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.clone())
            .or_default()
            .push((id, tx));

        Subscription {
            id,
            topic,
            frames: rx,
            table: Arc::downgrade(&self.inner),
        }
    }

    /// 按类型分发，带范围的帧再分发给该范围的订阅者，返回投递次数
    pub fn publish(&self, frame: ServerFrame) -> usize {
        let frame = Arc::new(frame);
        let mut topics = vec![Topic::Event(frame.event_name().to_string())];
        if let Some(scope) = frame.scope() {
            topics.push(Topic::Scope(scope));
        }

        let subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        topics
            .iter()
            .filter_map(|topic| subscribers.get(topic))
            .flatten()
            .filter(|(_, tx)| tx.send(frame.clone()).is_ok())
            .count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }
}

/// 订阅句柄
pub struct Subscription {
    id: u64,
    topic: Topic,
    frames: mpsc::UnboundedReceiver<Arc<ServerFrame>>,
    table: Weak<TableInner>,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<Arc<ServerFrame>> {
        self.frames.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<ServerFrame>> {
        self.frames.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.remove(&self.topic, self.id);
        }
    }
}
