//! 扇出分发
//!
//! 私聊：投递给另一方的在线会话并持久化；对方不在线时触发推送。
//! 直播：在序列号通道内打序号、广播给所有会话（包括发送者）并持久化。
//! 持久化失败不阻塞投递，只上报数据丢失风险。

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use domain::{
    DeliveryStatus, Envelope, MessageId, Payload, PinnedRef, Scope, Sender, ServerFrame,
    StreamId, UserId,
};

use crate::clock::Clock;
use crate::collaborators::{PushNotifier, RelayObserver};
use crate::error::ApplicationError;
use crate::presence::PresenceTracker;
use crate::registry::{FanoutReport, SessionRegistry};
use crate::repository::EnvelopeStore;
use crate::sequencer::Sequencer;

/// 待分发的信封草稿，序列号和时间戳由分发器填写
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeDraft {
    pub id: MessageId,
    pub scope: Scope,
    pub sender: Option<Sender>,
    pub receiver: Option<UserId>,
    pub delivery_status: Option<DeliveryStatus>,
    pub payload: Payload,
}

impl EnvelopeDraft {
    pub fn new(scope: Scope, payload: Payload) -> Self {
        Self {
            id: MessageId::new_v4(),
            scope,
            sender: None,
            receiver: None,
            delivery_status: None,
            payload,
        }
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    pub fn from_sender(mut self, sender: Sender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn to(mut self, receiver: UserId) -> Self {
        self.receiver = Some(receiver);
        self
    }

    pub fn with_status(mut self, status: DeliveryStatus) -> Self {
        self.delivery_status = Some(status);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Dispatched {
    pub envelope: Arc<Envelope>,
    /// 成功入队的会话数
    pub delivered: usize,
    pub persisted: bool,
}

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Accepted(Dispatched),
    /// 同一消息 ID 已经分发过，未重新打序号或广播
    Duplicate(MessageId),
}

impl DispatchOutcome {
    pub fn delivered(&self) -> usize {
        match self {
            DispatchOutcome::Accepted(dispatched) => dispatched.delivered,
            DispatchOutcome::Duplicate(_) => 0,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, DispatchOutcome::Duplicate(_))
    }

    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            DispatchOutcome::Accepted(dispatched) => Some(&dispatched.envelope),
            DispatchOutcome::Duplicate(_) => None,
        }
    }
}

/// 最近分发过的消息 ID，容量满时淘汰最早的
struct RecentIds {
    capacity: usize,
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// 首次出现返回 true
    fn insert(&mut self, id: MessageId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

pub struct FanoutDispatcher {
    registry: Arc<SessionRegistry>,
    sequencer: Arc<Sequencer>,
    store: Arc<dyn EnvelopeStore>,
    presence: Arc<dyn PresenceTracker>,
    push: Arc<dyn PushNotifier>,
    observer: Arc<dyn RelayObserver>,
    clock: Arc<dyn Clock>,
    recent: Mutex<RecentIds>,
}

impl FanoutDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SessionRegistry>,
        sequencer: Arc<Sequencer>,
        store: Arc<dyn EnvelopeStore>,
        presence: Arc<dyn PresenceTracker>,
        push: Arc<dyn PushNotifier>,
        observer: Arc<dyn RelayObserver>,
        clock: Arc<dyn Clock>,
        dedup_capacity: usize,
    ) -> Self {
        Self {
            registry,
            sequencer,
            store,
            presence,
            push,
            observer,
            clock,
            recent: Mutex::new(RecentIds::new(dedup_capacity)),
        }
    }

    fn remember(&self, id: MessageId) -> bool {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id)
    }

    pub async fn dispatch(&self, draft: EnvelopeDraft) -> Result<DispatchOutcome, ApplicationError> {
        match draft.scope {
            Scope::Live(stream) => self.dispatch_live(stream, draft).await,
            Scope::Private(_) => self.dispatch_private(draft).await,
        }
    }

    /// 直播间观众数，在线人数服务不可用时退回本地计数
    pub async fn viewer_count(&self, stream: StreamId) -> u32 {
        match self.presence.viewer_count(stream).await {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(stream_id = %stream, error = %err, "presence unavailable, using local viewer count");
                self.registry.viewer_count(&Scope::Live(stream))
            }
        }
    }

    async fn dispatch_live(
        &self,
        stream: StreamId,
        draft: EnvelopeDraft,
    ) -> Result<DispatchOutcome, ApplicationError> {
        let mut lane = self.sequencer.acquire(stream).await?;

        let durable = draft.payload.is_durable();
        if durable && !self.remember(draft.id) {
            tracing::debug!(message_id = %draft.id, stream_id = %stream, "duplicate live envelope ignored");
            return Ok(DispatchOutcome::Duplicate(draft.id));
        }

        let viewer_count = self.viewer_count(stream).await;
        let seq = draft.payload.is_sequenced().then(|| lane.next());
        let envelope = Envelope {
            id: draft.id,
            scope: draft.scope,
            sender: draft.sender,
            receiver: None,
            created_at: self.clock.now(),
            seq,
            viewer_count: Some(viewer_count),
            delivery_status: None,
            payload: draft.payload,
        };

        if let Payload::Pin(change) = &envelope.payload {
            let pinned = match (change.pinned, envelope.sender_id()) {
                (true, Some(by)) => Some(PinnedRef {
                    message_id: change.target,
                    content: change.content.clone(),
                    pinned_by: by,
                    pinned_at: envelope.created_at,
                    seq: envelope.seq,
                }),
                _ => None,
            };
            self.registry.set_pinned(&envelope.scope, pinned);
        }

        let envelope = Arc::new(envelope);
        let report = self.broadcast(&envelope, |_| true);

        // 在通道内持久化，保证重连时读到的高水位之前的信封都已落盘
        let persisted = durable && self.persist(&envelope).await;
        drop(lane);

        tracing::debug!(
            stream_id = %stream,
            seq = ?envelope.seq,
            event = envelope.event_type().as_str(),
            delivered = report.delivered,
            "live envelope dispatched"
        );
        Ok(DispatchOutcome::Accepted(Dispatched {
            envelope,
            delivered: report.delivered,
            persisted,
        }))
    }

    async fn dispatch_private(&self, draft: EnvelopeDraft) -> Result<DispatchOutcome, ApplicationError> {
        let durable = draft.payload.is_durable();
        if durable && !self.remember(draft.id) {
            tracing::debug!(message_id = %draft.id, scope = %draft.scope, "duplicate private envelope ignored");
            return Ok(DispatchOutcome::Duplicate(draft.id));
        }

        let envelope = Arc::new(Envelope {
            id: draft.id,
            scope: draft.scope,
            sender: draft.sender,
            receiver: draft.receiver,
            created_at: self.clock.now(),
            seq: None,
            viewer_count: None,
            delivery_status: draft
                .delivery_status
                .or(durable.then_some(DeliveryStatus::Sent)),
            payload: draft.payload,
        });

        let sender = envelope.sender_id();
        let receiver = envelope.receiver;
        let report = self.broadcast(&envelope, |info| {
            let user = info.identity.user_id;
            Some(user) != sender && receiver.map_or(true, |r| r == user)
        });

        let persisted = durable && self.persist(&envelope).await;

        if durable && report.delivered == 0 {
            if let Some(recipient) = receiver {
                if let Err(err) = self.push.notify_undelivered(recipient, &envelope).await {
                    tracing::warn!(recipient = %recipient, message_id = %envelope.id, error = %err, "push notification failed");
                }
            }
        }

        Ok(DispatchOutcome::Accepted(Dispatched {
            envelope,
            delivered: report.delivered,
            persisted,
        }))
    }

    fn broadcast<F>(&self, envelope: &Arc<Envelope>, include: F) -> FanoutReport
    where
        F: FnMut(&crate::registry::SessionInfo) -> bool,
    {
        let frame = Arc::new(ServerFrame::Envelope(envelope.as_ref().clone()));
        let report = self.registry.fan_out(&envelope.scope, frame, include);
        if report.dropped > 0 {
            self.observer.outbox_overflow(envelope.scope);
        }
        report
    }

    async fn persist(&self, envelope: &Envelope) -> bool {
        match self.store.persist(envelope).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(message_id = %envelope.id, scope = %envelope.scope, error = %err, "failed to persist envelope");
                self.observer.data_loss_risk(envelope, &err);
                false
            }
        }
    }
}
