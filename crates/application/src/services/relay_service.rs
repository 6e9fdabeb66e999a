use std::sync::Arc;
use std::time::Duration;

use config::RelaySettings;
use domain::{
    ClientAction, DeliveryStatus, Envelope, Identity, MatchId, MatchParticipants, MessageId,
    Payload, PinnedRef, Role, Scope, Sender, ServerFrame, SessionId, StreamId, Timestamp,
};
use tokio::sync::mpsc;

use crate::clock::{Clock, SystemClock};
use crate::collaborators::{
    AcceptAllGifts, GiftLedger, NoopPushNotifier, PushNotifier, RelayObserver, TracingObserver,
};
use crate::directory::AccessDirectory;
use crate::dispatcher::{DispatchOutcome, EnvelopeDraft, FanoutDispatcher};
use crate::error::ApplicationError;
use crate::moderation::ModerationGate;
use crate::presence::{memory::MemoryPresenceTracker, PresenceTracker};
use crate::rate_limiter::LiveRateLimiter;
use crate::registry::{PresencePolicy, SessionInfo, SessionRegistry};
use crate::repository::{memory::MemoryEnvelopeStore, EnvelopeStore};
use crate::router::{HandshakeParams, ScopeRouter};
use crate::sequencer::{ReplayStream, Sequencer};

/// 历史查询单页上限
const MAX_HISTORY_PAGE: usize = 200;

#[derive(Clone)]
pub struct RelayServiceDependencies {
    pub directory: Arc<dyn AccessDirectory>,
    pub store: Arc<dyn EnvelopeStore>,
    pub presence: Arc<dyn PresenceTracker>,
    pub push: Arc<dyn PushNotifier>,
    pub gifts: Arc<dyn GiftLedger>,
    pub observer: Arc<dyn RelayObserver>,
    pub clock: Arc<dyn Clock>,
    pub settings: RelaySettings,
}

impl RelayServiceDependencies {
    /// 除访问目录外全部使用进程内实现
    pub fn in_memory(directory: Arc<dyn AccessDirectory>) -> Self {
        Self {
            directory,
            store: Arc::new(MemoryEnvelopeStore::new()),
            presence: Arc::new(MemoryPresenceTracker::new()),
            push: Arc::new(NoopPushNotifier),
            gifts: Arc::new(AcceptAllGifts),
            observer: Arc::new(TracingObserver),
            clock: Arc::new(SystemClock),
            settings: RelaySettings::default(),
        }
    }
}

/// 握手成功后的连接
pub struct Connection {
    pub session: Arc<SessionInfo>,
    /// 会话出站队列
    pub outbox: mpsc::Receiver<Arc<ServerFrame>>,
    /// 直播重连时需要先于出站队列发送的重放流
    pub replay: Option<ReplayStream>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session", &self.session)
            .field("replay", &self.replay.is_some())
            .finish()
    }
}

/// 私聊消息被接受后的送达状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub message_id: MessageId,
    pub status: DeliveryStatus,
}

/// 中继用例门面
///
/// WebSocket 与 REST 两个入口都经过这里，最终走同一条分发路径。
pub struct RelayService {
    registry: Arc<SessionRegistry>,
    router: ScopeRouter,
    sequencer: Arc<Sequencer>,
    dispatcher: FanoutDispatcher,
    gate: ModerationGate,
    limiter: LiveRateLimiter,
    directory: Arc<dyn AccessDirectory>,
    store: Arc<dyn EnvelopeStore>,
    presence: Arc<dyn PresenceTracker>,
    gifts: Arc<dyn GiftLedger>,
    clock: Arc<dyn Clock>,
    settings: RelaySettings,
}

impl RelayService {
    pub fn new(deps: RelayServiceDependencies) -> Self {
        let RelayServiceDependencies {
            directory,
            store,
            presence,
            push,
            gifts,
            observer,
            clock,
            settings,
        } = deps;

        let registry = Arc::new(SessionRegistry::new(PresencePolicy {
            exclusive_live: settings.exclusive_live_presence,
            exclusive_private: settings.exclusive_private_presence,
        }));
        let sequencer = Arc::new(Sequencer::new(store.clone(), settings.replay_page_size));
        let dispatcher = FanoutDispatcher::new(
            registry.clone(),
            sequencer.clone(),
            store.clone(),
            presence.clone(),
            push,
            observer,
            clock.clone(),
            settings.dedup_capacity,
        );

        Self {
            router: ScopeRouter::new(directory.clone(), registry.clone()),
            gate: ModerationGate::new(registry.clone()),
            limiter: LiveRateLimiter::new(
                settings.live_rate_limit,
                Duration::from_millis(settings.live_rate_window_ms),
            ),
            registry,
            sequencer,
            dispatcher,
            directory,
            store,
            presence,
            gifts,
            clock,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    pub fn rate_limiter(&self) -> &LiveRateLimiter {
        &self.limiter
    }

    /// 处理握手：解析范围、绑定会话，直播重连时准备重放流
    pub async fn connect(
        &self,
        identity: Identity,
        params: &HandshakeParams,
    ) -> Result<Connection, ApplicationError> {
        let route = self.router.resolve(&identity, params).await?;
        let (tx, rx) = mpsc::channel(self.settings.outbox_capacity);

        let (session, replay) = match route.scope {
            Scope::Live(stream) => {
                // 持有通道时绑定：高水位之后的信封走出站队列，之前的走重放
                let lane = self.sequencer.acquire(stream).await?;
                let high = lane.current();
                let session = self.router.bind(&identity, &route, tx)?;
                drop(lane);

                let replay = route
                    .last_seq
                    .filter(|&last| last < high)
                    .map(|last| self.sequencer.resume_from(stream, last, Some(high)));
                (session, replay)
            }
            Scope::Private(_) => (self.router.bind(&identity, &route, tx)?, None),
        };

        if let Scope::Live(stream) = session.scope {
            if session.role == Role::Participant {
                if let Err(err) = self.presence.viewer_joined(stream, identity.user_id).await {
                    tracing::warn!(stream_id = %stream, error = %err, "failed to record viewer join");
                }
            }
            let join = EnvelopeDraft::new(session.scope, Payload::Join)
                .from_sender(Sender::from(&identity));
            if let Err(err) = self.dispatcher.dispatch(join).await {
                tracing::warn!(session = %session.id, error = %err, "failed to announce join");
            }
        }

        tracing::info!(
            session = %session.id,
            user_id = %identity.user_id,
            scope = %session.scope,
            role = %session.role,
            last_seq = ?route.last_seq,
            replay = replay.is_some(),
            "用户连接到聊天"
        );

        Ok(Connection {
            session,
            outbox: rx,
            replay,
        })
    }

    /// 处理一条入站文本帧
    pub async fn handle_frame(&self, session: SessionId, text: &str) -> Result<(), ApplicationError> {
        let action = ClientAction::parse(text)?;
        self.handle_action(session, action).await
    }

    pub async fn handle_action(
        &self,
        session: SessionId,
        action: ClientAction,
    ) -> Result<(), ApplicationError> {
        let info = self
            .registry
            .session(session)
            .ok_or(ApplicationError::UnknownSession(session))?;
        let scope = info.scope;
        action.validate_for(scope)?;

        let event = action.event_type();
        self.gate.authorize(session, event, scope)?;
        self.admit(&info.identity, scope, &action).await?;

        let sender = Sender::from(&info.identity);
        match (scope, action.payload) {
            (Scope::Private(_), Payload::Typing { is_typing }) => {
                let Some(other) = info.counterpart() else {
                    return Ok(());
                };
                let draft = EnvelopeDraft::new(scope, Payload::Typing { is_typing })
                    .from_sender(sender)
                    .to(other);
                self.dispatcher.dispatch(draft).await?;
            }
            (Scope::Private(match_id), Payload::ReadReceipt { .. }) => {
                self.mark_read(&info, match_id).await?;
            }
            (Scope::Private(_), payload) => {
                let Some(participants) = info.participants else {
                    return Err(ApplicationError::InvalidScope(
                        "private session without participants".into(),
                    ));
                };
                let receipt = self
                    .send_private(&info.identity, scope, participants, action.message_id, payload)
                    .await?;
                self.registry.send_to(
                    session,
                    ServerFrame::Delivery {
                        scope,
                        message_id: receipt.message_id,
                        status: receipt.status,
                        at: self.clock.now(),
                    },
                );
            }
            (Scope::Live(_), payload) => {
                let draft = EnvelopeDraft::new(scope, payload)
                    .with_id(action.message_id.unwrap_or_else(MessageId::new_v4))
                    .from_sender(sender);
                self.dispatcher.dispatch(draft).await?;
            }
        }
        Ok(())
    }

    /// 发送限制、直播限流与礼物校验
    async fn admit(
        &self,
        identity: &Identity,
        scope: Scope,
        action: &ClientAction,
    ) -> Result<(), ApplicationError> {
        let user = identity.user_id;
        let event = action.event_type();
        if !action.payload.is_durable() {
            return Ok(());
        }

        if !self.directory.may_send(user, scope).await? {
            return Err(ApplicationError::forbidden(event.as_str(), "sending is restricted"));
        }
        if scope.is_live() {
            if let Err(err) = self.limiter.check(user) {
                tracing::warn!(user_id = %user, scope = %scope, "live rate limit hit");
                return Err(err.into());
            }
        }
        if let Payload::Gift { gift_id, .. } = &action.payload {
            if !self.gifts.validate_gift(user, scope, gift_id).await? {
                return Err(ApplicationError::forbidden("gift", "gift rejected by ledger"));
            }
        }
        Ok(())
    }

    async fn send_private(
        &self,
        identity: &Identity,
        scope: Scope,
        participants: MatchParticipants,
        message_id: Option<MessageId>,
        payload: Payload,
    ) -> Result<DeliveryReceipt, ApplicationError> {
        let Some(receiver) = participants.other(identity.user_id) else {
            return Err(ApplicationError::forbidden(
                payload.event_type().as_str(),
                "not a participant of this match",
            ));
        };
        let message_id = message_id.unwrap_or_else(MessageId::new_v4);
        let draft = EnvelopeDraft::new(scope, payload)
            .with_id(message_id)
            .from_sender(Sender::from(identity))
            .to(receiver);

        let status = match self.dispatcher.dispatch(draft).await? {
            DispatchOutcome::Accepted(dispatched) if dispatched.delivered > 0 => {
                DeliveryStatus::Delivered
            }
            _ => DeliveryStatus::Sent,
        };
        Ok(DeliveryReceipt { message_id, status })
    }

    /// 已读回执：把未读消息标记为已读，每条消息给对方发一帧
    async fn mark_read(&self, info: &SessionInfo, match_id: MatchId) -> Result<(), ApplicationError> {
        let reader = info.identity.user_id;
        let Some(other) = info.counterpart() else {
            return Ok(());
        };
        let read = self.store.mark_read(match_id, reader).await.map_err(|err| {
            ApplicationError::PersistenceFailure(format!("cannot mark messages read: {err}"))
        })?;

        for message_id in &read {
            let draft = EnvelopeDraft::new(
                info.scope,
                Payload::ReadReceipt {
                    message_id: Some(*message_id),
                },
            )
            .from_sender(Sender::from(&info.identity))
            .to(other)
            .with_status(DeliveryStatus::Read);
            self.dispatcher.dispatch(draft).await?;
        }

        tracing::debug!(match_id = %match_id, reader = %reader, count = read.len(), "messages marked read");
        Ok(())
    }

    /// 把被拒绝的动作回执给发起者。格式错误的帧只记录日志。
    pub fn reject(&self, session: SessionId, err: &ApplicationError) {
        if err.is_malformed() {
            tracing::warn!(session = %session, error = %err, "丢弃格式错误的帧");
            return;
        }
        tracing::warn!(session = %session, code = err.code(), error = %err, "action rejected");
        self.registry
            .send_to(session, ServerFrame::error(err.code(), err.to_string()));
    }

    /// 连接关闭：解除绑定，直播间广播离开事件
    pub async fn disconnect(&self, session: SessionId) {
        let Some(info) = self.registry.unbind(session) else {
            return;
        };

        if let Scope::Live(stream) = info.scope {
            if info.role == Role::Participant {
                if let Err(err) = self.presence.viewer_left(stream, info.identity.user_id).await {
                    tracing::warn!(stream_id = %stream, error = %err, "failed to record viewer leave");
                }
            }
            let leave = EnvelopeDraft::new(info.scope, Payload::Leave)
                .from_sender(Sender::from(&info.identity));
            if let Err(err) = self.dispatcher.dispatch(leave).await {
                tracing::warn!(session = %session, error = %err, "failed to announce leave");
            }
            if self.registry.sessions_for(&info.scope).is_empty() {
                self.sequencer.release(stream).await;
            }
        }

        tracing::info!(session = %session, user_id = %info.identity.user_id, scope = %info.scope, "用户断开连接");
    }

    async fn participants_of(
        &self,
        identity: &Identity,
        match_id: MatchId,
        action: &'static str,
    ) -> Result<MatchParticipants, ApplicationError> {
        match self.directory.match_participants(match_id).await? {
            Some(pair) if pair.contains(identity.user_id) => Ok(pair),
            Some(_) => Err(ApplicationError::forbidden(action, "not a participant of this match")),
            None => Err(ApplicationError::InvalidScope(format!("unknown match {match_id}"))),
        }
    }

    /// 私聊历史（仅参与者可查）
    pub async fn private_history(
        &self,
        identity: &Identity,
        match_id: MatchId,
        before: Option<Timestamp>,
        limit: Option<usize>,
    ) -> Result<Vec<Envelope>, ApplicationError> {
        self.participants_of(identity, match_id, "history").await?;
        let limit = limit
            .unwrap_or(self.settings.history_page_limit)
            .clamp(1, MAX_HISTORY_PAGE);
        Ok(self.store.private_history(match_id, before, limit).await?)
    }

    /// WebSocket 发送失败时的 REST 兜底，与 WebSocket 共用分发路径，按消息 ID 幂等
    pub async fn send_private_via_rest(
        &self,
        identity: &Identity,
        match_id: MatchId,
        action: ClientAction,
    ) -> Result<DeliveryReceipt, ApplicationError> {
        let scope = Scope::Private(match_id);
        action.validate_for(scope)?;
        if !matches!(action.payload, Payload::Message(_) | Payload::Gift { .. }) {
            return Err(ApplicationError::forbidden(
                action.event_type().as_str(),
                "only messages can be sent over REST",
            ));
        }

        let participants = self.participants_of(identity, match_id, "message").await?;
        self.admit(identity, scope, &action).await?;
        let receipt = self
            .send_private(identity, scope, participants, action.message_id, action.payload)
            .await?;

        tracing::info!(match_id = %match_id, user_id = %identity.user_id, message_id = %receipt.message_id, "message accepted over REST");
        Ok(receipt)
    }

    pub async fn viewer_count(&self, stream: StreamId) -> u32 {
        self.dispatcher.viewer_count(stream).await
    }

    pub fn pinned(&self, stream: StreamId) -> Option<PinnedRef> {
        self.registry.pinned(&Scope::Live(stream))
    }
}
