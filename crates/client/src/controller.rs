//! 重连控制器
//!
//! 状态流转：`Disconnected → Connecting → Connected → (断线) Reconnecting → Connecting …`。
//! 连续失败超过上限进入 `Failed`，只能显式重试；`Closed` 只由显式断开产生。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::Utc;
use domain::{ClientAction, MatchId, Payload, Scope, ServerFrame, WireFrame};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::backoff::ReconnectPolicy;
use crate::error::{ClientError, ClientResult};
use crate::history::HistoryFetcher;
use crate::subscriptions::{SubscriberTable, Subscription, Topic};
use crate::transport::{Link, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed { attempts: u32 },
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// 握手参数
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    /// 例如 `ws://127.0.0.1:8080/api/v1/ws/chat`
    endpoint: String,
    token: String,
    scope: Scope,
    is_broadcaster: bool,
    last_seq: Option<i64>,
}

impl ClientHandshake {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>, scope: Scope) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
            scope,
            is_broadcaster: false,
            last_seq: None,
        }
    }

    pub fn as_broadcaster(mut self) -> Self {
        self.is_broadcaster = true;
        self
    }

    /// 首次连接即从指定序列号之后续传
    pub fn resume_from(mut self, last_seq: i64) -> Self {
        self.last_seq = Some(last_seq);
        self
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// 私聊范围忽略 `last_seq`
    pub fn url(&self, last_seq: Option<i64>) -> ClientResult<String> {
        let mut params = vec![
            ("token", self.token.clone()),
            ("mode", self.scope.mode().as_str().to_string()),
        ];
        match self.scope {
            Scope::Private(match_id) => params.push(("match_id", match_id.to_string())),
            Scope::Live(stream_id) => {
                params.push(("live_stream_id", stream_id.to_string()));
                if self.is_broadcaster {
                    params.push(("is_broadcaster", "true".to_string()));
                }
                if let Some(seq) = last_seq {
                    params.push(("last_seq", seq.to_string()));
                }
            }
        }

        reqwest::Url::parse_with_params(&self.endpoint, &params)
            .map(String::from)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {e}", self.endpoint)))
    }
}

#[derive(Default)]
struct Outbound {
    queue: VecDeque<String>,
    link: Option<mpsc::Sender<String>>,
}

impl Outbound {
    fn enqueue(&mut self, text: String, limit: usize) -> ClientResult<()> {
        if self.queue.len() >= limit {
            return Err(ClientError::QueueFull { limit });
        }
        self.queue.push_back(text);
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LinkEnd {
    Dropped,
    /// 直播序列号出现缺口，需要从最后连续的序列号续传
    Gap,
    Shutdown,
}

/// 收到一个直播序列号后的判定
#[derive(Debug, PartialEq, Eq)]
enum SeqStep {
    Next,
    Duplicate,
    Gap { expected: i64 },
}

/// 只在序列号连续时前进
#[derive(Debug)]
struct SeqTracker {
    last: Option<i64>,
    /// 已经为这个位置之后的缺口重连过一次
    gap_after: Option<i64>,
}

impl SeqTracker {
    fn observe(&mut self, seq: i64) -> SeqStep {
        match self.last {
            Some(last) if seq <= last => SeqStep::Duplicate,
            Some(last) if seq > last + 1 && self.gap_after != Some(last) => {
                self.gap_after = Some(last);
                SeqStep::Gap { expected: last + 1 }
            }
            Some(last) if seq > last + 1 => {
                // 续传后仍然缺失，说明服务端已无法补齐
                tracing::warn!(last, seq, "序列号缺口无法补齐，继续接收");
                self.advance(seq)
            }
            _ => self.advance(seq),
        }
    }

    fn advance(&mut self, seq: i64) -> SeqStep {
        self.last = Some(seq);
        self.gap_after = None;
        SeqStep::Next
    }
}

struct Shared {
    handshake: ClientHandshake,
    policy: ReconnectPolicy,
    transport: Arc<dyn Transport>,
    history: Option<Arc<dyn HistoryFetcher>>,
    subscribers: SubscriberTable,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Outbound>,
    seqs: StdMutex<SeqTracker>,
    connected_before: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(scope = %self.handshake.scope, ?previous, ?state, "连接状态变更");
        }
    }

    fn resume_seq(&self) -> Option<i64> {
        if !self.handshake.scope.is_live() {
            return None;
        }
        self.last_seq()
    }

    fn last_seq(&self) -> Option<i64> {
        self.seqs.lock().unwrap_or_else(PoisonError::into_inner).last
    }

    fn observe_seq(&self, seq: i64) -> SeqStep {
        self.seqs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(seq)
    }

    /// 先按顺序冲刷断线期间排队的帧，再开放直接写入
    async fn attach(&self, outgoing: mpsc::Sender<String>) -> usize {
        let mut outbound = self.outbound.lock().await;
        let mut flushed = 0;
        while let Some(text) = outbound.queue.pop_front() {
            if let Err(mpsc::error::SendError(text)) = outgoing.send(text).await {
                outbound.queue.push_front(text);
                tracing::warn!(flushed, "冲刷待发送队列时连接已断开");
                return flushed;
            }
            flushed += 1;
        }
        outbound.link = Some(outgoing);
        flushed
    }

    async fn detach(&self) {
        self.outbound.lock().await.link = None;
    }

    /// 返回 `false` 表示出现序列号缺口，当前连接应当放弃
    fn handle_inbound(&self, text: &str) -> bool {
        let frame = match WireFrame::parse(text).and_then(ServerFrame::try_from) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(scope = %self.handshake.scope, error = %err, "丢弃无法解析的服务端帧");
                return true;
            }
        };
        if let Some(seq) = frame.seq() {
            match self.observe_seq(seq) {
                SeqStep::Next => {}
                SeqStep::Duplicate => {
                    tracing::debug!(scope = %self.handshake.scope, seq, "忽略重复的序列号");
                    return true;
                }
                SeqStep::Gap { expected } => {
                    tracing::warn!(scope = %self.handshake.scope, expected, seq, "序列号出现缺口，重连续传");
                    return false;
                }
            }
        }
        self.subscribers.publish(frame);
        true
    }

    /// 私聊没有序列号，重连后拉取最新一页历史补齐
    async fn refetch_history(&self, match_id: MatchId) {
        let Some(history) = &self.history else {
            return;
        };
        match history.fetch_private(match_id, None).await {
            Ok(envelopes) => {
                tracing::debug!(match_id = %match_id, count = envelopes.len(), "重连后已补齐私聊历史");
                for envelope in envelopes {
                    self.subscribers.publish(ServerFrame::Envelope(envelope));
                }
            }
            Err(err) => tracing::warn!(match_id = %match_id, error = %err, "重连后拉取历史失败"),
        }
    }

    async fn run_link(
        &self,
        link: Link,
        shutdown: &mut watch::Receiver<bool>,
        failures: &mut u32,
    ) -> LinkEnd {
        let Link {
            outgoing,
            mut incoming,
        } = link;
        let reconnected = self.connected_before.swap(true, Ordering::SeqCst);
        let flushed = self.attach(outgoing).await;
        self.set_state(ConnectionState::Connected);
        tracing::info!(scope = %self.handshake.scope, flushed, reconnected, "连接已建立");

        if reconnected {
            if let Scope::Private(match_id) = self.handshake.scope {
                self.refetch_history(match_id).await;
            }
        }

        let stable = sleep(self.policy.stable_after);
        tokio::pin!(stable);
        let mut stable_reached = false;

        let end = loop {
            tokio::select! {
                text = incoming.recv() => match text {
                    Some(text) => {
                        if !self.handle_inbound(&text) {
                            break LinkEnd::Gap;
                        }
                    }
                    None => break LinkEnd::Dropped,
                },
                _ = &mut stable, if !stable_reached => {
                    stable_reached = true;
                    *failures = 0;
                }
                _ = shutdown.changed() => break LinkEnd::Shutdown,
            }
        };
        self.detach().await;
        end
    }
}

async fn drive(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let scope = shared.handshake.scope;
    let mut failures = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }
        shared.set_state(ConnectionState::Connecting);

        let url = match shared.handshake.url(shared.resume_seq()) {
            Ok(url) => url,
            Err(err) => {
                tracing::error!(scope = %scope, error = %err, "无法构造握手地址");
                shared.set_state(ConnectionState::Failed { attempts: failures });
                return;
            }
        };

        match shared.transport.open(&url).await {
            Ok(link) => match shared.run_link(link, &mut shutdown, &mut failures).await {
                LinkEnd::Shutdown => break,
                LinkEnd::Gap => continue,
                LinkEnd::Dropped => tracing::info!(scope = %scope, "连接已断开"),
            },
            Err(err) => tracing::warn!(scope = %scope, error = %err, "连接失败"),
        }

        if *shutdown.borrow() {
            break;
        }
        failures += 1;
        if shared.policy.is_exhausted(failures) {
            let attempts = shared.policy.max_attempts;
            tracing::error!(scope = %scope, attempts, "重连次数已用尽，等待显式重试");
            shared.set_state(ConnectionState::Failed { attempts });
            return;
        }

        let delay = shared.policy.delay_at(failures);
        tracing::info!(
            scope = %scope,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            "准备重连"
        );
        shared.set_state(ConnectionState::Reconnecting { attempt: failures });
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
    }

    shared.detach().await;
    shared.set_state(ConnectionState::Closed);
}

/// 单条连接的客户端控制器
///
/// 每个实例独立持有自己的连接、订阅表和待发送队列。
pub struct ReconnectController {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    driver: StdMutex<Option<JoinHandle<()>>>,
}

impl ReconnectController {
    pub fn new(
        handshake: ClientHandshake,
        transport: Arc<dyn Transport>,
        history: Option<Arc<dyn HistoryFetcher>>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        let seqs = SeqTracker {
            last: handshake.last_seq,
            gap_after: None,
        };
        Self {
            shared: Arc::new(Shared {
                handshake,
                policy,
                transport,
                history,
                subscribers: SubscriberTable::new(),
                state,
                outbound: Mutex::new(Outbound::default()),
                seqs: StdMutex::new(seqs),
                connected_before: AtomicBool::new(false),
            }),
            shutdown,
            driver: StdMutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// 连续收到的最后一个直播序列号
    pub fn last_seq(&self) -> Option<i64> {
        self.shared.last_seq()
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.shared.subscribers.subscribe(topic)
    }

    /// 启动连接；在 `Failed` 或 `Closed` 之后调用即为显式重试
    pub fn connect(&self) {
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if driver.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        self.shutdown.send_replace(false);
        let shutdown = self.shutdown.subscribe();
        *driver = Some(tokio::spawn(drive(self.shared.clone(), shutdown)));
    }

    /// 显式断开，不再自动重连
    pub async fn disconnect(&self) {
        self.shutdown.send_replace(true);
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "连接任务异常结束");
            }
        }
        self.shared.detach().await;
        self.shared.set_state(ConnectionState::Closed);
    }

    /// 发送客户端动作
    ///
    /// 未连接时排队，连接建立后按顺序冲刷；输入状态不排队。
    /// 私聊消息在 WebSocket 写失败时改走 REST。重连用尽后直接报错，需先显式重试。
    pub async fn send(&self, action: ClientAction) -> ClientResult<()> {
        match self.state() {
            ConnectionState::Closed => return Err(ClientError::Closed),
            ConnectionState::Failed { attempts } => {
                return Err(ClientError::ReconnectExhausted { attempts })
            }
            _ => {}
        }

        let scope = self.shared.handshake.scope;
        let frame = action.to_wire(scope);
        let text = frame.to_json()?;
        let mut outbound = self.shared.outbound.lock().await;

        let (text, write_failed) = match outbound.link.clone() {
            Some(link) => match link.send(text).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(text)) => {
                    tracing::warn!(scope = %scope, event = %frame.event, "WebSocket写入失败");
                    outbound.link = None;
                    (text, true)
                }
            },
            None => (text, false),
        };

        match (scope, &self.shared.history) {
            (Scope::Private(match_id), Some(history))
                if write_failed && action.payload.is_durable() =>
            {
                drop(outbound);
                self.send_via_rest(history.as_ref(), match_id, frame).await
            }
            _ if matches!(action.payload, Payload::Typing { .. }) => {
                tracing::debug!(scope = %scope, "未连接，丢弃输入状态");
                Ok(())
            }
            _ => outbound.enqueue(text, self.shared.policy.max_queued),
        }
    }

    async fn send_via_rest(
        &self,
        history: &dyn HistoryFetcher,
        match_id: MatchId,
        frame: WireFrame,
    ) -> ClientResult<()> {
        let ack = history.send_private(match_id, frame).await?;
        tracing::info!(match_id = %match_id, message_id = %ack.message_id, "已通过 REST 兜底发送");
        self.shared.subscribers.publish(ServerFrame::Delivery {
            scope: Scope::Private(match_id),
            message_id: ack.message_id,
            status: ack.status,
            at: Utc::now(),
        });
        Ok(())
    }
}

impl Drop for ReconnectController {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::history::{DeliveryAck, MockHistoryFetcher};
    use crate::transport::memory::{MemoryTransport, ServerEnd};
    use domain::{
        DeliveryStatus, Envelope, EventType, MessageBody, MessageId, StreamId,
    };
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;
    use uuid::Uuid;

    const ENDPOINT: &str = "ws://relay.test/api/v1/ws/chat";

    fn live_handshake(stream: StreamId) -> ClientHandshake {
        ClientHandshake::new(ENDPOINT, "token", Scope::Live(stream))
    }

    fn private_handshake(match_id: MatchId) -> ClientHandshake {
        ClientHandshake::new(ENDPOINT, "token", Scope::Private(match_id))
    }

    fn setup(
        handshake: ClientHandshake,
        history: Option<Arc<dyn HistoryFetcher>>,
    ) -> (
        ReconnectController,
        Arc<MemoryTransport>,
        UnboundedReceiver<ServerEnd>,
    ) {
        let (transport, accepted) = MemoryTransport::new();
        let transport = Arc::new(transport);
        let controller = ReconnectController::new(
            handshake,
            transport.clone(),
            history,
            ReconnectPolicy::default(),
        );
        (controller, transport, accepted)
    }

    fn live_frame(stream: StreamId, seq: i64) -> String {
        json!({
            "type": "message",
            "mode": "live",
            "live_stream_id": stream,
            "message_id": Uuid::new_v4(),
            "content": format!("message {seq}"),
            "seq": seq
        })
        .to_string()
    }

    async fn wait_until(
        state: &mut watch::Receiver<ConnectionState>,
        predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> ConnectionState {
        *state.wait_for(predicate).await.unwrap()
    }

    #[test]
    fn live_url_carries_resume_point() {
        let stream = StreamId::new_v4();
        let url = live_handshake(stream).as_broadcaster().url(Some(7)).unwrap();
        assert!(url.starts_with(ENDPOINT));
        assert!(url.contains("mode=live"));
        assert!(url.contains(&format!("live_stream_id={stream}")));
        assert!(url.contains("is_broadcaster=true"));
        assert!(url.contains("last_seq=7"));

        let private = private_handshake(MatchId::new_v4()).url(Some(7)).unwrap();
        assert!(!private.contains("last_seq"));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_exceeding_attempt_cap() {
        let (controller, transport, mut accepted) = setup(live_handshake(StreamId::new_v4()), None);
        let mut state = controller.watch_state();

        controller.connect();
        let first = accepted.recv().await.unwrap();
        wait_until(&mut state, ConnectionState::is_connected).await;

        transport.refuse_connections(true);
        drop(first);

        let failed = wait_until(&mut state, |s| matches!(s, ConnectionState::Failed { .. })).await;
        assert_eq!(failed, ConnectionState::Failed { attempts: 5 });
        assert_eq!(transport.open_count(), 6);

        sleep(Duration::from_secs(300)).await;
        assert_eq!(transport.open_count(), 6);
        assert_eq!(controller.state(), ConnectionState::Failed { attempts: 5 });

        transport.refuse_connections(false);
        controller.connect();
        let _retried = accepted.recv().await.unwrap();
        wait_until(&mut state, ConnectionState::is_connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn send_after_exhaustion_reports_failure() {
        let (controller, transport, mut accepted) = setup(live_handshake(StreamId::new_v4()), None);
        let mut state = controller.watch_state();

        transport.refuse_connections(true);
        controller.connect();
        wait_until(&mut state, |s| matches!(s, ConnectionState::Failed { .. })).await;

        let err = controller
            .send(ClientAction::message("anyone there?"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ReconnectExhausted { attempts: 5 }));

        transport.refuse_connections(false);
        controller.connect();
        let mut server = accepted.recv().await.unwrap();
        wait_until(&mut state, ConnectionState::is_connected).await;
        controller.send(ClientAction::message("back")).await.unwrap();
        let frame = WireFrame::parse(&server.from_client.recv().await.unwrap()).unwrap();
        assert_eq!(frame.content.as_deref(), Some("back"));
    }

    #[tokio::test(start_paused = true)]
    async fn stable_connection_resets_attempt_counter() {
        let (controller, _transport, mut accepted) =
            setup(live_handshake(StreamId::new_v4()), None);
        let mut state = controller.watch_state();

        controller.connect();
        drop(accepted.recv().await.unwrap());
        let second = accepted.recv().await.unwrap();
        wait_until(&mut state, ConnectionState::is_connected).await;

        sleep(ReconnectPolicy::default().stable_after + Duration::from_secs(1)).await;
        drop(second);

        let reconnecting =
            wait_until(&mut state, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
        assert_eq!(reconnecting, ConnectionState::Reconnecting { attempt: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn queued_frames_are_flushed_in_order_on_connect() {
        let match_id = MatchId::new_v4();
        let (controller, _transport, mut accepted) = setup(private_handshake(match_id), None);

        controller.send(ClientAction::message("first")).await.unwrap();
        controller.send(ClientAction::typing(true)).await.unwrap();
        controller.send(ClientAction::message("second")).await.unwrap();
        assert_eq!(controller.state(), ConnectionState::Disconnected);

        controller.connect();
        let mut server = accepted.recv().await.unwrap();
        let first = WireFrame::parse(&server.from_client.recv().await.unwrap()).unwrap();
        let second = WireFrame::parse(&server.from_client.recv().await.unwrap()).unwrap();
        assert_eq!(first.content.as_deref(), Some("first"));
        assert_eq!(first.match_id, Some(match_id.into()));
        assert_eq!(second.content.as_deref(), Some("second"));

        controller.send(ClientAction::message("third")).await.unwrap();
        let third = WireFrame::parse(&server.from_client.recv().await.unwrap()).unwrap();
        assert_eq!(third.content.as_deref(), Some("third"));
    }

    #[tokio::test(start_paused = true)]
    async fn live_reconnect_resumes_from_last_seen_seq() {
        let stream = StreamId::new_v4();
        let (controller, _transport, mut accepted) = setup(live_handshake(stream), None);
        let mut scoped = controller.subscribe(Topic::Scope(Scope::Live(stream)));

        controller.connect();
        let first = accepted.recv().await.unwrap();
        assert!(!first.url.contains("last_seq"));

        first.to_client.send(live_frame(stream, 6)).await.unwrap();
        first.to_client.send(live_frame(stream, 7)).await.unwrap();
        assert_eq!(scoped.recv().await.unwrap().seq(), Some(6));
        assert_eq!(scoped.recv().await.unwrap().seq(), Some(7));
        assert_eq!(controller.last_seq(), Some(7));

        drop(first);
        let second = accepted.recv().await.unwrap();
        assert!(second.url.contains("last_seq=7"));
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_gap_resumes_from_last_contiguous_seq() {
        let stream = StreamId::new_v4();
        let (controller, transport, mut accepted) = setup(live_handshake(stream), None);
        let mut scoped = controller.subscribe(Topic::Scope(Scope::Live(stream)));

        controller.connect();
        let first = accepted.recv().await.unwrap();
        first.to_client.send(live_frame(stream, 1)).await.unwrap();
        first.to_client.send(live_frame(stream, 3)).await.unwrap();
        assert_eq!(scoped.recv().await.unwrap().seq(), Some(1));

        let second = accepted.recv().await.unwrap();
        assert!(second.url.contains("last_seq=1"));
        assert_eq!(controller.last_seq(), Some(1));
        assert_eq!(transport.open_count(), 2);

        second.to_client.send(live_frame(stream, 2)).await.unwrap();
        second.to_client.send(live_frame(stream, 3)).await.unwrap();
        assert_eq!(scoped.recv().await.unwrap().seq(), Some(2));
        assert_eq!(scoped.recv().await.unwrap().seq(), Some(3));
        assert_eq!(controller.last_seq(), Some(3));
    }

    #[test]
    fn unrecoverable_gap_is_accepted_after_one_resume() {
        let mut seqs = SeqTracker {
            last: Some(1),
            gap_after: None,
        };
        assert_eq!(seqs.observe(3), SeqStep::Gap { expected: 2 });
        assert_eq!(seqs.last, Some(1));

        // 续传后服务端仍从 3 开始
        assert_eq!(seqs.observe(3), SeqStep::Next);
        assert_eq!(seqs.observe(3), SeqStep::Duplicate);
        assert_eq!(seqs.observe(4), SeqStep::Next);
        assert_eq!(seqs.last, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_dropped_without_closing() {
        let stream = StreamId::new_v4();
        let (controller, transport, mut accepted) = setup(live_handshake(stream), None);
        let mut messages = controller.subscribe(Topic::event(EventType::Message));

        controller.connect();
        let server = accepted.recv().await.unwrap();
        server.to_client.send("{garbage".to_string()).await.unwrap();
        server
            .to_client
            .send(json!({"type": "message", "content": "no scope"}).to_string())
            .await
            .unwrap();
        server.to_client.send(live_frame(stream, 1)).await.unwrap();

        let frame = messages.recv().await.unwrap();
        assert_eq!(frame.seq(), Some(1));
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn private_reconnect_refetches_history() {
        let match_id = MatchId::new_v4();
        let missed = Envelope {
            id: MessageId::new_v4(),
            scope: Scope::Private(match_id),
            sender: None,
            receiver: None,
            created_at: Utc::now(),
            seq: None,
            viewer_count: None,
            delivery_status: None,
            payload: Payload::Message(MessageBody::text("while you were away")),
        };
        let missed_id = missed.id;

        let mut history = MockHistoryFetcher::new();
        history
            .expect_fetch_private()
            .withf(move |id, before| *id == match_id && before.is_none())
            .times(1)
            .returning(move |_, _| Ok(vec![missed.clone()]));

        let (controller, _transport, mut accepted) =
            setup(private_handshake(match_id), Some(Arc::new(history)));
        let mut scoped = controller.subscribe(Topic::Scope(Scope::Private(match_id)));

        controller.connect();
        let first = accepted.recv().await.unwrap();
        assert!(first.url.contains(&format!("match_id={match_id}")));
        drop(first);

        let _second = accepted.recv().await.unwrap();
        let frame = scoped.recv().await.unwrap();
        match frame.as_ref() {
            ServerFrame::Envelope(envelope) => assert_eq!(envelope.id, missed_id),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn private_send_falls_back_to_rest_when_socket_write_fails() {
        let match_id = MatchId::new_v4();
        let mut history = MockHistoryFetcher::new();
        history
            .expect_send_private()
            .withf(move |id, frame| *id == match_id && frame.content.as_deref() == Some("hello"))
            .times(1)
            .returning(|_, frame| {
                Ok(DeliveryAck {
                    message_id: MessageId::from(frame.message_id.unwrap()),
                    status: DeliveryStatus::Sent,
                })
            });

        let (controller, _transport, mut accepted) =
            setup(private_handshake(match_id), Some(Arc::new(history)));
        let mut acks = controller.subscribe(Topic::delivery_status());
        let mut state = controller.watch_state();

        controller.connect();
        let ServerEnd {
            to_client: _to_client,
            from_client,
            ..
        } = accepted.recv().await.unwrap();
        wait_until(&mut state, ConnectionState::is_connected).await;
        drop(from_client);

        let action = ClientAction::message("hello");
        let message_id = action.message_id.unwrap();
        controller.send(action).await.unwrap();

        match acks.recv().await.unwrap().as_ref() {
            ServerFrame::Delivery {
                message_id: acked,
                status,
                ..
            } => {
                assert_eq!(*acked, message_id);
                assert_eq!(*status, DeliveryStatus::Sent);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_disconnect_is_terminal() {
        let (controller, transport, mut accepted) = setup(live_handshake(StreamId::new_v4()), None);
        let mut state = controller.watch_state();

        controller.connect();
        let mut server = accepted.recv().await.unwrap();
        wait_until(&mut state, ConnectionState::is_connected).await;

        controller.disconnect().await;
        assert_eq!(controller.state(), ConnectionState::Closed);
        assert!(server.from_client.recv().await.is_none());

        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.open_count(), 1);
        assert!(matches!(
            controller.send(ClientAction::message("late")).await,
            Err(ClientError::Closed)
        ));
    }
}
