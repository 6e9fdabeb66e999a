//! 中继服务单元测试
//!
//! 使用内存协作者驱动完整的连接、分发、重连流程。

use std::sync::Arc;

use domain::{
    ClientAction, DeliveryStatus, EventType, Identity, MatchId, MessageId, Payload,
    ServerFrame, StreamId, UserId,
};
use futures_util::TryStreamExt;

use crate::collaborators::MockPushNotifier;
use crate::directory::memory::StaticDirectory;
use crate::error::ApplicationError;
use crate::repository::memory::MemoryEnvelopeStore;
use crate::router::HandshakeParams;
use crate::services::relay_service::{Connection, RelayService, RelayServiceDependencies};

struct Harness {
    service: Arc<RelayService>,
    directory: Arc<StaticDirectory>,
    store: Arc<MemoryEnvelopeStore>,
}

fn harness_with(
    directory: StaticDirectory,
    tweak: impl FnOnce(&mut RelayServiceDependencies),
) -> Harness {
    let directory = Arc::new(directory);
    let store = Arc::new(MemoryEnvelopeStore::new());
    let mut deps = RelayServiceDependencies::in_memory(directory.clone());
    deps.store = store.clone();
    tweak(&mut deps);
    Harness {
        service: Arc::new(RelayService::new(deps)),
        directory,
        store,
    }
}

fn harness(directory: StaticDirectory) -> Harness {
    harness_with(directory, |_| {})
}

fn drain(conn: &mut Connection) -> Vec<Arc<ServerFrame>> {
    std::iter::from_fn(|| conn.outbox.try_recv().ok()).collect()
}

fn seqs(frames: &[Arc<ServerFrame>]) -> Vec<i64> {
    frames.iter().filter_map(|f| f.seq()).collect()
}

fn events(frames: &[Arc<ServerFrame>]) -> Vec<&'static str> {
    frames.iter().map(|f| f.event_name()).collect()
}

struct LiveSetup {
    stream: StreamId,
    broadcaster: Identity,
    viewer: Identity,
}

fn live_setup() -> (LiveSetup, StaticDirectory) {
    let setup = LiveSetup {
        stream: StreamId::new_v4(),
        broadcaster: Identity::new(UserId::new_v4()).with_name("Host"),
        viewer: Identity::new(UserId::new_v4()).with_name("Viewer"),
    };
    let directory = StaticDirectory::new().with_stream(setup.stream, setup.broadcaster.user_id);
    (setup, directory)
}

struct PrivateSetup {
    match_id: MatchId,
    alice: Identity,
    bob: Identity,
}

fn private_setup() -> (PrivateSetup, StaticDirectory) {
    let setup = PrivateSetup {
        match_id: MatchId::new_v4(),
        alice: Identity::new(UserId::new_v4()).with_name("Alice"),
        bob: Identity::new(UserId::new_v4()).with_name("Bob"),
    };
    let directory =
        StaticDirectory::new().with_match(setup.match_id, setup.alice.user_id, setup.bob.user_id);
    (setup, directory)
}

#[tokio::test]
async fn test_live_viewer_resumes_missed_messages_in_order() {
    let (live, directory) = live_setup();
    let h = harness(directory);

    let mut host = h
        .service
        .connect(live.broadcaster.clone(), &HandshakeParams::live(live.stream).as_broadcaster())
        .await
        .unwrap();
    let mut viewer = h
        .service
        .connect(live.viewer.clone(), &HandshakeParams::live(live.stream))
        .await
        .unwrap();

    h.service
        .handle_action(host.session.id, ClientAction::message("hello"))
        .await
        .unwrap();
    assert_eq!(seqs(&drain(&mut viewer)), vec![1]);

    // 观众掉线期间主播继续发言
    h.service.disconnect(viewer.session.id).await;
    h.service
        .handle_action(host.session.id, ClientAction::message("are you there"))
        .await
        .unwrap();

    let mut resumed = h
        .service
        .connect(
            live.viewer.clone(),
            &HandshakeParams::live(live.stream).resume_after(0),
        )
        .await
        .unwrap();
    let replayed: Vec<_> = resumed
        .replay
        .take()
        .expect("resume should produce a replay stream")
        .try_collect()
        .await
        .unwrap();
    let replayed_seqs: Vec<_> = replayed.iter().filter_map(|e| e.seq).collect();
    assert_eq!(replayed_seqs, vec![1, 2]);
    assert_eq!(replayed[1].payload.body().and_then(|b| b.content.as_deref()), Some("are you there"));

    // 重连之后的新消息只经出站队列到达，不重复不遗漏
    h.service
        .handle_action(host.session.id, ClientAction::message("welcome back"))
        .await
        .unwrap();
    let live_frames = drain(&mut resumed);
    assert_eq!(seqs(&live_frames), vec![3]);
    assert_eq!(events(&live_frames), vec!["join", "message"]);

    // 主播收到自己的权威回显
    let host_frames = drain(&mut host);
    assert_eq!(seqs(&host_frames), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_slow_live_viewer_is_evicted_and_resumes_without_gap() {
    let (live, directory) = live_setup();
    let h = harness_with(directory, |deps| deps.settings.outbox_capacity = 2);

    let mut host = h
        .service
        .connect(live.broadcaster.clone(), &HandshakeParams::live(live.stream).as_broadcaster())
        .await
        .unwrap();
    let mut viewer = h
        .service
        .connect(live.viewer.clone(), &HandshakeParams::live(live.stream))
        .await
        .unwrap();
    drain(&mut viewer);
    drain(&mut host);

    // 观众不读出站队列，主播连发四条
    for n in 1..=4 {
        h.service
            .handle_action(host.session.id, ClientAction::message(format!("burst {n}")))
            .await
            .unwrap();
        drain(&mut host);
    }

    assert_eq!(seqs(&drain(&mut viewer)), vec![1, 2]);
    assert!(viewer.outbox.recv().await.is_none());
    let scope = viewer.session.scope;
    assert_eq!(h.service.registry().sessions_for(&scope), vec![host.session.id]);

    h.service
        .handle_action(host.session.id, ClientAction::message("after eviction"))
        .await
        .unwrap();

    // 连接关闭后带着最后连续的序列号重连
    h.service.disconnect(viewer.session.id).await;
    let mut resumed = h
        .service
        .connect(live.viewer.clone(), &HandshakeParams::live(live.stream).resume_after(2))
        .await
        .unwrap();
    let replayed: Vec<_> = resumed
        .replay
        .take()
        .expect("resume should produce a replay stream")
        .try_collect()
        .await
        .unwrap();
    let replayed_seqs: Vec<_> = replayed.iter().filter_map(|e| e.seq).collect();
    assert_eq!(replayed_seqs, vec![3, 4, 5]);
}

#[tokio::test]
async fn test_idle_live_stream_releases_lane_and_keeps_numbering() {
    let (live, directory) = live_setup();
    let h = harness(directory);

    let host = h
        .service
        .connect(live.broadcaster.clone(), &HandshakeParams::live(live.stream).as_broadcaster())
        .await
        .unwrap();
    h.service
        .handle_action(host.session.id, ClientAction::message("first"))
        .await
        .unwrap();
    h.service.disconnect(host.session.id).await;
    assert!(!h.service.sequencer().release(live.stream).await);

    let host = h
        .service
        .connect(live.broadcaster.clone(), &HandshakeParams::live(live.stream).as_broadcaster())
        .await
        .unwrap();
    h.service
        .handle_action(host.session.id, ClientAction::message("second"))
        .await
        .unwrap();
    let numbering: Vec<_> = h
        .service
        .sequencer()
        .resume_from(live.stream, 0, None)
        .try_collect::<Vec<_>>()
        .await
        .unwrap()
        .iter()
        .filter_map(|e| e.seq)
        .collect();
    assert_eq!(numbering, vec![1, 2]);
}

#[tokio::test]
async fn test_live_resume_without_last_seq_has_no_replay() {
    let (live, directory) = live_setup();
    let h = harness(directory);
    let host = h
        .service
        .connect(live.broadcaster.clone(), &HandshakeParams::live(live.stream).as_broadcaster())
        .await
        .unwrap();
    h.service
        .handle_action(host.session.id, ClientAction::message("hi"))
        .await
        .unwrap();

    let viewer = h
        .service
        .connect(live.viewer.clone(), &HandshakeParams::live(live.stream))
        .await
        .unwrap();
    assert!(viewer.replay.is_none());

    let caught_up = h
        .service
        .connect(
            Identity::new(UserId::new_v4()),
            &HandshakeParams::live(live.stream).resume_after(1),
        )
        .await
        .unwrap();
    assert!(caught_up.replay.is_none());
}

#[tokio::test]
async fn test_private_offline_message_history_and_read_receipt() {
    let (p, directory) = private_setup();
    let h = harness(directory);

    let mut alice = h
        .service
        .connect(p.alice.clone(), &HandshakeParams::private(p.match_id))
        .await
        .unwrap();
    let hi = ClientAction::message("hi");
    let hi_id = hi.message_id.unwrap();
    h.service.handle_action(alice.session.id, hi).await.unwrap();

    // Bob 不在线：只持久化，发送者收到 sent 状态
    let frames = drain(&mut alice);
    assert_eq!(frames.len(), 1);
    assert!(matches!(
        frames[0].as_ref(),
        ServerFrame::Delivery { message_id, status: DeliveryStatus::Sent, .. } if *message_id == hi_id
    ));

    let history = h
        .service
        .private_history(&p.bob, p.match_id, None, None)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, hi_id);
    assert_eq!(history[0].seq, None);

    let bob = h
        .service
        .connect(p.bob.clone(), &HandshakeParams::private(p.match_id))
        .await
        .unwrap();
    h.service
        .handle_action(bob.session.id, ClientAction::read_receipt())
        .await
        .unwrap();

    let frames = drain(&mut alice);
    assert_eq!(frames.len(), 1);
    let ServerFrame::Envelope(receipt) = frames[0].as_ref() else {
        panic!("expected a read receipt envelope");
    };
    assert_eq!(receipt.event_type(), EventType::ReadReceipt);
    assert_eq!(receipt.delivery_status, Some(DeliveryStatus::Read));
    assert_eq!(
        receipt.payload,
        Payload::ReadReceipt {
            message_id: Some(hi_id)
        }
    );
}

#[tokio::test]
async fn test_private_message_reaches_only_counterpart() {
    let (p, directory) = private_setup();
    let h = harness(directory);

    let mut alice = h
        .service
        .connect(p.alice.clone(), &HandshakeParams::private(p.match_id))
        .await
        .unwrap();
    let mut bob = h
        .service
        .connect(p.bob.clone(), &HandshakeParams::private(p.match_id))
        .await
        .unwrap();

    h.service
        .handle_action(alice.session.id, ClientAction::typing(true))
        .await
        .unwrap();
    h.service
        .handle_action(alice.session.id, ClientAction::message("hey"))
        .await
        .unwrap();

    let bob_frames = drain(&mut bob);
    assert_eq!(events(&bob_frames), vec!["typing", "message"]);
    assert!(bob_frames.iter().all(|f| f.seq().is_none()));

    // 发送者只收到送达确认，不会收到自己的消息
    let alice_frames = drain(&mut alice);
    assert!(matches!(
        alice_frames.as_slice(),
        [frame] if matches!(frame.as_ref(), ServerFrame::Delivery { status: DeliveryStatus::Delivered, .. })
    ));
}

#[tokio::test]
async fn test_broadcaster_pin_replaces_previous_pin() {
    let (live, directory) = live_setup();
    let h = harness(directory);
    let host = h
        .service
        .connect(live.broadcaster.clone(), &HandshakeParams::live(live.stream).as_broadcaster())
        .await
        .unwrap();
    let mut viewer = h
        .service
        .connect(live.viewer.clone(), &HandshakeParams::live(live.stream))
        .await
        .unwrap();

    let first = MessageId::new_v4();
    let second = MessageId::new_v4();
    h.service
        .handle_action(host.session.id, ClientAction::pin(first, Some("rules".into())))
        .await
        .unwrap();
    h.service
        .handle_action(host.session.id, ClientAction::pin(second, Some("schedule".into())))
        .await
        .unwrap();

    let pinned = h.service.pinned(live.stream).expect("a pin is active");
    assert_eq!(pinned.message_id, Some(second));
    assert_eq!(pinned.content.as_deref(), Some("schedule"));
    assert_eq!(pinned.pinned_by, live.broadcaster.user_id);

    let frames = drain(&mut viewer);
    let pins: Vec<_> = frames
        .iter()
        .filter(|f| f.event_name() == "pin")
        .filter_map(|f| f.seq())
        .collect();
    assert_eq!(pins, vec![1, 2]);

    h.service
        .handle_action(host.session.id, ClientAction::unpin())
        .await
        .unwrap();
    assert!(h.service.pinned(live.stream).is_none());
}

#[tokio::test]
async fn test_viewer_pin_is_forbidden_and_not_broadcast() {
    let (live, directory) = live_setup();
    let h = harness(directory);
    let mut host = h
        .service
        .connect(live.broadcaster.clone(), &HandshakeParams::live(live.stream).as_broadcaster())
        .await
        .unwrap();
    let mut viewer = h
        .service
        .connect(live.viewer.clone(), &HandshakeParams::live(live.stream))
        .await
        .unwrap();
    drain(&mut host);
    drain(&mut viewer);

    let err = h
        .service
        .handle_action(viewer.session.id, ClientAction::pin(MessageId::new_v4(), None))
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Forbidden { action: "pin", .. }));
    h.service.reject(viewer.session.id, &err);

    assert!(drain(&mut host).is_empty());
    assert!(h.service.pinned(live.stream).is_none());
    let viewer_frames = drain(&mut viewer);
    assert!(matches!(
        viewer_frames.as_slice(),
        [frame] if matches!(frame.as_ref(), ServerFrame::Error { code, .. } if code == "FORBIDDEN")
    ));

    // 观众也不能发系统消息
    let err = h
        .service
        .handle_frame(
            viewer.session.id,
            r#"{"type":"system","mode":"live","content":"fake announcement"}"#,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Forbidden { action: "system", .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_live_senders_observe_same_gap_free_order() {
    let (live, directory) = live_setup();
    let h = harness_with(directory, |deps| {
        deps.settings.live_rate_limit = 10_000;
    });

    let mut watchers = Vec::new();
    for _ in 0..2 {
        watchers.push(
            h.service
                .connect(Identity::new(UserId::new_v4()), &HandshakeParams::live(live.stream))
                .await
                .unwrap(),
        );
    }

    let mut senders = Vec::new();
    for _ in 0..5 {
        let conn = h
            .service
            .connect(Identity::new(UserId::new_v4()), &HandshakeParams::live(live.stream))
            .await
            .unwrap();
        senders.push(conn);
    }

    let mut tasks = Vec::new();
    for (n, sender) in senders.iter().enumerate() {
        let service = h.service.clone();
        let session = sender.session.id;
        tasks.push(tokio::spawn(async move {
            for i in 0..20 {
                service
                    .handle_action(session, ClientAction::message(format!("{n}-{i}")))
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let expected: Vec<i64> = (1..=100).collect();
    let mut orders = Vec::new();
    for watcher in watchers.iter_mut() {
        let frames = drain(watcher);
        assert_eq!(seqs(&frames), expected);
        let ids: Vec<_> = frames
            .iter()
            .filter_map(|f| match f.as_ref() {
                ServerFrame::Envelope(e) if e.seq.is_some() => Some(e.id),
                _ => None,
            })
            .collect();
        orders.push(ids);
    }
    assert_eq!(orders[0], orders[1]);
    assert_eq!(h.store.live_len(live.stream).await, 100);
}

#[tokio::test]
async fn test_second_live_stream_is_scope_conflict() {
    let (live, directory) = live_setup();
    let h = harness(directory);
    let _first = h
        .service
        .connect(live.viewer.clone(), &HandshakeParams::live(live.stream))
        .await
        .unwrap();

    let err = h
        .service
        .connect(live.viewer.clone(), &HandshakeParams::live(StreamId::new_v4()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SCOPE_CONFLICT");
}

#[tokio::test]
async fn test_live_rate_limit_rejects_sixth_message() {
    let (live, directory) = live_setup();
    let h = harness(directory);
    let mut viewer = h
        .service
        .connect(live.viewer.clone(), &HandshakeParams::live(live.stream))
        .await
        .unwrap();

    for i in 0..5 {
        h.service
            .handle_action(viewer.session.id, ClientAction::message(format!("spam {i}")))
            .await
            .unwrap();
    }
    let err = h
        .service
        .handle_action(viewer.session.id, ClientAction::message("one too many"))
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::RateLimited(_)));
    h.service.reject(viewer.session.id, &err);

    let frames = drain(&mut viewer);
    assert_eq!(seqs(&frames), vec![1, 2, 3, 4, 5]);
    assert!(matches!(
        frames.last().map(|f| f.as_ref()),
        Some(ServerFrame::Error { code, .. }) if code == "RATE_LIMITED"
    ));
}

#[tokio::test]
async fn test_join_and_leave_carry_viewer_count() {
    let (live, directory) = live_setup();
    let h = harness(directory);
    let mut host = h
        .service
        .connect(live.broadcaster.clone(), &HandshakeParams::live(live.stream).as_broadcaster())
        .await
        .unwrap();
    let viewer = h
        .service
        .connect(live.viewer.clone(), &HandshakeParams::live(live.stream))
        .await
        .unwrap();
    assert_eq!(h.service.viewer_count(live.stream).await, 1);

    h.service.disconnect(viewer.session.id).await;
    assert_eq!(h.service.viewer_count(live.stream).await, 0);

    let counts: Vec<_> = drain(&mut host)
        .iter()
        .filter_map(|f| match f.as_ref() {
            ServerFrame::Envelope(e) => Some((e.event_type(), e.viewer_count)),
            _ => None,
        })
        .collect();
    assert_eq!(
        counts,
        vec![
            (EventType::Join, Some(0)),
            (EventType::Join, Some(1)),
            (EventType::Leave, Some(0)),
        ]
    );
}

#[tokio::test]
async fn test_offline_recipient_triggers_push() {
    let (p, directory) = private_setup();
    let bob = p.bob.user_id;
    let mut push = MockPushNotifier::new();
    push.expect_notify_undelivered()
        .withf(move |recipient, _| *recipient == bob)
        .times(1)
        .returning(|_, _| Ok(()));
    let h = harness_with(directory, |deps| deps.push = Arc::new(push));

    let alice = h
        .service
        .connect(p.alice.clone(), &HandshakeParams::private(p.match_id))
        .await
        .unwrap();
    h.service
        .handle_action(alice.session.id, ClientAction::message("are you awake?"))
        .await
        .unwrap();
    // 输入状态不触发推送
    h.service
        .handle_action(alice.session.id, ClientAction::typing(true))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_malformed_frame_is_dropped_without_reply() {
    let (p, directory) = private_setup();
    let h = harness(directory);
    let mut alice = h
        .service
        .connect(p.alice.clone(), &HandshakeParams::private(p.match_id))
        .await
        .unwrap();

    let err = h
        .service
        .handle_frame(alice.session.id, "{definitely not json")
        .await
        .unwrap_err();
    assert!(err.is_malformed());
    h.service.reject(alice.session.id, &err);
    assert!(drain(&mut alice).is_empty());

    // 连接仍然可用
    h.service
        .handle_frame(alice.session.id, r#"{"type":"message","content":"still here"}"#)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_rest_fallback_is_idempotent_by_message_id() {
    let (p, directory) = private_setup();
    let h = harness(directory);
    let mut bob = h
        .service
        .connect(p.bob.clone(), &HandshakeParams::private(p.match_id))
        .await
        .unwrap();

    let action = ClientAction::message("sent over http");
    let first = h
        .service
        .send_private_via_rest(&p.alice, p.match_id, action.clone())
        .await
        .unwrap();
    assert_eq!(first.status, DeliveryStatus::Delivered);
    let again = h
        .service
        .send_private_via_rest(&p.alice, p.match_id, action)
        .await
        .unwrap();
    assert_eq!(again.message_id, first.message_id);
    assert_eq!(again.status, DeliveryStatus::Sent);

    assert_eq!(events(&drain(&mut bob)), vec!["message"]);
    let history = h
        .service
        .private_history(&p.alice, p.match_id, None, Some(10))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_outsider_cannot_read_history() {
    let (p, directory) = private_setup();
    let h = harness(directory);
    let err = h
        .service
        .private_history(&Identity::new(UserId::new_v4()), p.match_id, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Forbidden { .. }));
}

#[tokio::test]
async fn test_restricted_user_cannot_send() {
    let (p, directory) = private_setup();
    let h = harness(directory);
    h.directory.restrict(p.alice.user_id).await;
    let alice = h
        .service
        .connect(p.alice.clone(), &HandshakeParams::private(p.match_id))
        .await
        .unwrap();

    let err = h
        .service
        .handle_action(alice.session.id, ClientAction::message("blocked"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
}

#[tokio::test]
async fn test_live_delivery_survives_store_outage() {
    let (live, directory) = live_setup();
    let h = harness(directory);
    let host = h
        .service
        .connect(live.broadcaster.clone(), &HandshakeParams::live(live.stream).as_broadcaster())
        .await
        .unwrap();
    let mut viewer = h
        .service
        .connect(live.viewer.clone(), &HandshakeParams::live(live.stream))
        .await
        .unwrap();

    h.store.set_unavailable(true);
    h.service
        .handle_action(host.session.id, ClientAction::message("still live"))
        .await
        .unwrap();
    assert_eq!(seqs(&drain(&mut viewer)), vec![1]);
    assert_eq!(h.store.live_len(live.stream).await, 0);
}

#[tokio::test]
async fn test_mode_mismatch_is_rejected() {
    let (live, directory) = live_setup();
    let h = harness(directory);
    let viewer = h
        .service
        .connect(live.viewer.clone(), &HandshakeParams::live(live.stream))
        .await
        .unwrap();

    let err = h
        .service
        .handle_action(viewer.session.id, ClientAction::typing(true))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_FRAME");
}
