//! 信封持久化抽象
//!
//! 直播间的信封按序列号存储，供断线重连时重放；
//! 私聊信封按创建时间存储，供 REST 历史查询。

use async_trait::async_trait;
use domain::{Envelope, MatchId, MessageId, StreamId, Timestamp, UserId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait EnvelopeStore: Send + Sync {
    /// 持久化一条信封；同一 ID 重复写入不产生第二条记录
    async fn persist(&self, envelope: &Envelope) -> Result<(), StoreError>;

    /// 直播间已持久化的最大序列号，没有记录时为 0
    async fn last_seq(&self, stream: StreamId) -> Result<i64, StoreError>;

    /// 序列号大于 `after_seq` 的信封，升序，最多 `limit` 条
    async fn live_after(
        &self,
        stream: StreamId,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError>;

    /// 私聊历史，按创建时间升序返回 `before` 之前最近的 `limit` 条
    async fn private_history(
        &self,
        match_id: MatchId,
        before: Option<Timestamp>,
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError>;

    /// 把发给 `reader` 的未读消息标记为已读，返回被标记的消息 ID
    async fn mark_read(&self, match_id: MatchId, reader: UserId)
        -> Result<Vec<MessageId>, StoreError>;
}

/// 内存实现的信封存储（用于测试和单机开发）
pub mod memory {
    use super::*;
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::RwLock;

    #[derive(Default)]
    struct Inner {
        live: HashMap<StreamId, BTreeMap<i64, Envelope>>,
        private: HashMap<MatchId, Vec<Envelope>>,
        ids: HashSet<MessageId>,
        unread: HashMap<(MatchId, UserId), Vec<MessageId>>,
    }

    #[derive(Default)]
    pub struct MemoryEnvelopeStore {
        inner: RwLock<Inner>,
        unavailable: AtomicBool,
    }

    impl MemoryEnvelopeStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// 模拟存储故障
        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("memory store switched off".into()));
            }
            Ok(())
        }

        pub async fn live_len(&self, stream: StreamId) -> usize {
            self.inner
                .read()
                .await
                .live
                .get(&stream)
                .map(BTreeMap::len)
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl EnvelopeStore for MemoryEnvelopeStore {
        async fn persist(&self, envelope: &Envelope) -> Result<(), StoreError> {
            self.check()?;
            let mut inner = self.inner.write().await;
            if !inner.ids.insert(envelope.id) {
                return Ok(());
            }

            match envelope.scope {
                domain::Scope::Live(stream) => {
                    let seq = envelope.seq.ok_or_else(|| {
                        StoreError::Corrupt(format!("live envelope {} has no seq", envelope.id))
                    })?;
                    inner
                        .live
                        .entry(stream)
                        .or_default()
                        .insert(seq, envelope.clone());
                }
                domain::Scope::Private(match_id) => {
                    if let Some(receiver) = envelope.receiver {
                        inner
                            .unread
                            .entry((match_id, receiver))
                            .or_default()
                            .push(envelope.id);
                    }
                    let history = inner.private.entry(match_id).or_default();
                    history.push(envelope.clone());
                    history.sort_by_key(|e| e.created_at);
                }
            }
            Ok(())
        }

        async fn last_seq(&self, stream: StreamId) -> Result<i64, StoreError> {
            self.check()?;
            let inner = self.inner.read().await;
            Ok(inner
                .live
                .get(&stream)
                .and_then(|log| log.keys().next_back().copied())
                .unwrap_or(0))
        }

        async fn live_after(
            &self,
            stream: StreamId,
            after_seq: i64,
            limit: usize,
        ) -> Result<Vec<Envelope>, StoreError> {
            self.check()?;
            let inner = self.inner.read().await;
            Ok(inner
                .live
                .get(&stream)
                .map(|log| {
                    log.range(after_seq.saturating_add(1)..)
                        .take(limit)
                        .map(|(_, e)| e.clone())
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn private_history(
            &self,
            match_id: MatchId,
            before: Option<Timestamp>,
            limit: usize,
        ) -> Result<Vec<Envelope>, StoreError> {
            self.check()?;
            let inner = self.inner.read().await;
            let Some(history) = inner.private.get(&match_id) else {
                return Ok(Vec::new());
            };
            let eligible: Vec<&Envelope> = history
                .iter()
                .filter(|e| before.map_or(true, |b| e.created_at < b))
                .collect();
            let start = eligible.len().saturating_sub(limit);
            Ok(eligible[start..].iter().map(|e| (*e).clone()).collect())
        }

        async fn mark_read(
            &self,
            match_id: MatchId,
            reader: UserId,
        ) -> Result<Vec<MessageId>, StoreError> {
            self.check()?;
            let mut inner = self.inner.write().await;
            Ok(inner.unread.remove(&(match_id, reader)).unwrap_or_default())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::{Duration, Utc};
        use domain::{MessageBody, Payload, Scope};

        fn private(match_id: MatchId, receiver: UserId, offset: i64) -> Envelope {
            Envelope {
                id: MessageId::new_v4(),
                scope: Scope::Private(match_id),
                sender: None,
                receiver: Some(receiver),
                created_at: Utc::now() + Duration::seconds(offset),
                seq: None,
                viewer_count: None,
                delivery_status: None,
                payload: Payload::Message(MessageBody::text(format!("m{offset}"))),
            }
        }

        #[tokio::test]
        async fn private_history_pages_backwards_in_ascending_order() {
            let store = MemoryEnvelopeStore::new();
            let match_id = MatchId::new_v4();
            let reader = UserId::new_v4();
            let envelopes: Vec<_> = (0..5).map(|i| private(match_id, reader, i)).collect();
            for e in envelopes.iter().rev() {
                store.persist(e).await.unwrap();
            }

            let page = store
                .private_history(match_id, Some(envelopes[4].created_at), 2)
                .await
                .unwrap();
            let ids: Vec<_> = page.iter().map(|e| e.id).collect();
            assert_eq!(ids, vec![envelopes[2].id, envelopes[3].id]);
        }

        #[tokio::test]
        async fn mark_read_drains_unread_once() {
            let store = MemoryEnvelopeStore::new();
            let match_id = MatchId::new_v4();
            let reader = UserId::new_v4();
            let envelope = private(match_id, reader, 0);
            store.persist(&envelope).await.unwrap();
            store.persist(&envelope).await.unwrap();

            let read = store.mark_read(match_id, reader).await.unwrap();
            assert_eq!(read, vec![envelope.id]);
            assert!(store.mark_read(match_id, reader).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn unavailable_store_fails() {
            let store = MemoryEnvelopeStore::new();
            store.set_unavailable(true);
            assert!(matches!(
                store.last_seq(StreamId::new_v4()).await,
                Err(StoreError::Unavailable(_))
            ));
        }
    }
}
