//! 直播间序列号分配与重放
//!
//! 每个直播间有一条独占的序列号通道（`SequenceLane`）。持有通道期间，
//! 该直播间的序列号分配、广播、置顶变更和持久化是串行的；不同直播间互不阻塞。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_stream::try_stream;
use domain::{Envelope, StreamId};
use futures_util::stream::{BoxStream, Stream};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::ApplicationError;
use crate::repository::EnvelopeStore;

/// 重放流：懒加载、有限、按序列号升序
pub type ReplayStream = BoxStream<'static, Result<Envelope, ApplicationError>>;

#[derive(Debug, Default)]
struct SeqCell {
    last: i64,
    reconciled: bool,
    /// 已从通道表移除，等待者需要换用新的通道
    retired: bool,
}

/// 某个直播间的独占序列号通道，释放即解锁
pub struct SequenceLane {
    stream: StreamId,
    cell: OwnedMutexGuard<SeqCell>,
}

impl SequenceLane {
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// 已分配的最大序列号
    pub fn current(&self) -> i64 {
        self.cell.last
    }

    /// 分配下一个序列号，从 1 开始
    pub fn next(&mut self) -> i64 {
        self.cell.last += 1;
        self.cell.last
    }
}

pub struct Sequencer {
    store: Arc<dyn EnvelopeStore>,
    lanes: Mutex<HashMap<StreamId, Arc<AsyncMutex<SeqCell>>>>,
    page_size: usize,
}

impl Sequencer {
    pub fn new(store: Arc<dyn EnvelopeStore>, page_size: usize) -> Self {
        Self {
            store,
            lanes: Mutex::new(HashMap::new()),
            page_size: page_size.max(1),
        }
    }

    fn cell(&self, stream: StreamId) -> Arc<AsyncMutex<SeqCell>> {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(stream)
            .or_default()
            .clone()
    }

    /// 获取直播间的序列号通道。首次使用时与存储对齐为 `max(cache, store)`。
    pub async fn acquire(&self, stream: StreamId) -> Result<SequenceLane, ApplicationError> {
        let mut cell = loop {
            let cell = self.cell(stream).lock_owned().await;
            if !cell.retired {
                break cell;
            }
        };
        if !cell.reconciled {
            let stored = self.store.last_seq(stream).await.map_err(|err| {
                tracing::warn!(stream_id = %stream, error = %err, "无法从存储恢复序列号");
                ApplicationError::PersistenceFailure(format!(
                    "cannot reconcile sequence for live:{stream}: {err}"
                ))
            })?;
            cell.last = cell.last.max(stored);
            cell.reconciled = true;
            tracing::debug!(stream_id = %stream, last_seq = cell.last, "sequence reconciled");
        }
        Ok(SequenceLane { stream, cell })
    }

    /// 回收空闲直播间的通道，下次使用时重新与存储对齐。
    ///
    /// 通道正被占用，或缓存的序列号领先于存储（有信封未能落盘）时保留。
    pub async fn release(&self, stream: StreamId) -> bool {
        let Some(cell) = self
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&stream)
            .cloned()
        else {
            return false;
        };
        let Ok(mut guard) = cell.clone().try_lock_owned() else {
            return false;
        };

        if guard.reconciled {
            match self.store.last_seq(stream).await {
                Ok(stored) if stored >= guard.last => {}
                Ok(stored) => {
                    tracing::debug!(stream_id = %stream, cached = guard.last, stored, "缓存序列号领先于存储，保留通道");
                    return false;
                }
                Err(err) => {
                    tracing::warn!(stream_id = %stream, error = %err, "无法确认存储序列号，保留通道");
                    return false;
                }
            }
        }

        guard.retired = true;
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        if lanes.get(&stream).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
            lanes.remove(&stream);
        }
        tracing::debug!(stream_id = %stream, last_seq = guard.last, "sequence lane released");
        true
    }

    pub async fn next_seq(&self, stream: StreamId) -> Result<i64, ApplicationError> {
        let mut lane = self.acquire(stream).await?;
        Ok(lane.next())
    }

    pub async fn current(&self, stream: StreamId) -> Result<i64, ApplicationError> {
        Ok(self.acquire(stream).await?.current())
    }

    /// 从存储中按页读取 `seq > last_seq` 的信封；给出 `until` 时不超过该序列号
    pub fn resume_from(&self, stream: StreamId, last_seq: i64, until: Option<i64>) -> ReplayStream {
        Box::pin(replay(
            self.store.clone(),
            stream,
            last_seq,
            until,
            self.page_size,
        ))
    }
}

fn replay(
    store: Arc<dyn EnvelopeStore>,
    stream: StreamId,
    last_seq: i64,
    until: Option<i64>,
    page_size: usize,
) -> impl Stream<Item = Result<Envelope, ApplicationError>> + Send + 'static {
    try_stream! {
        let mut cursor = last_seq.max(0);
        'pages: loop {
            let page = store
                .live_after(stream, cursor, page_size)
                .await
                .map_err(ApplicationError::from)?;
            let exhausted = page.len() < page_size;
            let before = cursor;

            for envelope in page {
                let Some(seq) = envelope.seq else { continue };
                if seq <= cursor {
                    continue;
                }
                if until.is_some_and(|high| seq > high) {
                    break 'pages;
                }
                cursor = seq;
                yield envelope;
            }

            if exhausted || cursor == before {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryEnvelopeStore;
    use chrono::Utc;
    use domain::{MessageBody, MessageId, Payload, Scope};
    use futures_util::TryStreamExt;

    fn live(stream: StreamId, seq: i64) -> Envelope {
        Envelope {
            id: MessageId::new_v4(),
            scope: Scope::Live(stream),
            sender: None,
            receiver: None,
            created_at: Utc::now(),
            seq: Some(seq),
            viewer_count: None,
            delivery_status: None,
            payload: Payload::Message(MessageBody::text(format!("#{seq}"))),
        }
    }

    async fn seeded(stream: StreamId, count: i64) -> Arc<MemoryEnvelopeStore> {
        let store = Arc::new(MemoryEnvelopeStore::new());
        for seq in 1..=count {
            store.persist(&live(stream, seq)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn starts_at_one_and_increases() {
        let sequencer = Sequencer::new(Arc::new(MemoryEnvelopeStore::new()), 10);
        let stream = StreamId::new_v4();
        assert_eq!(sequencer.next_seq(stream).await.unwrap(), 1);
        assert_eq!(sequencer.next_seq(stream).await.unwrap(), 2);
        // 不同直播间互不影响
        assert_eq!(sequencer.next_seq(StreamId::new_v4()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reconciles_with_store_after_restart() {
        let stream = StreamId::new_v4();
        let store = seeded(stream, 7).await;
        let sequencer = Sequencer::new(store, 10);
        assert_eq!(sequencer.current(stream).await.unwrap(), 7);
        assert_eq!(sequencer.next_seq(stream).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn reconcile_failure_is_reported() {
        let store = Arc::new(MemoryEnvelopeStore::new());
        store.set_unavailable(true);
        let sequencer = Sequencer::new(store.clone(), 10);
        let stream = StreamId::new_v4();

        let err = sequencer.next_seq(stream).await.unwrap_err();
        assert!(matches!(err, ApplicationError::PersistenceFailure(_)));

        store.set_unavailable(false);
        assert_eq!(sequencer.next_seq(stream).await.unwrap(), 1);
    }

    fn lane_count(sequencer: &Sequencer) -> usize {
        sequencer.lanes.lock().unwrap().len()
    }

    #[tokio::test]
    async fn released_lane_reconciles_on_next_use() {
        let stream = StreamId::new_v4();
        let store = seeded(stream, 3).await;
        let sequencer = Sequencer::new(store.clone(), 10);

        let seq = sequencer.next_seq(stream).await.unwrap();
        assert_eq!(seq, 4);
        store.persist(&live(stream, seq)).await.unwrap();

        assert!(sequencer.release(stream).await);
        assert_eq!(lane_count(&sequencer), 0);
        assert!(!sequencer.release(stream).await);
        assert_eq!(sequencer.next_seq(stream).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn lane_ahead_of_store_is_kept() {
        let stream = StreamId::new_v4();
        let sequencer = Sequencer::new(seeded(stream, 2).await, 10);

        // 3 没有落盘
        assert_eq!(sequencer.next_seq(stream).await.unwrap(), 3);
        assert!(!sequencer.release(stream).await);
        assert_eq!(sequencer.next_seq(stream).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn busy_lane_is_not_released() {
        let stream = StreamId::new_v4();
        let sequencer = Sequencer::new(Arc::new(MemoryEnvelopeStore::new()), 10);

        let lane = sequencer.acquire(stream).await.unwrap();
        assert!(!sequencer.release(stream).await);
        drop(lane);
        assert!(sequencer.release(stream).await);
    }

    #[tokio::test]
    async fn resume_pages_through_store() {
        let stream = StreamId::new_v4();
        let store = seeded(stream, 25).await;
        let sequencer = Sequencer::new(store, 4);

        let replayed: Vec<i64> = sequencer
            .resume_from(stream, 10, None)
            .map_ok(|e| e.seq.unwrap_or_default())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(replayed, (11..=25).collect::<Vec<_>>());

        // 同样的参数再来一次结果相同
        let again: Vec<i64> = sequencer
            .resume_from(stream, 10, None)
            .map_ok(|e| e.seq.unwrap_or_default())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(again, replayed);
    }

    #[tokio::test]
    async fn resume_stops_at_high_water_mark() {
        let stream = StreamId::new_v4();
        let store = seeded(stream, 10).await;
        let sequencer = Sequencer::new(store, 3);

        let replayed: Vec<i64> = sequencer
            .resume_from(stream, 2, Some(6))
            .map_ok(|e| e.seq.unwrap_or_default())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(replayed, vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn resume_past_end_is_empty() {
        let stream = StreamId::new_v4();
        let sequencer = Sequencer::new(seeded(stream, 3).await, 10);
        let replayed: Vec<Envelope> = sequencer
            .resume_from(stream, 3, None)
            .try_collect()
            .await
            .unwrap();
        assert!(replayed.is_empty());
    }
}
