//! Redis 信封存储
//!
//! 直播间信封以 JSON 作为有序集合成员、序列号作为分值，重放只需一次范围查询。
//! 私聊信封正文单独存放，历史有序集合只保存消息 ID。

use application::{EnvelopeStore, StoreError};
use async_trait::async_trait;
use domain::{Envelope, MatchId, MessageId, Scope, StreamId, Timestamp, UserId};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, warn};

use super::keys::KeySpace;
use super::{RedisError, RedisResult};

/// 幂等写入：消息键已存在时不做任何事
///
/// KEYS[1] 消息键，KEYS[2] 历史有序集合，KEYS[3] 可选的未读集合
/// ARGV[1] 信封 JSON，ARGV[2] 分值，ARGV[3] 历史成员，ARGV[4] 过期秒数，ARGV[5] 消息 ID
const PERSIST_SCRIPT: &str = r#"
if not redis.call('SET', KEYS[1], ARGV[1], 'NX') then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
if KEYS[3] then
  redis.call('SADD', KEYS[3], ARGV[5])
end
local ttl = tonumber(ARGV[4])
if ttl > 0 then
  for _, key in ipairs(KEYS) do
    redis.call('EXPIRE', key, ttl)
  end
end
return 1
"#;

/// 原子地取出并清空未读集合
const DRAIN_UNREAD_SCRIPT: &str = r#"
local ids = redis.call('SMEMBERS', KEYS[1])
redis.call('DEL', KEYS[1])
return ids
"#;

pub(crate) fn encode(envelope: &Envelope) -> RedisResult<String> {
    Ok(serde_json::to_string(envelope)?)
}

pub(crate) fn decode(raw: &str) -> RedisResult<Envelope> {
    Ok(serde_json::from_str(raw)?)
}

/// 私聊历史的分值上界；`before` 本身不包含在结果内
fn history_upper_bound(before: Option<Timestamp>) -> String {
    match before {
        Some(at) => format!("({}", at.timestamp_millis()),
        None => "+inf".to_string(),
    }
}

#[derive(Clone)]
pub struct RedisEnvelopeStore {
    conn: ConnectionManager,
    keys: KeySpace,
    /// 0 表示不过期
    history_ttl_secs: u64,
    persist_script: Script,
    drain_unread_script: Script,
}

impl RedisEnvelopeStore {
    pub fn new(conn: ConnectionManager, keys: KeySpace, history_ttl_secs: Option<u64>) -> Self {
        Self {
            conn,
            keys,
            history_ttl_secs: history_ttl_secs.unwrap_or(0),
            persist_script: Script::new(PERSIST_SCRIPT),
            drain_unread_script: Script::new(DRAIN_UNREAD_SCRIPT),
        }
    }

    async fn persist_live(&self, stream: StreamId, envelope: &Envelope) -> RedisResult<bool> {
        let seq = envelope.seq.ok_or_else(|| RedisError::SerializationError {
            message: format!("live envelope {} has no seq", envelope.id),
        })?;
        let json = encode(envelope)?;

        let mut conn = self.conn.clone();
        let written: i32 = self
            .persist_script
            .key(self.keys.message(envelope.id))
            .key(self.keys.live_history(stream))
            .arg(&json)
            .arg(seq)
            .arg(&json)
            .arg(self.history_ttl_secs)
            .arg(envelope.id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn persist_private(&self, match_id: MatchId, envelope: &Envelope) -> RedisResult<bool> {
        let json = encode(envelope)?;
        let id = envelope.id.to_string();

        let mut invocation = self.persist_script.prepare_invoke();
        invocation
            .key(self.keys.message(envelope.id))
            .key(self.keys.match_history(match_id));
        if let Some(receiver) = envelope.receiver {
            invocation.key(self.keys.match_unread(match_id, receiver));
        }
        invocation
            .arg(&json)
            .arg(envelope.created_at.timestamp_millis())
            .arg(&id)
            .arg(self.history_ttl_secs)
            .arg(&id);

        let mut conn = self.conn.clone();
        let written: i32 = invocation.invoke_async(&mut conn).await?;
        Ok(written == 1)
    }
}

#[async_trait]
impl EnvelopeStore for RedisEnvelopeStore {
    async fn persist(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let written = match envelope.scope {
            Scope::Live(stream) => self.persist_live(stream, envelope).await?,
            Scope::Private(match_id) => self.persist_private(match_id, envelope).await?,
        };
        if !written {
            debug!(message_id = %envelope.id, "信封已存在，忽略重复写入");
        }
        Ok(())
    }

    async fn last_seq(&self, stream: StreamId) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let top: Vec<(String, f64)> = conn
            .zrevrange_withscores(self.keys.live_history(stream), 0, 0)
            .await
            .map_err(RedisError::from)?;
        Ok(top.first().map(|(_, score)| *score as i64).unwrap_or(0))
    }

    async fn live_after(
        &self,
        stream: StreamId,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .zrangebyscore_limit(
                self.keys.live_history(stream),
                format!("({after_seq}"),
                "+inf",
                0,
                limit as isize,
            )
            .await
            .map_err(RedisError::from)?;

        raw.iter()
            .map(|json| decode(json).map_err(StoreError::from))
            .collect()
    }

    async fn private_history(
        &self,
        match_id: MatchId,
        before: Option<Timestamp>,
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrevrangebyscore_limit(
                self.keys.match_history(match_id),
                history_upper_bound(before),
                "-inf",
                0,
                limit as isize,
            )
            .await
            .map_err(RedisError::from)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids
            .iter()
            .filter_map(|id| id.parse::<MessageId>().ok())
            .map(|id| self.keys.message(id))
            .collect();
        let bodies: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;

        let mut envelopes = Vec::with_capacity(bodies.len());
        // 最新的在前，翻转为按时间升序
        for raw in bodies.iter().rev() {
            match raw {
                Some(json) => envelopes.push(decode(json)?),
                None => warn!(match_id = %match_id, "历史索引指向已过期的消息，跳过"),
            }
        }
        Ok(envelopes)
    }

    async fn mark_read(
        &self,
        match_id: MatchId,
        reader: UserId,
    ) -> Result<Vec<MessageId>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = self
            .drain_unread_script
            .key(self.keys.match_unread(match_id, reader))
            .invoke_async(&mut conn)
            .await
            .map_err(RedisError::from)?;

        let mut ids = Vec::with_capacity(raw.len());
        for value in raw {
            match value.parse::<MessageId>() {
                Ok(id) => ids.push(id),
                Err(err) => warn!(match_id = %match_id, error = %err, "未读集合中存在非法消息 ID"),
            }
        }
        Ok(ids)
    }
}
