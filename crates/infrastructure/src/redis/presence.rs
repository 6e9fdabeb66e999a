//! Redis 观众计数
//!
//! 哈希表记录每个用户在直播间的连接数，字段数即观众数，
//! 多个中继实例共享同一份计数。

use application::{ApplicationError, PresenceTracker};
use async_trait::async_trait;
use domain::{StreamId, UserId};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::keys::KeySpace;
use super::RedisError;

const JOIN_SCRIPT: &str = r#"
redis.call('HINCRBY', KEYS[1], ARGV[1], 1)
return redis.call('HLEN', KEYS[1])
"#;

/// 连接数归零时删除字段，多余的离开不会产生负数
const LEAVE_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then
  return redis.call('HLEN', KEYS[1])
end
local remaining = redis.call('HINCRBY', KEYS[1], ARGV[1], -1)
if remaining <= 0 then
  redis.call('HDEL', KEYS[1], ARGV[1])
end
return redis.call('HLEN', KEYS[1])
"#;

#[derive(Clone)]
pub struct RedisPresenceTracker {
    conn: ConnectionManager,
    keys: KeySpace,
    join_script: Script,
    leave_script: Script,
}

impl RedisPresenceTracker {
    pub fn new(conn: ConnectionManager, keys: KeySpace) -> Self {
        Self {
            conn,
            keys,
            join_script: Script::new(JOIN_SCRIPT),
            leave_script: Script::new(LEAVE_SCRIPT),
        }
    }

    async fn run(&self, script: &Script, stream: StreamId, user: UserId) -> Result<u32, RedisError> {
        let mut conn = self.conn.clone();
        let count: u32 = script
            .key(self.keys.live_viewers(stream))
            .arg(user.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl PresenceTracker for RedisPresenceTracker {
    async fn viewer_joined(&self, stream: StreamId, user: UserId) -> Result<u32, ApplicationError> {
        let count = self.run(&self.join_script, stream, user).await?;
        tracing::debug!(stream_id = %stream, user_id = %user, viewer_count = count, "观众进入直播间");
        Ok(count)
    }

    async fn viewer_left(&self, stream: StreamId, user: UserId) -> Result<u32, ApplicationError> {
        let count = self.run(&self.leave_script, stream, user).await?;
        tracing::debug!(stream_id = %stream, user_id = %user, viewer_count = count, "观众离开直播间");
        Ok(count)
    }

    async fn viewer_count(&self, stream: StreamId) -> Result<u32, ApplicationError> {
        let mut conn = self.conn.clone();
        let count: u32 = conn
            .hlen(self.keys.live_viewers(stream))
            .await
            .map_err(RedisError::from)?;
        Ok(count)
    }
}
