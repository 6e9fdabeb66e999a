//! Redis 键命名

use domain::{MatchId, MessageId, StreamId, UserId};

pub const DEFAULT_KEY_PREFIX: &str = "relay";

/// 带命名空间前缀的键生成器
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// 信封正文，同时充当幂等写入的标记
    pub fn message(&self, id: MessageId) -> String {
        format!("{}:message:{}", self.prefix, id)
    }

    /// 直播间历史（有序集合，分值为序列号）
    pub fn live_history(&self, stream: StreamId) -> String {
        format!("{}:live:{}:history", self.prefix, stream)
    }

    /// 直播间观众（哈希表，用户 -> 连接数）
    pub fn live_viewers(&self, stream: StreamId) -> String {
        format!("{}:live:{}:viewers", self.prefix, stream)
    }

    /// 私聊历史（有序集合，分值为创建时间毫秒）
    pub fn match_history(&self, match_id: MatchId) -> String {
        format!("{}:match:{}:history", self.prefix, match_id)
    }

    /// 某个接收者在私聊中的未读消息集合
    pub fn match_unread(&self, match_id: MatchId, reader: UserId) -> String {
        format!("{}:match:{}:unread:{}", self.prefix, match_id, reader)
    }
}
