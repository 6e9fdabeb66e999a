use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

/// 统一的时间戳类型。
pub type Timestamp = DateTime<Utc>;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $field:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new(id: Uuid) -> Self {
                Self(id)
            }

            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|_| DomainError::invalid_id($field, s))
            }
        }
    };
}

uuid_id!(
    /// 用户唯一标识。
    UserId,
    "user_id"
);
uuid_id!(
    /// 配对（私聊会话）唯一标识。
    MatchId,
    "match_id"
);
uuid_id!(
    /// 直播流唯一标识。
    StreamId,
    "live_stream_id"
);
uuid_id!(
    /// 消息唯一标识。
    MessageId,
    "message_id"
);

/// 进程内的连接标识，重连后不会复用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// 已认证的用户身份（由认证服务解析 token 得到）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl Identity {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            display_name: None,
            avatar_url: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar_url = Some(avatar.into());
        self
    }
}

/// 一次配对的两名参与者。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchParticipants {
    pub first: UserId,
    pub second: UserId,
}

impl MatchParticipants {
    pub fn new(first: UserId, second: UserId) -> Self {
        Self { first, second }
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.first == user || self.second == user
    }

    /// 返回对方用户；`user` 不属于该配对时返回 `None`。
    pub fn other(&self, user: UserId) -> Option<UserId> {
        if self.first == user {
            Some(self.second)
        } else if self.second == user {
            Some(self.first)
        } else {
            None
        }
    }
}
