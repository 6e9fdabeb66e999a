//! 会话范围与角色
//!
//! 一个连接只绑定到一个范围：私聊配对或直播间。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{MatchId, StreamId};

/// 聊天模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    Private,
    Live,
}

impl ChatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMode::Private => "private",
            ChatMode::Live => "live",
        }
    }
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "private" => Ok(ChatMode::Private),
            "live" => Ok(ChatMode::Live),
            other => Err(DomainError::malformed(format!("unknown mode `{other}`"))),
        }
    }
}

/// 可寻址的会话范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", content = "id", rename_all = "snake_case")]
pub enum Scope {
    Private(MatchId),
    Live(StreamId),
}

impl Scope {
    pub fn mode(&self) -> ChatMode {
        match self {
            Scope::Private(_) => ChatMode::Private,
            Scope::Live(_) => ChatMode::Live,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Scope::Live(_))
    }

    pub fn match_id(&self) -> Option<MatchId> {
        match self {
            Scope::Private(id) => Some(*id),
            Scope::Live(_) => None,
        }
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Scope::Live(id) => Some(*id),
            Scope::Private(_) => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Private(id) => write!(f, "private:{id}"),
            Scope::Live(id) => write!(f, "live:{id}"),
        }
    }
}

/// 会话在其范围内的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Participant,
    Broadcaster,
}

impl Role {
    pub fn is_broadcaster(&self) -> bool {
        matches!(self, Role::Broadcaster)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Participant => f.write_str("participant"),
            Role::Broadcaster => f.write_str("broadcaster"),
        }
    }
}
