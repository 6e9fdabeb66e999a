//! 消息信封
//!
//! 信封是中继分发的基本单元。载荷按事件类型建模为带标签的枚举，
//! 每个变体只携带与之相关的字段。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::DomainError;
use crate::scope::Scope;
use crate::value_objects::{Identity, MessageId, Timestamp, UserId};

/// 事件类型（线协议中的 `type` 字段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    Typing,
    ReadReceipt,
    Join,
    Leave,
    Gift,
    Pin,
    System,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Message => "message",
            EventType::Typing => "typing",
            EventType::ReadReceipt => "read_receipt",
            EventType::Join => "join",
            EventType::Leave => "leave",
            EventType::Gift => "gift",
            EventType::Pin => "pin",
            EventType::System => "system",
        }
    }

    /// 只有广播者才能执行的操作
    pub fn is_privileged(&self) -> bool {
        matches!(self, EventType::Pin | EventType::System)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "message" => EventType::Message,
            "typing" => EventType::Typing,
            "read_receipt" => EventType::ReadReceipt,
            "join" => EventType::Join,
            "leave" => EventType::Leave,
            "gift" => EventType::Gift,
            "pin" => EventType::Pin,
            "system" => EventType::System,
            other => return Err(DomainError::UnsupportedEventType(other.to_string())),
        })
    }
}

/// 消息内容类型（线协议中的 `message_type` 字段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Photo,
    Video,
    Voice,
    Gift,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Photo => "photo",
            MessageKind::Video => "video",
            MessageKind::Voice => "voice",
            MessageKind::Gift => "gift",
            MessageKind::System => "system",
        }
    }
}

impl FromStr for MessageKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "text" => MessageKind::Text,
            "photo" => MessageKind::Photo,
            "video" => MessageKind::Video,
            "voice" => MessageKind::Voice,
            "gift" => MessageKind::Gift,
            "system" => MessageKind::System,
            other => {
                return Err(DomainError::malformed(format!(
                    "unknown message_type `{other}`"
                )))
            }
        })
    }
}

/// 送达状态，按接收者维度跟踪
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

/// 发送者的展示信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub user_id: UserId,
    pub name: Option<String>,
    pub avatar: Option<String>,
}

impl From<&Identity> for Sender {
    fn from(identity: &Identity) -> Self {
        Self {
            user_id: identity.user_id,
            name: identity.display_name.clone(),
            avatar: identity.avatar_url.clone(),
        }
    }
}

/// 文本 / 媒体类消息的正文
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageBody {
    pub kind: MessageKind,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

impl MessageBody {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.as_deref().map_or(true, |c| c.trim().is_empty()) && self.media_url.is_none()
    }
}

/// 置顶变更；`pinned == false` 表示取消置顶
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinChange {
    pub target: Option<MessageId>,
    pub content: Option<String>,
    pub pinned: bool,
}

/// 信封载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Message(MessageBody),
    Gift { gift_id: String, body: MessageBody },
    System(MessageBody),
    Pin(PinChange),
    Typing { is_typing: bool },
    ReadReceipt { message_id: Option<MessageId> },
    Join,
    Leave,
}

impl Payload {
    pub fn event_type(&self) -> EventType {
        match self {
            Payload::Message(_) => EventType::Message,
            Payload::Gift { .. } => EventType::Gift,
            Payload::System(_) => EventType::System,
            Payload::Pin(_) => EventType::Pin,
            Payload::Typing { .. } => EventType::Typing,
            Payload::ReadReceipt { .. } => EventType::ReadReceipt,
            Payload::Join => EventType::Join,
            Payload::Leave => EventType::Leave,
        }
    }

    /// 需要持久化的载荷；临时事件（输入中、进出、回执）只做实时分发
    pub fn is_durable(&self) -> bool {
        matches!(
            self,
            Payload::Message(_) | Payload::Gift { .. } | Payload::System(_) | Payload::Pin(_)
        )
    }

    /// 直播间内需要分配序列号的载荷
    pub fn is_sequenced(&self) -> bool {
        self.is_durable()
    }

    pub fn body(&self) -> Option<&MessageBody> {
        match self {
            Payload::Message(body) | Payload::System(body) => Some(body),
            Payload::Gift { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// 消息信封
///
/// 一旦分配序列号即不可变；送达状态的变化按接收者记录，不回写信封。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    pub scope: Scope,
    pub sender: Option<Sender>,
    pub receiver: Option<UserId>,
    pub created_at: Timestamp,
    /// 仅直播间使用
    pub seq: Option<i64>,
    pub viewer_count: Option<u32>,
    pub delivery_status: Option<DeliveryStatus>,
    pub payload: Payload,
}

impl Envelope {
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn sender_id(&self) -> Option<UserId> {
        self.sender.as_ref().map(|s| s.user_id)
    }
}

/// 直播间当前置顶的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedRef {
    pub message_id: Option<MessageId>,
    pub content: Option<String>,
    pub pinned_by: UserId,
    pub pinned_at: Timestamp,
    pub seq: Option<i64>,
}
