//! 线协议
//!
//! WebSocket 文本帧是扁平的 JSON 对象，同时覆盖私聊和直播两种形态。
//! `WireFrame` 只在协议边界出现：入站帧在这里被校验为 `ClientAction`，
//! 出站的 `ServerFrame` 在这里被展开为扁平结构。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::envelope::{
    DeliveryStatus, Envelope, EventType, MessageBody, MessageKind, Payload, PinChange, Sender,
};
use crate::errors::{DomainError, DomainResult};
use crate::scope::{ChatMode, Scope};
use crate::value_objects::{MatchId, MessageId, StreamId, Timestamp, UserId};

/// 服务端确认帧的事件名
pub const DELIVERY_STATUS_EVENT: &str = "delivery_status";
/// 服务端错误帧的事件名
pub const ERROR_EVENT: &str = "error";

/// 扁平的线协议帧
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ChatMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_stream_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewer_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_pinned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_system: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_typing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gift_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_status: Option<DeliveryStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl WireFrame {
    pub fn parse(text: &str) -> DomainResult<Self> {
        serde_json::from_str(text).map_err(|err| DomainError::malformed(err.to_string()))
    }

    pub fn to_json(&self) -> DomainResult<String> {
        serde_json::to_string(self).map_err(|err| DomainError::malformed(err.to_string()))
    }

    /// 帧中声明的会话范围（若有）
    pub fn addressed_scope(&self) -> Option<Scope> {
        match (self.mode, self.match_id, self.live_stream_id) {
            (Some(ChatMode::Live), _, Some(stream)) | (None, None, Some(stream)) => {
                Some(Scope::Live(StreamId::from(stream)))
            }
            (Some(ChatMode::Private), Some(m), _) | (None, Some(m), None) => {
                Some(Scope::Private(MatchId::from(m)))
            }
            _ => None,
        }
    }

    fn scoped(mut self, scope: Scope) -> Self {
        self.mode = Some(scope.mode());
        match scope {
            Scope::Private(id) => self.match_id = Some(id.into()),
            Scope::Live(id) => self.live_stream_id = Some(id.into()),
        }
        self
    }

    fn message_kind(&self, default: MessageKind) -> DomainResult<MessageKind> {
        self.message_type
            .as_deref()
            .map(str::parse)
            .transpose()
            .map(|kind| kind.unwrap_or(default))
    }

    fn body(&self, default: MessageKind) -> DomainResult<MessageBody> {
        Ok(MessageBody {
            kind: self.message_kind(default)?,
            content: self.content.clone(),
            media_url: self.media_url.clone(),
            metadata: self.metadata.clone(),
        })
    }
}

/// 经过校验的客户端动作
#[derive(Debug, Clone, PartialEq)]
pub struct ClientAction {
    /// 客户端生成的消息 ID，用于幂等去重
    pub message_id: Option<MessageId>,
    /// 帧中声明的范围，必须与连接绑定的范围一致
    pub addressed: Option<Scope>,
    pub payload: Payload,
}

impl ClientAction {
    fn new(payload: Payload) -> Self {
        Self {
            message_id: Some(MessageId::new_v4()),
            addressed: None,
            payload,
        }
    }

    pub fn message(content: impl Into<String>) -> Self {
        Self::new(Payload::Message(MessageBody::text(content)))
    }

    pub fn media(kind: MessageKind, media_url: impl Into<String>) -> Self {
        Self::new(Payload::Message(MessageBody {
            kind,
            media_url: Some(media_url.into()),
            ..Default::default()
        }))
    }

    pub fn gift(gift_id: impl Into<String>) -> Self {
        Self::new(Payload::Gift {
            gift_id: gift_id.into(),
            body: MessageBody {
                kind: MessageKind::Gift,
                ..Default::default()
            },
        })
    }

    pub fn system(content: impl Into<String>) -> Self {
        let mut body = MessageBody::text(content);
        body.kind = MessageKind::System;
        Self::new(Payload::System(body))
    }

    pub fn typing(is_typing: bool) -> Self {
        Self {
            message_id: None,
            ..Self::new(Payload::Typing { is_typing })
        }
    }

    pub fn read_receipt() -> Self {
        Self {
            message_id: None,
            ..Self::new(Payload::ReadReceipt { message_id: None })
        }
    }

    pub fn pin(target: MessageId, content: Option<String>) -> Self {
        Self::new(Payload::Pin(PinChange {
            target: Some(target),
            content,
            pinned: true,
        }))
    }

    pub fn unpin() -> Self {
        Self::new(Payload::Pin(PinChange {
            target: None,
            content: None,
            pinned: false,
        }))
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// 解析并校验一条客户端文本帧
    pub fn parse(text: &str) -> DomainResult<Self> {
        Self::try_from(WireFrame::parse(text)?)
    }

    /// 检查动作能否在给定范围内执行
    pub fn validate_for(&self, bound: Scope) -> DomainResult<()> {
        if let Some(addressed) = self.addressed {
            if addressed != bound {
                return Err(DomainError::ScopeMismatch {
                    addressed: addressed.to_string(),
                    bound: bound.to_string(),
                });
            }
        }

        let event = self.event_type();
        let allowed = match bound.mode() {
            ChatMode::Private => matches!(
                event,
                EventType::Message | EventType::Gift | EventType::Typing | EventType::ReadReceipt
            ),
            ChatMode::Live => matches!(
                event,
                EventType::Message | EventType::Gift | EventType::Pin | EventType::System
            ),
        };
        if !allowed {
            return Err(DomainError::ModeMismatch {
                event: event.as_str(),
                mode: bound.mode().as_str(),
            });
        }
        Ok(())
    }

    /// 编码为发往服务端的线协议帧
    pub fn to_wire(&self, scope: Scope) -> WireFrame {
        let mut frame = WireFrame {
            event: self.event_type().as_str().to_string(),
            message_id: self.message_id.map(Uuid::from),
            timestamp: Some(Utc::now()),
            ..Default::default()
        }
        .scoped(scope);

        match &self.payload {
            Payload::Message(body) | Payload::System(body) => apply_body(&mut frame, body),
            Payload::Gift { gift_id, body } => {
                apply_body(&mut frame, body);
                frame.gift_id = Some(gift_id.clone());
            }
            Payload::Pin(change) => {
                frame.message_id = change.target.map(Uuid::from);
                frame.content = change.content.clone();
                frame.is_pinned = Some(change.pinned);
            }
            Payload::Typing { is_typing } => frame.is_typing = Some(*is_typing),
            Payload::ReadReceipt { message_id } => frame.message_id = message_id.map(Uuid::from),
            Payload::Join | Payload::Leave => {}
        }
        frame
    }
}

impl TryFrom<WireFrame> for ClientAction {
    type Error = DomainError;

    fn try_from(frame: WireFrame) -> Result<Self, Self::Error> {
        let event: EventType = frame.event.parse()?;
        let message_id = frame.message_id.map(MessageId::from);
        let addressed = frame.addressed_scope();

        let (message_id, payload) = match event {
            EventType::Message => {
                let body = frame.body(MessageKind::Text)?;
                if body.is_empty() {
                    return Err(DomainError::missing("message", "content"));
                }
                (message_id, Payload::Message(body))
            }
            EventType::Gift => {
                let gift_id = frame
                    .gift_id
                    .clone()
                    .filter(|id| !id.trim().is_empty())
                    .ok_or_else(|| DomainError::missing("gift", "gift_id"))?;
                let body = frame.body(MessageKind::Gift)?;
                (message_id, Payload::Gift { gift_id, body })
            }
            EventType::System => {
                let body = frame.body(MessageKind::System)?;
                if body.is_empty() {
                    return Err(DomainError::missing("system", "content"));
                }
                (message_id, Payload::System(body))
            }
            EventType::Pin => {
                let pinned = frame.is_pinned.unwrap_or(true);
                if pinned && message_id.is_none() && frame.content.is_none() {
                    return Err(DomainError::missing("pin", "message_id"));
                }
                // 置顶帧中的 message_id 指向被置顶的消息，不是帧本身的 ID
                let change = PinChange {
                    target: message_id,
                    content: frame.content.clone(),
                    pinned,
                };
                (None, Payload::Pin(change))
            }
            EventType::Typing => (
                None,
                Payload::Typing {
                    is_typing: frame.is_typing.unwrap_or(true),
                },
            ),
            EventType::ReadReceipt => (None, Payload::ReadReceipt { message_id }),
            EventType::Join | EventType::Leave => {
                return Err(DomainError::UnsupportedEventType(frame.event))
            }
        };

        Ok(Self {
            message_id,
            addressed,
            payload,
        })
    }
}

fn apply_body(frame: &mut WireFrame, body: &MessageBody) {
    frame.message_type = Some(body.kind.as_str().to_string());
    frame.content = body.content.clone();
    frame.media_url = body.media_url.clone();
    frame.metadata = body.metadata.clone();
}

/// 服务端发往客户端的帧
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Envelope(Envelope),
    /// 私聊消息的送达确认，只发给发送者
    Delivery {
        scope: Scope,
        message_id: MessageId,
        status: DeliveryStatus,
        at: Timestamp,
    },
    /// 被拒绝动作的回执，只发给发起者
    Error {
        code: String,
        message: String,
        at: Timestamp,
    },
}

impl ServerFrame {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: code.into(),
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            ServerFrame::Envelope(envelope) => envelope.event_type().as_str(),
            ServerFrame::Delivery { .. } => DELIVERY_STATUS_EVENT,
            ServerFrame::Error { .. } => ERROR_EVENT,
        }
    }

    pub fn scope(&self) -> Option<Scope> {
        match self {
            ServerFrame::Envelope(envelope) => Some(envelope.scope),
            ServerFrame::Delivery { scope, .. } => Some(*scope),
            ServerFrame::Error { .. } => None,
        }
    }

    pub fn seq(&self) -> Option<i64> {
        match self {
            ServerFrame::Envelope(envelope) => envelope.seq,
            _ => None,
        }
    }

    pub fn to_wire(&self) -> WireFrame {
        WireFrame::from(self)
    }
}

impl From<&Envelope> for WireFrame {
    fn from(envelope: &Envelope) -> Self {
        let mut frame = WireFrame {
            event: envelope.event_type().as_str().to_string(),
            message_id: Some(envelope.id.into()),
            timestamp: Some(envelope.created_at),
            seq: envelope.seq,
            viewer_count: envelope.viewer_count,
            receiver_id: envelope.receiver.map(Uuid::from),
            delivery_status: envelope.delivery_status,
            ..Default::default()
        }
        .scoped(envelope.scope);

        if let Some(sender) = &envelope.sender {
            frame.sender_id = Some(sender.user_id.into());
            frame.sender_name = sender.name.clone();
            frame.sender_avatar = sender.avatar.clone();
        }

        match &envelope.payload {
            Payload::Message(body) => apply_body(&mut frame, body),
            Payload::System(body) => {
                apply_body(&mut frame, body);
                frame.is_system = Some(true);
            }
            Payload::Gift { gift_id, body } => {
                apply_body(&mut frame, body);
                frame.gift_id = Some(gift_id.clone());
            }
            Payload::Pin(change) => {
                frame.content = change.content.clone();
                frame.is_pinned = Some(change.pinned);
                // 被置顶消息的 ID 放在 metadata 中，message_id 保留给信封本身
                if let Some(target) = change.target {
                    let mut meta = Map::new();
                    meta.insert("pinned_message_id".into(), Value::String(target.to_string()));
                    frame.metadata = Some(meta);
                }
            }
            Payload::Typing { is_typing } => frame.is_typing = Some(*is_typing),
            Payload::ReadReceipt { message_id } => {
                if let Some(target) = message_id {
                    frame.message_id = Some((*target).into());
                }
            }
            Payload::Join | Payload::Leave => {}
        }
        frame
    }
}

impl From<&ServerFrame> for WireFrame {
    fn from(frame: &ServerFrame) -> Self {
        match frame {
            ServerFrame::Envelope(envelope) => WireFrame::from(envelope),
            ServerFrame::Delivery {
                scope,
                message_id,
                status,
                at,
            } => WireFrame {
                event: DELIVERY_STATUS_EVENT.to_string(),
                message_id: Some((*message_id).into()),
                delivery_status: Some(*status),
                timestamp: Some(*at),
                ..Default::default()
            }
            .scoped(*scope),
            ServerFrame::Error { code, message, at } => WireFrame {
                event: ERROR_EVENT.to_string(),
                code: Some(code.clone()),
                content: Some(message.clone()),
                timestamp: Some(*at),
                ..Default::default()
            },
        }
    }
}

impl TryFrom<WireFrame> for ServerFrame {
    type Error = DomainError;

    /// 客户端侧解码：把扁平帧还原为带类型的服务端帧
    fn try_from(frame: WireFrame) -> Result<Self, DomainError> {
        let at = frame.timestamp.unwrap_or_else(Utc::now);

        if frame.event == ERROR_EVENT {
            return Ok(ServerFrame::Error {
                code: frame.code.unwrap_or_else(|| "UNKNOWN".to_string()),
                message: frame.content.unwrap_or_default(),
                at,
            });
        }

        let scope = frame
            .addressed_scope()
            .ok_or_else(|| DomainError::missing("frame", "match_id|live_stream_id"))?;
        let message_id = frame
            .message_id
            .map(MessageId::from)
            .ok_or_else(|| DomainError::missing("frame", "message_id"))?;

        if frame.event == DELIVERY_STATUS_EVENT {
            let status = frame
                .delivery_status
                .ok_or_else(|| DomainError::missing(DELIVERY_STATUS_EVENT, "delivery_status"))?;
            return Ok(ServerFrame::Delivery {
                scope,
                message_id,
                status,
                at,
            });
        }

        let event: EventType = frame.event.parse()?;
        let payload = match event {
            EventType::Message => Payload::Message(frame.body(MessageKind::Text)?),
            EventType::System => Payload::System(frame.body(MessageKind::System)?),
            EventType::Gift => Payload::Gift {
                gift_id: frame
                    .gift_id
                    .clone()
                    .ok_or_else(|| DomainError::missing("gift", "gift_id"))?,
                body: frame.body(MessageKind::Gift)?,
            },
            EventType::Pin => Payload::Pin(PinChange {
                target: frame
                    .metadata
                    .as_ref()
                    .and_then(|meta| meta.get("pinned_message_id"))
                    .and_then(Value::as_str)
                    .map(str::parse)
                    .transpose()?,
                content: frame.content.clone(),
                pinned: frame.is_pinned.unwrap_or(true),
            }),
            EventType::Typing => Payload::Typing {
                is_typing: frame.is_typing.unwrap_or(true),
            },
            EventType::ReadReceipt => Payload::ReadReceipt {
                message_id: Some(message_id),
            },
            EventType::Join => Payload::Join,
            EventType::Leave => Payload::Leave,
        };

        let sender = frame.sender_id.map(|id| Sender {
            user_id: UserId::from(id),
            name: frame.sender_name.clone(),
            avatar: frame.sender_avatar.clone(),
        });

        Ok(ServerFrame::Envelope(Envelope {
            id: message_id,
            scope,
            sender,
            receiver: frame.receiver_id.map(UserId::from),
            created_at: at,
            seq: frame.seq,
            viewer_count: frame.viewer_count,
            delivery_status: frame.delivery_status,
            payload,
        }))
    }
}
