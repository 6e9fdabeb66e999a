//! 领域模型错误定义
//!
//! 协议边界上的校验错误。帧无法解析时归为 `MalformedFrame`，
//! 其余错误表示帧结构合法但内容不满足约束。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 帧不是合法的 JSON 或字段类型错误
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// 客户端不允许发送的事件类型
    #[error("unsupported event type: {0}")]
    UnsupportedEventType(String),

    /// 缺少必需字段
    #[error("missing field `{field}` for `{event}`")]
    MissingField {
        event: &'static str,
        field: &'static str,
    },

    /// 事件类型与会话模式不匹配（例如私聊中的置顶）
    #[error("`{event}` is not allowed in {mode} scope")]
    ModeMismatch {
        event: &'static str,
        mode: &'static str,
    },

    /// 帧声明的会话范围与连接绑定的范围不一致
    #[error("frame addressed to {addressed}, session bound to {bound}")]
    ScopeMismatch { addressed: String, bound: String },

    /// 非法标识
    #[error("invalid {field}: {value}")]
    InvalidId { field: &'static str, value: String },
}

impl DomainError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedFrame(message.into())
    }

    pub fn missing(event: &'static str, field: &'static str) -> Self {
        Self::MissingField { event, field }
    }

    pub fn invalid_id(field: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidId {
            field,
            value: value.into(),
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedFrame(_))
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;
