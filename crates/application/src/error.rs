use domain::{DomainError, Scope, SessionId, UserId};
use thiserror::Error;

use crate::directory::DirectoryError;
use crate::rate_limiter::RateLimitError;
use crate::repository::StoreError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    /// 握手参数无法解析为合法范围，连接在绑定前被拒绝
    #[error("invalid scope: {0}")]
    InvalidScope(String),
    #[error("user {user} already bound to {existing}, cannot join {requested}")]
    ScopeConflict {
        user: UserId,
        existing: Scope,
        requested: Scope,
    },
    #[error("forbidden `{action}`: {reason}")]
    Forbidden {
        action: &'static str,
        reason: &'static str,
    },
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("invalid frame: {0}")]
    Protocol(DomainError),
    #[error("rate limited: {0}")]
    RateLimited(#[from] RateLimitError),
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("session {0} is already bound")]
    SessionAlreadyBound(SessionId),
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("authentication failed")]
    Unauthenticated,
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl ApplicationError {
    /// 创建基础设施错误
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure(message.into())
    }

    pub fn forbidden(action: &'static str, reason: &'static str) -> Self {
        ApplicationError::Forbidden { action, reason }
    }

    /// `error` 帧和 HTTP 响应中使用的错误码
    pub fn code(&self) -> &'static str {
        match self {
            ApplicationError::InvalidScope(_) => "INVALID_SCOPE",
            ApplicationError::ScopeConflict { .. } => "SCOPE_CONFLICT",
            ApplicationError::Forbidden { .. } => "FORBIDDEN",
            ApplicationError::PersistenceFailure(_) | ApplicationError::Store(_) => {
                "PERSISTENCE_FAILURE"
            }
            ApplicationError::MalformedFrame(_) => "MALFORMED_FRAME",
            ApplicationError::Protocol(_) => "INVALID_FRAME",
            ApplicationError::RateLimited(_) => "RATE_LIMITED",
            ApplicationError::UnknownSession(_) | ApplicationError::SessionAlreadyBound(_) => {
                "SESSION_ERROR"
            }
            ApplicationError::Directory(_) => "DIRECTORY_UNAVAILABLE",
            ApplicationError::Unauthenticated => "UNAUTHENTICATED",
            ApplicationError::Infrastructure(_) => "INTERNAL",
        }
    }

    /// 帧级错误，丢弃即可，连接保持打开
    pub fn is_malformed(&self) -> bool {
        matches!(self, ApplicationError::MalformedFrame(_))
    }
}

impl From<DomainError> for ApplicationError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::MalformedFrame(message) => ApplicationError::MalformedFrame(message),
            other => ApplicationError::Protocol(other),
        }
    }
}
