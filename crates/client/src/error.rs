use domain::DomainError;
use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("连接失败: {0}")]
    Transport(String),

    #[error("HTTP 请求失败: {0}")]
    Http(#[from] reqwest::Error),

    #[error("协议错误: {0}")]
    Protocol(#[from] DomainError),

    #[error("无效的服务地址: {0}")]
    InvalidUrl(String),

    #[error("待发送队列已满（上限 {limit}）")]
    QueueFull { limit: usize },

    #[error("重连 {attempts} 次后仍未成功")]
    ReconnectExhausted { attempts: u32 },

    #[error("连接已关闭")]
    Closed,
}

impl ClientError {
    pub fn transport(message: impl Into<String>) -> Self {
        ClientError::Transport(message.into())
    }
}
