//! 物理连接
//!
//! `Link` 把一条连接抽象成一对文本帧通道：`incoming` 结束表示连接已断开，
//! 向 `outgoing` 发送失败表示写端已断开。

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::{ClientError, ClientResult};

const LINK_BUFFER: usize = 64;

pub struct Link {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> ClientResult<Link>;
}

/// 基于 tokio-tungstenite 的 WebSocket 连接
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> ClientResult<Link> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| ClientError::transport(format!("WebSocket连接失败: {e}")))?;
        let (mut sink, mut source) = stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::channel::<String>(LINK_BUFFER);
        let (incoming_tx, incoming) = mpsc::channel::<String>(LINK_BUFFER);

        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    tracing::warn!(error = %e, "发送WebSocket消息失败");
                    break;
                }
            }
            let _ = sink.close().await;
            tracing::debug!("WebSocket写任务结束");
        });

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if incoming_tx.send(text.as_str().to_owned()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("服务端关闭了WebSocket连接");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "WebSocket读取错误");
                        break;
                    }
                }
            }
            tracing::debug!("WebSocket读任务结束");
        });

        Ok(Link { outgoing, incoming })
    }
}

/// 进程内连接，测试时代替真实服务端
pub mod memory {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;

    /// 服务端一侧的通道。丢弃 `to_client` 即模拟断线，
    /// 只丢弃 `from_client` 则模拟写端失效。
    pub struct ServerEnd {
        pub url: String,
        pub to_client: mpsc::Sender<String>,
        pub from_client: mpsc::Receiver<String>,
    }

    pub struct MemoryTransport {
        accepted: mpsc::UnboundedSender<ServerEnd>,
        refuse: AtomicBool,
        opened: AtomicU32,
    }

    impl MemoryTransport {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
            let (accepted, accepted_rx) = mpsc::unbounded_channel();
            (
                Self {
                    accepted,
                    refuse: AtomicBool::new(false),
                    opened: AtomicU32::new(0),
                },
                accepted_rx,
            )
        }

        pub fn refuse_connections(&self, refuse: bool) {
            self.refuse.store(refuse, Ordering::SeqCst);
        }

        /// 包括被拒绝在内的连接尝试次数
        pub fn open_count(&self) -> u32 {
            self.opened.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn open(&self, url: &str) -> ClientResult<Link> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(ClientError::transport("connection refused"));
            }

            let (to_client, incoming) = mpsc::channel(LINK_BUFFER);
            let (outgoing, from_client) = mpsc::channel(LINK_BUFFER);
            self.accepted
                .send(ServerEnd {
                    url: url.to_string(),
                    to_client,
                    from_client,
                })
                .map_err(|_| ClientError::transport("memory server is gone"))?;
            Ok(Link { outgoing, incoming })
        }
    }
}
