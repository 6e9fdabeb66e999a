use application::{Connection, ReplayStream};
use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::{ServerFrame, SessionId, WireFrame};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::state::AppState;

/// WebSocket 连接
///
/// 会话在握手阶段已经绑定，这里负责：
/// - 先发送重放流，再转发会话出站队列
/// - 把客户端帧交给中继处理，拒绝的动作回写错误帧
/// - 心跳回应
/// - 连接断开时解绑会话
pub struct WebSocketConnection {
    socket: WebSocket,
    state: AppState,
    connection: Connection,
}

impl WebSocketConnection {
    pub fn new(socket: WebSocket, state: AppState, connection: Connection) -> Self {
        Self {
            socket,
            state,
            connection,
        }
    }

    /// 运行连接主循环，直到任意一端关闭
    pub async fn run(self) {
        let Self {
            socket,
            state,
            connection,
        } = self;
        let Connection {
            session,
            mut outbox,
            replay,
        } = connection;
        let session_id = session.id;

        tracing::info!(
            session = %session_id,
            user_id = %session.user_id(),
            scope = %session.scope,
            "WebSocket 连接已建立"
        );

        let (mut sender, mut incoming) = socket.split();

        // 写操作统一经过命令通道
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        let mut send_task = tokio::spawn(async move {
            if let Some(replay) = replay {
                if drain_replay(replay, &mut sender).await.is_err() {
                    return;
                }
            }

            loop {
                tokio::select! {
                    Some(cmd) = cmd_rx.recv() => {
                        let message = match cmd {
                            WsCommand::SendPong(data) => WsMessage::Pong(data),
                        };
                        if sender.send(message).await.is_err() {
                            tracing::warn!("Failed to send pong message");
                            break;
                        }
                    }
                    frame = outbox.recv() => {
                        let Some(frame) = frame else {
                            break;
                        };
                        let Some(text) = encode_frame(&frame) else {
                            continue;
                        };
                        if sender.send(WsMessage::Text(text.into())).await.is_err() {
                            tracing::warn!("Failed to send text message");
                            break;
                        }
                    }
                }
            }
            tracing::debug!("WebSocket发送任务结束");
        });

        let mut recv_task = {
            let state = state.clone();
            tokio::spawn(async move {
                while let Some(Ok(message)) = incoming.next().await {
                    if handle_incoming(&state, session_id, message, &cmd_tx)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                tracing::debug!("WebSocket接收任务结束");
            })
        };

        // 等待任意一个任务完成（连接断开）
        tokio::select! {
            _ = &mut send_task => recv_task.abort(),
            _ = &mut recv_task => send_task.abort(),
        }

        state.relay.disconnect(session_id).await;
        tracing::info!(session = %session_id, scope = %session.scope, "WebSocket连接已断开，会话已解绑");
    }
}

/// 补发断线期间错过的直播消息
async fn drain_replay<S>(mut replay: ReplayStream, sender: &mut S) -> Result<(), ()>
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    let mut replayed = 0usize;
    while let Some(item) = replay.next().await {
        match item {
            Ok(envelope) => {
                let text = match WireFrame::from(&envelope).to_json() {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(message_id = %envelope.id, error = %err, "重放信封序列化失败");
                        continue;
                    }
                };
                if sender.send(WsMessage::Text(text.into())).await.is_err() {
                    return Err(());
                }
                replayed += 1;
            }
            Err(err) => {
                // 重放中断时客户端会带着最后的序列号再次重连
                tracing::warn!(error = %err, replayed, "重放失败");
                let frame = ServerFrame::error(err.code(), err.to_string());
                if let Some(text) = encode_frame(&frame) {
                    let _ = sender.send(WsMessage::Text(text.into())).await;
                }
                return Err(());
            }
        }
    }
    tracing::debug!(replayed, "重放完成");
    Ok(())
}

fn encode_frame(frame: &ServerFrame) -> Option<String> {
    match frame.to_wire().to_json() {
        Ok(text) => Some(text),
        Err(err) => {
            tracing::warn!(event = frame.event_name(), error = %err, "failed to serialize websocket payload");
            None
        }
    }
}

/// 处理来自客户端的消息
async fn handle_incoming(
    state: &AppState,
    session: SessionId,
    message: WsMessage,
    cmd_tx: &mpsc::Sender<WsCommand>,
) -> Result<(), ()> {
    match message {
        WsMessage::Close(_) => {
            tracing::info!(session = %session, "WebSocket收到关闭消息");
            return Err(());
        }
        WsMessage::Ping(data) => {
            tracing::debug!("收到ping消息，发送pong回应");
            if cmd_tx.send(WsCommand::SendPong(data)).await.is_err() {
                tracing::warn!("Failed to send pong command");
                return Err(());
            }
        }
        WsMessage::Pong(_) => {
            tracing::debug!("收到pong消息");
        }
        WsMessage::Text(text) => {
            if let Err(err) = state.relay.handle_frame(session, text.as_str()).await {
                state.relay.reject(session, &err);
            }
        }
        WsMessage::Binary(_) => {
            tracing::warn!(session = %session, "不支持二进制帧，已丢弃");
        }
    }
    Ok(())
}

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendPong(Bytes),
}
