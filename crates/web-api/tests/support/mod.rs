use std::{net::SocketAddr, sync::Arc, time::Duration};

use application::{directory::memory::StaticDirectory, RelayService, RelayServiceDependencies};
use domain::Identity;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{net::TcpListener, sync::oneshot, time::timeout};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};
use web_api::{router, AppState, JwtConfig, JwtService};

pub type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub jwt: Arc<JwtService>,
    pub relay: Arc<RelayService>,
    _shutdown: oneshot::Sender<()>,
}

impl TestServer {
    pub async fn start(directory: StaticDirectory) -> Self {
        let relay = Arc::new(RelayService::new(RelayServiceDependencies::in_memory(
            Arc::new(directory),
        )));
        let jwt = Arc::new(JwtService::new(JwtConfig {
            secret: "integration-test-secret-0123456789abcdef".to_string(),
            expiration_hours: 1,
        }));
        let app = router(AppState::new(relay.clone(), jwt.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            jwt,
            relay,
            _shutdown: shutdown_tx,
        }
    }

    pub fn token(&self, identity: &Identity) -> String {
        self.jwt.generate_token(identity).expect("token")
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, identity: &Identity, query: &str) -> String {
        format!(
            "ws://{}/api/v1/ws/chat?token={}&{}",
            self.addr,
            self.token(identity),
            query
        )
    }

    pub async fn connect(&self, identity: &Identity, query: &str) -> WsClient {
        let (ws, _) = connect_async(self.ws_url(identity, query))
            .await
            .expect("websocket connect");
        ws
    }
}

pub async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(TungsteniteMessage::Text(value.to_string().into()))
        .await
        .expect("send frame");
}

/// 读取下一个指定类型的帧，跳过其他事件
pub async fn next_of_type(ws: &mut WsClient, event: &str) -> Value {
    timeout(Duration::from_secs(3), async {
        loop {
            let message = ws.next().await.expect("stream open").expect("frame");
            if let TungsteniteMessage::Text(text) = message {
                let value: Value = serde_json::from_str(text.as_str()).expect("json frame");
                if value["type"] == event {
                    return value;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for `{event}` frame"))
}

/// 在给定时间内没有收到指定类型的帧
pub async fn assert_no_frame_of_type(ws: &mut WsClient, event: &str, wait: Duration) {
    let _ = timeout(wait, async {
        while let Some(Ok(message)) = ws.next().await {
            if let TungsteniteMessage::Text(text) = message {
                let value: Value = serde_json::from_str(text.as_str()).expect("json frame");
                assert_ne!(value["type"], event, "unexpected frame: {value}");
            }
        }
    })
    .await;
}
