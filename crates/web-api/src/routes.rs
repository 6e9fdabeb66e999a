use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use application::HandshakeParams;
use domain::{
    ClientAction, DeliveryStatus, MatchId, MessageId, PinnedRef, StreamId, Timestamp, WireFrame,
};

use crate::{error::ApiError, state::AppState, ws_connection::WebSocketConnection};

/// WebSocket 握手查询参数
#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
    mode: Option<String>,
    match_id: Option<String>,
    live_stream_id: Option<String>,
    #[serde(default)]
    is_broadcaster: bool,
    last_seq: Option<i64>,
}

impl WsQuery {
    fn into_parts(self) -> (Option<String>, HandshakeParams) {
        (
            self.token,
            HandshakeParams {
                mode: self.mode,
                match_id: self.match_id,
                live_stream_id: self.live_stream_id,
                is_broadcaster: self.is_broadcaster,
                last_seq: self.last_seq,
            },
        )
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    before: Option<Timestamp>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ReceiptResponse {
    message_id: MessageId,
    delivery_status: DeliveryStatus,
}

#[derive(Debug, Serialize)]
struct ViewerCountResponse {
    live_stream_id: StreamId,
    viewer_count: u32,
}

#[derive(Debug, Serialize)]
struct PinnedResponse {
    live_stream_id: StreamId,
    pinned: Option<PinnedRef>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws/chat", get(websocket_upgrade))
        .route(
            "/matches/{match_id}/messages",
            get(private_history).post(send_private_message),
        )
        .route("/live/{stream_id}/viewers", get(viewer_count))
        .route("/live/{stream_id}/pinned", get(pinned_message))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// 统一的聊天入口：先认证、路由并绑定会话，成功后才升级连接
async fn websocket_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let (token, params) = query.into_parts();
    let identity = state
        .jwt_service
        .identity_for_handshake(token.as_deref(), &headers)
        .inspect_err(|err| tracing::warn!(code = err.code(), "WebSocket 握手认证失败"))?;

    let connection = state
        .relay
        .connect(identity, &params)
        .await
        .inspect_err(|err| tracing::warn!(code = err.code(), error = %err, "WebSocket 握手被拒绝"))?;

    let session = connection.session.id;
    let relay = state.relay.clone();
    Ok(ws
        .on_failed_upgrade(move |err| {
            tracing::warn!(session = %session, error = %err, "WebSocket 升级失败，解绑会话");
            tokio::spawn(async move { relay.disconnect(session).await });
        })
        .on_upgrade(move |socket| WebSocketConnection::new(socket, state, connection).run()))
}

async fn private_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(match_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<WireFrame>>, ApiError> {
    let identity = state.jwt_service.identity_from_headers(&headers)?;
    let envelopes = state
        .relay
        .private_history(&identity, MatchId::from(match_id), query.before, query.limit)
        .await?;

    Ok(Json(envelopes.iter().map(WireFrame::from).collect()))
}

/// WebSocket 发送失败时客户端使用的兜底通道，按 `message_id` 幂等
async fn send_private_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(match_id): Path<Uuid>,
    Json(frame): Json<WireFrame>,
) -> Result<(StatusCode, Json<ReceiptResponse>), ApiError> {
    let identity = state.jwt_service.identity_from_headers(&headers)?;
    let action = ClientAction::try_from(frame)?;
    let receipt = state
        .relay
        .send_private_via_rest(&identity, MatchId::from(match_id), action)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ReceiptResponse {
            message_id: receipt.message_id,
            delivery_status: receipt.status,
        }),
    ))
}

async fn viewer_count(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(stream_id): Path<Uuid>,
) -> Result<Json<ViewerCountResponse>, ApiError> {
    state.jwt_service.identity_from_headers(&headers)?;
    let live_stream_id = StreamId::from(stream_id);
    Ok(Json(ViewerCountResponse {
        live_stream_id,
        viewer_count: state.relay.viewer_count(live_stream_id).await,
    }))
}

async fn pinned_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(stream_id): Path<Uuid>,
) -> Result<Json<PinnedResponse>, ApiError> {
    state.jwt_service.identity_from_headers(&headers)?;
    let live_stream_id = StreamId::from(stream_id);
    Ok(Json(PinnedResponse {
        live_stream_id,
        pinned: state.relay.pinned(live_stream_id),
    }))
}
