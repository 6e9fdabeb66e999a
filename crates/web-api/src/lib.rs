//! Web API 层。
//!
//! 提供 Axum 路由：统一的 WebSocket 聊天入口，以及历史消息、观众数、置顶查询等 REST 接口，
//! 所有请求都委托给应用层的 `RelayService`。

mod auth;
mod error;
mod routes;
mod state;
mod ws_connection;

pub use auth::{Claims, JwtService};
pub use config::JwtConfig;
pub use error::{ApiError, ErrorBody};
pub use routes::router;
pub use state::AppState;
