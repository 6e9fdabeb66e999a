//! 聊天中继客户端
//!
//! 每个 `ReconnectController` 实例管理一条物理连接：断线后按指数退避重连，
//! 直播间携带最后的序列号续传，私聊重连后通过 REST 拉取历史。

pub mod backoff;
pub mod controller;
pub mod error;
pub mod history;
pub mod subscriptions;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use controller::{ClientHandshake, ConnectionState, ReconnectController};
pub use error::{ClientError, ClientResult};
pub use history::{DeliveryAck, HistoryFetcher, RestHistoryFetcher};
pub use subscriptions::{Subscription, Topic};
pub use transport::{Link, Transport, WsTransport};
