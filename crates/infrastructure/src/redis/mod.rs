//! Redis 存储模块
//!
//! 直播间历史按序列号存放在有序集合中，私聊历史按创建时间排序，
//! 观众计数按用户聚合在哈希表中。

pub mod error;
pub mod keys;
pub mod presence;
pub mod store;

// 重新导出
pub use error::*;
pub use presence::RedisPresenceTracker;
pub use store::RedisEnvelopeStore;

use ::redis::aio::ConnectionManager;
use ::redis::Client;

/// 建立带自动重连的 Redis 连接
pub async fn connect(url: &str) -> RedisResult<ConnectionManager> {
    let client = Client::open(url).map_err(|e| RedisError::ConfigError {
        message: format!("创建 Redis 客户端失败: {}", e),
    })?;
    let manager = ConnectionManager::new(client).await?;
    tracing::info!("Redis 连接建立成功");
    Ok(manager)
}
