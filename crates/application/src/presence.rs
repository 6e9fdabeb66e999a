use domain::{StreamId, UserId};

use crate::error::ApplicationError;

/// 直播间观众计数
///
/// 同一用户的多个连接只计一次；广播者不计入观众。
#[async_trait::async_trait]
pub trait PresenceTracker: Send + Sync {
    /// 观众连接进入直播间，返回最新观众数
    async fn viewer_joined(&self, stream: StreamId, user: UserId) -> Result<u32, ApplicationError>;

    /// 观众连接离开直播间，返回最新观众数
    async fn viewer_left(&self, stream: StreamId, user: UserId) -> Result<u32, ApplicationError>;

    async fn viewer_count(&self, stream: StreamId) -> Result<u32, ApplicationError>;
}

/// 内存实现的观众计数（用于测试）
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct MemoryPresenceTracker {
        streams: RwLock<HashMap<StreamId, HashMap<UserId, u32>>>,
    }

    impl MemoryPresenceTracker {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait::async_trait]
    impl PresenceTracker for MemoryPresenceTracker {
        async fn viewer_joined(
            &self,
            stream: StreamId,
            user: UserId,
        ) -> Result<u32, ApplicationError> {
            let mut streams = self.streams.write().await;
            let viewers = streams.entry(stream).or_default();
            *viewers.entry(user).or_insert(0) += 1;
            Ok(viewers.len() as u32)
        }

        async fn viewer_left(
            &self,
            stream: StreamId,
            user: UserId,
        ) -> Result<u32, ApplicationError> {
            let mut streams = self.streams.write().await;
            let Some(viewers) = streams.get_mut(&stream) else {
                return Ok(0);
            };
            if let Some(connections) = viewers.get_mut(&user) {
                *connections = connections.saturating_sub(1);
                if *connections == 0 {
                    viewers.remove(&user);
                }
            }
            let count = viewers.len() as u32;
            if viewers.is_empty() {
                streams.remove(&stream);
            }
            Ok(count)
        }

        async fn viewer_count(&self, stream: StreamId) -> Result<u32, ApplicationError> {
            let streams = self.streams.read().await;
            Ok(streams.get(&stream).map(|v| v.len() as u32).unwrap_or(0))
        }
    }

}
