use std::sync::Arc;
use std::time::Duration;

use application::directory::memory::StaticDirectory;
use application::presence::memory::MemoryPresenceTracker;
use application::repository::memory::MemoryEnvelopeStore;
use application::{
    AccessDirectory, ApplicationError, DirectoryError, EnvelopeStore, NoopPushNotifier,
    PresenceTracker, PushNotifier, RelayServiceDependencies,
};
use config::RelayConfig;
use thiserror::Error;

use crate::directory::HttpDirectory;
use crate::push::WebhookPushNotifier;
use crate::redis::keys::KeySpace;
use crate::redis::{self, RedisEnvelopeStore, RedisError, RedisPresenceTracker};
use crate::retry::{retry_async, Backoff, RetryConfig};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("push notifier error: {0}")]
    Push(#[from] ApplicationError),
}

/// 按配置选择的协作者实现
#[derive(Clone)]
pub struct Infrastructure {
    pub store: Arc<dyn EnvelopeStore>,
    pub presence: Arc<dyn PresenceTracker>,
    pub directory: Arc<dyn AccessDirectory>,
    pub push: Arc<dyn PushNotifier>,
}

impl Infrastructure {
    /// 未配置 Redis 时退回内存实现，未配置目录服务时使用空目录
    pub async fn connect(config: &RelayConfig) -> Result<Self, InfrastructureError> {
        let (store, presence): (Arc<dyn EnvelopeStore>, Arc<dyn PresenceTracker>) =
            match &config.redis {
                Some(redis_config) => {
                    let retry = RetryConfig {
                        max_attempts: 5,
                        backoff: Backoff::exponential(Duration::from_millis(200)),
                    };
                    let conn = retry_async(
                        &retry,
                        |err: &RedisError| matches!(err, RedisError::ConnectionError { .. }),
                        || redis::connect(&redis_config.url),
                    )
                    .await?;
                    let keys = KeySpace::default();
                    (
                        Arc::new(RedisEnvelopeStore::new(
                            conn.clone(),
                            keys.clone(),
                            redis_config.history_ttl_secs,
                        )),
                        Arc::new(RedisPresenceTracker::new(conn, keys)),
                    )
                }
                None => {
                    tracing::warn!("未配置 Redis，历史消息仅保存在内存中");
                    (
                        Arc::new(MemoryEnvelopeStore::new()),
                        Arc::new(MemoryPresenceTracker::new()),
                    )
                }
            };

        let directory: Arc<dyn AccessDirectory> = match &config.directory {
            Some(directory_config) => Arc::new(HttpDirectory::new(directory_config)?),
            None => {
                tracing::warn!("未配置目录服务，所有配对与直播间都将被拒绝（仅用于开发）");
                Arc::new(StaticDirectory::new())
            }
        };

        let push: Arc<dyn PushNotifier> = match &config.push {
            Some(push_config) => Arc::new(WebhookPushNotifier::new(push_config)?),
            None => Arc::new(NoopPushNotifier),
        };

        Ok(Self {
            store,
            presence,
            directory,
            push,
        })
    }

    /// 组装中继服务依赖，其余协作者使用默认实现
    pub fn into_dependencies(self, config: &RelayConfig) -> RelayServiceDependencies {
        let mut deps = RelayServiceDependencies::in_memory(self.directory);
        deps.store = self.store;
        deps.presence = self.presence;
        deps.push = self.push;
        deps.settings = config.relay.clone();
        deps
    }
}
