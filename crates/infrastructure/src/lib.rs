//! 基础设施层实现。
//!
//! 提供 Redis 信封存储与观众计数、外部访问目录、离线推送等适配器，
//! 实现应用层定义的协作者接口。

pub mod builder;
pub mod directory;
pub mod push;
pub mod redis;
pub mod retry;

pub use builder::{Infrastructure, InfrastructureError};
pub use directory::HttpDirectory;
pub use push::WebhookPushNotifier;
pub use crate::redis::{RedisEnvelopeStore, RedisError, RedisPresenceTracker, RedisResult};
pub use retry::{retry_async, Backoff, RetryConfig};
