//! 访问目录：配对参与者、直播归属与发送权限
//!
//! 这些信息由外部的用户 / 配对服务维护，中继只读。

use async_trait::async_trait;
use domain::{MatchId, MatchParticipants, Scope, StreamId, UserId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected directory response: {0}")]
    InvalidResponse(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccessDirectory: Send + Sync {
    /// 配对的两名参与者；配对不存在时返回 `None`
    async fn match_participants(
        &self,
        match_id: MatchId,
    ) -> Result<Option<MatchParticipants>, DirectoryError>;

    async fn owns_stream(&self, user: UserId, stream: StreamId) -> Result<bool, DirectoryError>;

    /// 封禁、拉黑等发送限制
    async fn may_send(&self, user: UserId, scope: Scope) -> Result<bool, DirectoryError>;
}

/// 内存实现的访问目录
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use tokio::sync::RwLock;

    #[derive(Default)]
    struct Entries {
        matches: HashMap<MatchId, MatchParticipants>,
        streams: HashMap<StreamId, UserId>,
        restricted: HashSet<UserId>,
    }

    #[derive(Default)]
    pub struct StaticDirectory {
        entries: RwLock<Entries>,
    }

    impl StaticDirectory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_match(mut self, match_id: MatchId, first: UserId, second: UserId) -> Self {
            self.entries
                .get_mut()
                .matches
                .insert(match_id, MatchParticipants::new(first, second));
            self
        }

        pub fn with_stream(mut self, stream: StreamId, owner: UserId) -> Self {
            self.entries.get_mut().streams.insert(stream, owner);
            self
        }

        pub async fn restrict(&self, user: UserId) {
            self.entries.write().await.restricted.insert(user);
        }
    }

    #[async_trait]
    impl AccessDirectory for StaticDirectory {
        async fn match_participants(
            &self,
            match_id: MatchId,
        ) -> Result<Option<MatchParticipants>, DirectoryError> {
            Ok(self.entries.read().await.matches.get(&match_id).copied())
        }

        async fn owns_stream(
            &self,
            user: UserId,
            stream: StreamId,
        ) -> Result<bool, DirectoryError> {
            Ok(self.entries.read().await.streams.get(&stream) == Some(&user))
        }

        async fn may_send(&self, user: UserId, _scope: Scope) -> Result<bool, DirectoryError> {
            Ok(!self.entries.read().await.restricted.contains(&user))
        }
    }
}
