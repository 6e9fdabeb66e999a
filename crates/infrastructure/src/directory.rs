//! HTTP 访问目录
//!
//! 配对、直播归属和发送限制由用户服务维护，这里通过内部 HTTP 接口查询。

use std::time::Duration;

use application::{AccessDirectory, DirectoryError};
use async_trait::async_trait;
use config::DirectoryConfig;
use domain::{MatchId, MatchParticipants, Scope, StreamId, UserId};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::retry::{retry_async, RetryConfig};

#[derive(Debug, Deserialize)]
struct MatchRecord {
    user1_id: UserId,
    user2_id: UserId,
    #[serde(default = "active_by_default")]
    is_active: bool,
}

fn active_by_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct StreamRecord {
    owner_id: UserId,
}

#[derive(Debug, Deserialize)]
struct RestrictionRecord {
    may_send: bool,
}

pub struct HttpDirectory {
    client: Client,
    base_url: String,
    retry: RetryConfig,
}

impl HttpDirectory {
    pub fn new(config: &DirectoryConfig) -> Result<Self, DirectoryError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| DirectoryError::Unavailable(format!("构建 HTTP 客户端失败: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// GET 请求；404 视为记录不存在，连接失败和 5xx 会重试
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, DirectoryError> {
        let url = format!("{}{}", self.base_url, path);
        retry_async(
            &self.retry,
            |err: &DirectoryError| matches!(err, DirectoryError::Unavailable(_)),
            || self.fetch(&url),
        )
        .await
    }

    async fn fetch<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, DirectoryError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_server_error() {
            return Err(DirectoryError::Unavailable(format!("{url} returned {status}")));
        }
        if !status.is_success() {
            return Err(DirectoryError::InvalidResponse(format!("{url} returned {status}")));
        }

        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|e| DirectoryError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl AccessDirectory for HttpDirectory {
    async fn match_participants(
        &self,
        match_id: MatchId,
    ) -> Result<Option<MatchParticipants>, DirectoryError> {
        let record: Option<MatchRecord> = self
            .get_json(&format!("/internal/matches/{match_id}"))
            .await?;
        Ok(record
            .filter(|m| m.is_active)
            .map(|m| MatchParticipants::new(m.user1_id, m.user2_id)))
    }

    async fn owns_stream(&self, user: UserId, stream: StreamId) -> Result<bool, DirectoryError> {
        let record: Option<StreamRecord> =
            self.get_json(&format!("/internal/live/{stream}")).await?;
        Ok(record.is_some_and(|s| s.owner_id == user))
    }

    async fn may_send(&self, user: UserId, scope: Scope) -> Result<bool, DirectoryError> {
        let record: Option<RestrictionRecord> = self
            .get_json(&format!("/internal/users/{user}/restrictions?scope={scope}"))
            .await?;
        // 没有限制记录即允许发送
        Ok(record.map_or(true, |r| r.may_send))
    }
}
