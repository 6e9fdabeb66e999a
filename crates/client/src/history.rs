//! 私聊历史与 REST 兜底发送

use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use domain::{
    DeliveryStatus, Envelope, MatchId, MessageId, ServerFrame, Timestamp, WireFrame,
};
use reqwest::Client;
use serde::Deserialize;

use crate::error::ClientResult;

const DEFAULT_PAGE_SIZE: usize = 50;

/// REST 发送的受理回执
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeliveryAck {
    pub message_id: MessageId,
    #[serde(rename = "delivery_status")]
    pub status: DeliveryStatus,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoryFetcher: Send + Sync {
    /// 拉取 `before` 之前的一页历史，按时间升序返回
    async fn fetch_private(
        &self,
        match_id: MatchId,
        before: Option<Timestamp>,
    ) -> ClientResult<Vec<Envelope>>;

    /// WebSocket 写失败时的兜底发送
    async fn send_private(&self, match_id: MatchId, frame: WireFrame) -> ClientResult<DeliveryAck>;
}

pub struct RestHistoryFetcher {
    client: Client,
    base_url: String,
    token: String,
    page_size: usize,
}

impl RestHistoryFetcher {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> ClientResult<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    fn messages_url(&self, match_id: MatchId) -> String {
        format!("{}/api/v1/matches/{}/messages", self.base_url, match_id)
    }
}

#[async_trait]
impl HistoryFetcher for RestHistoryFetcher {
    async fn fetch_private(
        &self,
        match_id: MatchId,
        before: Option<Timestamp>,
    ) -> ClientResult<Vec<Envelope>> {
        let mut query = vec![("limit", self.page_size.to_string())];
        if let Some(before) = before {
            query.push(("before", before.to_rfc3339_opts(SecondsFormat::Millis, true)));
        }

        let frames: Vec<WireFrame> = self
            .client
            .get(self.messages_url(match_id))
            .bearer_auth(&self.token)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut envelopes = Vec::with_capacity(frames.len());
        for frame in frames {
            match ServerFrame::try_from(frame) {
                Ok(ServerFrame::Envelope(envelope)) => envelopes.push(envelope),
                Ok(other) => {
                    tracing::debug!(event = other.event_name(), "历史记录中出现非信封帧，已忽略")
                }
                Err(err) => tracing::warn!(match_id = %match_id, error = %err, "丢弃无法解析的历史消息"),
            }
        }
        tracing::debug!(match_id = %match_id, count = envelopes.len(), "已拉取私聊历史");
        Ok(envelopes)
    }

    async fn send_private(&self, match_id: MatchId, frame: WireFrame) -> ClientResult<DeliveryAck> {
        let ack = self
            .client
            .post(self.messages_url(match_id))
            .bearer_auth(&self.token)
            .json(&frame)
            .send()
            .await?
            .error_for_status()?
            .json::<DeliveryAck>()
            .await?;
        Ok(ack)
    }
}
