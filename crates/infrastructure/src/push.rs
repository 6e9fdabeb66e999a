//! 离线推送
//!
//! 私聊消息没有送达任何在线会话时，把摘要 POST 给推送网关。

use std::time::Duration;

use application::{ApplicationError, PushNotifier};
use async_trait::async_trait;
use config::PushConfig;
use domain::{Envelope, MatchId, MessageId, MessageKind, Payload, Timestamp, UserId};
use reqwest::Client;
use serde::Serialize;

const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    recipient_id: UserId,
    message_id: MessageId,
    match_id: Option<MatchId>,
    sender_id: Option<UserId>,
    sender_name: Option<&'a str>,
    preview: String,
    created_at: Timestamp,
}

/// 通知栏里展示的文字
fn preview(envelope: &Envelope) -> String {
    match &envelope.payload {
        Payload::Gift { .. } => "[gift]".to_string(),
        payload => match payload.body() {
            Some(body) if body.kind != MessageKind::Text => format!("[{}]", body.kind.as_str()),
            Some(body) => body
                .content
                .as_deref()
                .unwrap_or_default()
                .chars()
                .take(PREVIEW_CHARS)
                .collect(),
            None => String::new(),
        },
    }
}

pub struct WebhookPushNotifier {
    client: Client,
    webhook_url: String,
}

impl WebhookPushNotifier {
    pub fn new(config: &PushConfig) -> Result<Self, ApplicationError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ApplicationError::infrastructure(format!("构建推送客户端失败: {e}")))?;
        Ok(Self {
            client,
            webhook_url: config.webhook_url.clone(),
        })
    }
}

#[async_trait]
impl PushNotifier for WebhookPushNotifier {
    async fn notify_undelivered(
        &self,
        recipient: UserId,
        envelope: &Envelope,
    ) -> Result<(), ApplicationError> {
        let request = PushRequest {
            recipient_id: recipient,
            message_id: envelope.id,
            match_id: envelope.scope.match_id(),
            sender_id: envelope.sender_id(),
            sender_name: envelope.sender.as_ref().and_then(|s| s.name.as_deref()),
            preview: preview(envelope),
            created_at: envelope.created_at,
        };

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ApplicationError::infrastructure(format!("推送请求失败: {e}")))?;

        if !response.status().is_success() {
            return Err(ApplicationError::infrastructure(format!(
                "推送网关返回 {}",
                response.status()
            )));
        }

        tracing::debug!(recipient = %recipient, message_id = %envelope.id, "已发送离线推送");
        Ok(())
    }
}
