//! 中继只向外发出事件的协作者：离线推送、礼物账本、可观测性。

use async_trait::async_trait;
use domain::{Envelope, Scope, UserId};

use crate::error::ApplicationError;
use crate::repository::StoreError;

/// 私聊消息未送达任何在线会话时触发推送
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify_undelivered(
        &self,
        recipient: UserId,
        envelope: &Envelope,
    ) -> Result<(), ApplicationError>;
}

#[derive(Debug, Default)]
pub struct NoopPushNotifier;

#[async_trait]
impl PushNotifier for NoopPushNotifier {
    async fn notify_undelivered(
        &self,
        recipient: UserId,
        envelope: &Envelope,
    ) -> Result<(), ApplicationError> {
        tracing::debug!(recipient = %recipient, message_id = %envelope.id, "push disabled, skipping");
        Ok(())
    }
}

/// 礼物在进入分发前由账本校验（余额、礼物是否存在）
#[async_trait]
pub trait GiftLedger: Send + Sync {
    async fn validate_gift(
        &self,
        sender: UserId,
        scope: Scope,
        gift_id: &str,
    ) -> Result<bool, ApplicationError>;
}

#[derive(Debug, Default)]
pub struct AcceptAllGifts;

#[async_trait]
impl GiftLedger for AcceptAllGifts {
    async fn validate_gift(
        &self,
        _sender: UserId,
        _scope: Scope,
        _gift_id: &str,
    ) -> Result<bool, ApplicationError> {
        Ok(true)
    }
}

/// 可观测性钩子
pub trait RelayObserver: Send + Sync {
    /// 信封已投递但未能持久化
    fn data_loss_risk(&self, envelope: &Envelope, error: &StoreError);

    /// 会话出站队列已满，帧被丢弃
    fn outbox_overflow(&self, _scope: Scope) {}
}

#[derive(Debug, Default)]
pub struct TracingObserver;

impl RelayObserver for TracingObserver {
    fn data_loss_risk(&self, envelope: &Envelope, error: &StoreError) {
        tracing::error!(
            message_id = %envelope.id,
            scope = %envelope.scope,
            seq = ?envelope.seq,
            error = %error,
            "data loss risk: envelope delivered but not persisted"
        );
    }

    fn outbox_overflow(&self, scope: Scope) {
        tracing::warn!(scope = %scope, "出站队列已满，丢弃帧");
    }
}
