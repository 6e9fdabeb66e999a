use std::sync::Arc;

use domain::{EventType, Scope, SessionId};

use crate::error::ApplicationError;
use crate::registry::SessionRegistry;

/// 特权操作的角色校验
///
/// 置顶 / 取消置顶和系统消息只允许直播间的广播者执行；
/// 其余事件在这里放行，发送限制交给访问目录判断。
pub struct ModerationGate {
    registry: Arc<SessionRegistry>,
}

impl ModerationGate {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn authorize(
        &self,
        session: SessionId,
        action: EventType,
        scope: Scope,
    ) -> Result<(), ApplicationError> {
        let name = action.as_str();
        let Some(info) = self.registry.session(session) else {
            return Err(ApplicationError::forbidden(name, "session is not bound"));
        };
        if info.scope != scope {
            return Err(ApplicationError::forbidden(name, "session is bound to another scope"));
        }

        if !action.is_privileged() {
            return Ok(());
        }
        if !scope.is_live() {
            return Err(ApplicationError::forbidden(name, "only available in live scope"));
        }
        if !info.role.is_broadcaster() {
            tracing::warn!(
                session = %session,
                user_id = %info.identity.user_id,
                scope = %scope,
                action = name,
                "非广播者尝试执行特权操作"
            );
            return Err(ApplicationError::forbidden(name, "broadcaster role required"));
        }
        Ok(())
    }
}
