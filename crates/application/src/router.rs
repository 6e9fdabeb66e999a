//! 范围路由
//!
//! 把握手参数解析为会话范围和角色，并在登记表中绑定会话。

use std::sync::Arc;

use domain::{ChatMode, Identity, MatchId, MatchParticipants, Role, Scope, StreamId};
use serde::Deserialize;

use crate::directory::AccessDirectory;
use crate::error::ApplicationError;
use crate::registry::{BindRequest, Outbox, SessionInfo, SessionRegistry};

/// WebSocket 握手的查询参数（token 由认证层单独处理）
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HandshakeParams {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub match_id: Option<String>,
    #[serde(default)]
    pub live_stream_id: Option<String>,
    #[serde(default)]
    pub is_broadcaster: bool,
    #[serde(default)]
    pub last_seq: Option<i64>,
}

impl HandshakeParams {
    pub fn private(match_id: MatchId) -> Self {
        Self {
            mode: Some(ChatMode::Private.as_str().to_string()),
            match_id: Some(match_id.to_string()),
            ..Default::default()
        }
    }

    pub fn live(stream: StreamId) -> Self {
        Self {
            mode: Some(ChatMode::Live.as_str().to_string()),
            live_stream_id: Some(stream.to_string()),
            ..Default::default()
        }
    }

    pub fn as_broadcaster(mut self) -> Self {
        self.is_broadcaster = true;
        self
    }

    pub fn resume_after(mut self, last_seq: i64) -> Self {
        self.last_seq = Some(last_seq);
        self
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// 路由结果
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub scope: Scope,
    pub role: Role,
    /// 直播间重连时客户端最后看到的序列号
    pub last_seq: Option<i64>,
    pub participants: Option<MatchParticipants>,
}

pub struct ScopeRouter {
    directory: Arc<dyn AccessDirectory>,
    registry: Arc<SessionRegistry>,
}

impl ScopeRouter {
    pub fn new(directory: Arc<dyn AccessDirectory>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            directory,
            registry,
        }
    }

    pub async fn resolve(
        &self,
        identity: &Identity,
        params: &HandshakeParams,
    ) -> Result<Route, ApplicationError> {
        let mode = match non_empty(&params.mode) {
            None => ChatMode::Private,
            Some(raw) => raw
                .parse::<ChatMode>()
                .map_err(|_| ApplicationError::InvalidScope(format!("unknown mode `{raw}`")))?,
        };

        match mode {
            ChatMode::Private => {
                let raw = non_empty(&params.match_id).ok_or_else(|| {
                    ApplicationError::InvalidScope("private mode requires match_id".into())
                })?;
                let match_id: MatchId = raw
                    .parse()
                    .map_err(|_| ApplicationError::InvalidScope(format!("invalid match_id `{raw}`")))?;
                let participants = self
                    .directory
                    .match_participants(match_id)
                    .await?
                    .ok_or_else(|| ApplicationError::InvalidScope(format!("unknown match {match_id}")))?;
                if !participants.contains(identity.user_id) {
                    return Err(ApplicationError::InvalidScope(format!(
                        "user {} is not a participant of match {match_id}",
                        identity.user_id
                    )));
                }
                Ok(Route {
                    scope: Scope::Private(match_id),
                    role: Role::Participant,
                    last_seq: None,
                    participants: Some(participants),
                })
            }
            ChatMode::Live => {
                let raw = non_empty(&params.live_stream_id).ok_or_else(|| {
                    ApplicationError::InvalidScope("live mode requires live_stream_id".into())
                })?;
                let stream: StreamId = raw.parse().map_err(|_| {
                    ApplicationError::InvalidScope(format!("invalid live_stream_id `{raw}`"))
                })?;

                let role = if params.is_broadcaster
                    && self.directory.owns_stream(identity.user_id, stream).await?
                {
                    Role::Broadcaster
                } else {
                    if params.is_broadcaster {
                        tracing::info!(
                            user_id = %identity.user_id,
                            stream_id = %stream,
                            "broadcaster flag without stream ownership, joining as participant"
                        );
                    }
                    Role::Participant
                };

                Ok(Route {
                    scope: Scope::Live(stream),
                    role,
                    last_seq: params.last_seq.map(|seq| seq.max(0)),
                    participants: None,
                })
            }
        }
    }

    /// 在登记表中绑定一个新会话
    pub fn bind(
        &self,
        identity: &Identity,
        route: &Route,
        outbox: Outbox,
    ) -> Result<Arc<SessionInfo>, ApplicationError> {
        self.registry.bind(BindRequest {
            session: self.registry.allocate_id(),
            identity: identity.clone(),
            scope: route.scope,
            role: route.role,
            participants: route.participants,
            outbox,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MockAccessDirectory;
    use domain::UserId;
    use tokio::sync::mpsc;

    fn router(directory: MockAccessDirectory) -> ScopeRouter {
        ScopeRouter::new(Arc::new(directory), Arc::new(SessionRegistry::default()))
    }

    #[tokio::test]
    async fn missing_mode_defaults_to_private() {
        let me = UserId::new_v4();
        let match_id = MatchId::new_v4();
        let mut directory = MockAccessDirectory::new();
        directory
            .expect_match_participants()
            .returning(move |_| Ok(Some(MatchParticipants::new(me, UserId::new_v4()))));

        let params = HandshakeParams {
            match_id: Some(match_id.to_string()),
            ..Default::default()
        };
        let route = router(directory)
            .resolve(&Identity::new(me), &params)
            .await
            .unwrap();
        assert_eq!(route.scope, Scope::Private(match_id));
        assert_eq!(route.role, Role::Participant);
    }

    #[tokio::test]
    async fn private_without_match_id_is_invalid() {
        let err = router(MockAccessDirectory::new())
            .resolve(&Identity::new(UserId::new_v4()), &HandshakeParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::InvalidScope(_)));
    }

    #[tokio::test]
    async fn live_without_stream_id_is_invalid() {
        let params = HandshakeParams {
            mode: Some("live".into()),
            live_stream_id: Some("  ".into()),
            ..Default::default()
        };
        let err = router(MockAccessDirectory::new())
            .resolve(&Identity::new(UserId::new_v4()), &params)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::InvalidScope(_)));
    }

    #[tokio::test]
    async fn outsider_cannot_join_match() {
        let mut directory = MockAccessDirectory::new();
        directory.expect_match_participants().returning(|_| {
            Ok(Some(MatchParticipants::new(
                UserId::new_v4(),
                UserId::new_v4(),
            )))
        });

        let err = router(directory)
            .resolve(
                &Identity::new(UserId::new_v4()),
                &HandshakeParams::private(MatchId::new_v4()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::InvalidScope(_)));
    }

    #[tokio::test]
    async fn broadcaster_flag_requires_ownership() {
        let mut directory = MockAccessDirectory::new();
        directory.expect_owns_stream().times(1).returning(|_, _| Ok(false));

        let stream = StreamId::new_v4();
        let route = router(directory)
            .resolve(
                &Identity::new(UserId::new_v4()),
                &HandshakeParams::live(stream).as_broadcaster(),
            )
            .await
            .unwrap();
        assert_eq!(route.scope, Scope::Live(stream));
        assert_eq!(route.role, Role::Participant);
    }

    #[tokio::test]
    async fn owner_becomes_broadcaster_and_is_bound() {
        let mut directory = MockAccessDirectory::new();
        directory.expect_owns_stream().returning(|_, _| Ok(true));
        let router = router(directory);
        let (tx, _rx) = mpsc::channel(4);

        let stream = StreamId::new_v4();
        let owner = Identity::new(UserId::new_v4());
        let route = router
            .resolve(&owner, &HandshakeParams::live(stream).as_broadcaster().resume_after(-3))
            .await
            .unwrap();
        let session = router.bind(&owner, &route, tx).unwrap();
        assert_eq!(route.role, Role::Broadcaster);
        assert_eq!(route.last_seq, Some(0));
        assert_eq!(router.registry.role_of(session.id), Some(Role::Broadcaster));
    }
}
