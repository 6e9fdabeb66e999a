//! 会话登记表
//!
//! 按连接 ID、用户和范围三个维度索引在线会话。所有操作都是非阻塞的：
//! 索引由一把读写锁保护，每个范围的成员与置顶状态由各自的互斥锁保护，
//! 锁都不会跨越 `.await`。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use domain::{
    ChatMode, Identity, MatchParticipants, PinnedRef, Role, Scope, ServerFrame, SessionId, UserId,
};
use tokio::sync::mpsc;

use crate::error::ApplicationError;

/// 会话的出站队列
pub type Outbox = mpsc::Sender<Arc<ServerFrame>>;

/// 同一用户能否同时出现在多个同类范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresencePolicy {
    pub exclusive_live: bool,
    pub exclusive_private: bool,
}

impl PresencePolicy {
    fn is_exclusive(&self, mode: ChatMode) -> bool {
        match mode {
            ChatMode::Live => self.exclusive_live,
            ChatMode::Private => self.exclusive_private,
        }
    }
}

impl Default for PresencePolicy {
    fn default() -> Self {
        Self {
            exclusive_live: true,
            exclusive_private: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub identity: Identity,
    pub scope: Scope,
    pub role: Role,
    /// 私聊范围的两名参与者
    pub participants: Option<MatchParticipants>,
}

impl SessionInfo {
    pub fn user_id(&self) -> UserId {
        self.identity.user_id
    }

    /// 私聊中的另一方
    pub fn counterpart(&self) -> Option<UserId> {
        self.participants
            .and_then(|pair| pair.other(self.identity.user_id))
    }
}

pub struct BindRequest {
    pub session: SessionId,
    pub identity: Identity,
    pub scope: Scope,
    pub role: Role,
    pub participants: Option<MatchParticipants>,
    pub outbox: Outbox,
}

/// 一次扇出的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub dropped: usize,
    /// 因出站队列溢出被移出直播间的会话
    pub evicted: usize,
}

struct Member {
    info: Arc<SessionInfo>,
    outbox: Outbox,
}

#[derive(Default)]
struct ScopeState {
    members: HashMap<SessionId, Member>,
    /// 观众（非广播者）按用户计数的连接数
    viewers: HashMap<UserId, usize>,
    pinned: Option<PinnedRef>,
}

impl ScopeState {
    /// 没有成员、没有待解绑的观众、也没有置顶时可以回收
    fn is_idle(&self) -> bool {
        self.members.is_empty() && self.viewers.is_empty() && self.pinned.is_none()
    }
}

#[derive(Default)]
struct ScopeSlot {
    state: Mutex<ScopeState>,
}

impl ScopeSlot {
    fn lock(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Arc<SessionInfo>>,
    by_user: HashMap<UserId, HashSet<SessionId>>,
    scopes: HashMap<Scope, Arc<ScopeSlot>>,
}

pub struct SessionRegistry {
    policy: PresencePolicy,
    next_id: AtomicU64,
    inner: RwLock<Inner>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(PresencePolicy::default())
    }
}

impl SessionRegistry {
    pub fn new(policy: PresencePolicy) -> Self {
        Self {
            policy,
            next_id: AtomicU64::new(1),
            inner: RwLock::new(Inner::default()),
        }
    }

    /// 分配新的连接 ID，进程内不会重复
    pub fn allocate_id(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn slot(&self, scope: &Scope) -> Option<Arc<ScopeSlot>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .scopes
            .get(scope)
            .cloned()
    }

    pub fn bind(&self, request: BindRequest) -> Result<Arc<SessionInfo>, ApplicationError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if inner.sessions.contains_key(&request.session) {
            return Err(ApplicationError::SessionAlreadyBound(request.session));
        }

        let user = request.identity.user_id;
        let mode = request.scope.mode();
        if self.policy.is_exclusive(mode) {
            let conflict = inner
                .by_user
                .get(&user)
                .into_iter()
                .flatten()
                .filter_map(|id| inner.sessions.get(id))
                .find(|s| s.scope.mode() == mode && s.scope != request.scope)
                .map(|s| s.scope);
            if let Some(existing) = conflict {
                return Err(ApplicationError::ScopeConflict {
                    user,
                    existing,
                    requested: request.scope,
                });
            }
        }

        let info = Arc::new(SessionInfo {
            id: request.session,
            identity: request.identity,
            scope: request.scope,
            role: request.role,
            participants: request.participants,
        });

        inner.sessions.insert(info.id, info.clone());
        inner.by_user.entry(user).or_default().insert(info.id);
        let slot = inner.scopes.entry(info.scope).or_default().clone();

        let mut state = slot.lock();
        if !info.role.is_broadcaster() {
            *state.viewers.entry(user).or_insert(0) += 1;
        }
        state.members.insert(
            info.id,
            Member {
                info: info.clone(),
                outbox: request.outbox,
            },
        );

        tracing::debug!(session = %info.id, user_id = %user, scope = %info.scope, role = %info.role, "session bound");
        Ok(info)
    }

    /// 解除绑定。最后一个会话离开后回收范围；直播间有置顶时保留。
    pub fn unbind(&self, session: SessionId) -> Option<Arc<SessionInfo>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let info = inner.sessions.remove(&session)?;
        let user = info.identity.user_id;

        if let Some(ids) = inner.by_user.get_mut(&user) {
            ids.remove(&session);
            if ids.is_empty() {
                inner.by_user.remove(&user);
            }
        }

        let mut release = false;
        if let Some(slot) = inner.scopes.get(&info.scope) {
            let mut state = slot.lock();
            state.members.remove(&session);
            if !info.role.is_broadcaster() {
                if let Some(count) = state.viewers.get_mut(&user) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        state.viewers.remove(&user);
                    }
                }
            }
            release = state.is_idle();
        }
        if release {
            inner.scopes.remove(&info.scope);
        }

        tracing::debug!(session = %session, user_id = %user, scope = %info.scope, "session unbound");
        Some(info)
    }

    pub fn session(&self, session: SessionId) -> Option<Arc<SessionInfo>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .get(&session)
            .cloned()
    }

    pub fn role_of(&self, session: SessionId) -> Option<Role> {
        self.session(session).map(|info| info.role)
    }

    pub fn sessions_for(&self, scope: &Scope) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .slot(scope)
            .map(|slot| slot.lock().members.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// 本进程内的观众数（不含广播者）
    pub fn viewer_count(&self, scope: &Scope) -> u32 {
        self.slot(scope)
            .map(|slot| slot.lock().viewers.len() as u32)
            .unwrap_or(0)
    }

    pub fn pinned(&self, scope: &Scope) -> Option<PinnedRef> {
        self.slot(scope).and_then(|slot| slot.lock().pinned.clone())
    }

    /// 替换置顶；只应在持有该范围序列号通道的路径上调用
    pub fn set_pinned(&self, scope: &Scope, pinned: Option<PinnedRef>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let slot = inner.scopes.entry(*scope).or_default().clone();
        let mut state = slot.lock();
        state.pinned = pinned;
        if state.is_idle() {
            drop(state);
            inner.scopes.remove(scope);
        }
    }

    /// 把帧投递给范围内满足条件的会话，不阻塞。
    ///
    /// 队列已满时：私聊丢弃这一帧；直播间把该会话移出成员表并关闭其出站队列，
    /// 客户端断线后带着最后连续的序列号重连续传，不会留下缺口。
    /// 被移出的会话仍保留在登记表中，直到连接关闭时 `unbind`。
    pub fn fan_out<F>(&self, scope: &Scope, frame: Arc<ServerFrame>, mut include: F) -> FanoutReport
    where
        F: FnMut(&SessionInfo) -> bool,
    {
        let mut report = FanoutReport::default();
        let Some(slot) = self.slot(scope) else {
            return report;
        };

        let mut state = slot.lock();
        let mut evicted = Vec::new();
        for (id, member) in &state.members {
            if !include(&member.info) {
                continue;
            }
            match member.outbox.try_send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    report.dropped += 1;
                    if scope.is_live() {
                        evicted.push(*id);
                        tracing::warn!(
                            session = %id,
                            scope = %scope,
                            seq = ?frame.seq(),
                            "outbox full, live session evicted"
                        );
                    } else {
                        tracing::warn!(
                            session = %id,
                            scope = %scope,
                            event = frame.event_name(),
                            "outbox full, frame dropped"
                        );
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(session = %id, "outbox closed, session is leaving");
                }
            }
        }
        // 丢弃发送端即关闭出站队列，已入队的帧仍会被读完
        for id in &evicted {
            state.members.remove(id);
        }
        report.evicted = evicted.len();
        report
    }

    /// 给单个会话发送帧（确认、错误回执）
    pub fn send_to(&self, session: SessionId, frame: ServerFrame) -> bool {
        let Some(info) = self.session(session) else {
            return false;
        };
        let Some(slot) = self.slot(&info.scope) else {
            return false;
        };
        let state = slot.lock();
        let Some(member) = state.members.get(&session) else {
            return false;
        };
        match member.outbox.try_send(Arc::new(frame)) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(session = %session, error = %err, "failed to queue direct frame");
                false
            }
        }
    }
}
