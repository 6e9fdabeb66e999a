//! 应用层实现。
//!
//! 这里提供中继的核心用例：会话登记、范围路由、直播序列号、
//! 扇出分发与权限校验，以及对外部协作者（存储、目录、推送、在线人数）的抽象。

pub mod clock;
pub mod collaborators;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod moderation;
pub mod presence;
pub mod rate_limiter;
pub mod registry;
pub mod repository;
pub mod router;
pub mod sequencer;
pub mod services;

pub use clock::{Clock, FixedClock, SystemClock};
pub use collaborators::{
    AcceptAllGifts, GiftLedger, NoopPushNotifier, PushNotifier, RelayObserver, TracingObserver,
};
pub use directory::{AccessDirectory, DirectoryError};
pub use dispatcher::{DispatchOutcome, Dispatched, EnvelopeDraft, FanoutDispatcher};
pub use error::ApplicationError;
pub use moderation::ModerationGate;
pub use presence::PresenceTracker;
pub use rate_limiter::{LiveRateLimiter, RateLimitError};
pub use registry::{BindRequest, Outbox, PresencePolicy, SessionInfo, SessionRegistry};
pub use repository::{EnvelopeStore, StoreError};
pub use router::{HandshakeParams, Route, ScopeRouter};
pub use sequencer::{ReplayStream, SequenceLane, Sequencer};
pub use services::{Connection, DeliveryReceipt, RelayService, RelayServiceDependencies};
