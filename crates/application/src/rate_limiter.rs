use domain::UserId;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// 用户消息配额
#[derive(Debug, Clone)]
pub struct UserQuota {
    /// 当前时间窗口内的消息数量
    pub message_count: u32,
    /// 当前时间窗口的开始时间
    pub window_start: Instant,
}

impl Default for UserQuota {
    fn default() -> Self {
        Self::new()
    }
}

impl UserQuota {
    pub fn new() -> Self {
        Self {
            message_count: 0,
            window_start: Instant::now(),
        }
    }

    /// 重置时间窗口
    pub fn reset_window(&mut self) {
        self.message_count = 0;
        self.window_start = Instant::now();
    }

    /// 检查是否超过限制
    pub fn is_over_limit(&self, max_messages: u32) -> bool {
        self.message_count >= max_messages
    }

    /// 增加消息计数
    pub fn increment(&mut self) {
        self.message_count += 1;
    }
}

/// 限流错误类型
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded: {current}/{max} messages per {window_ms}ms")]
    RateLimitExceeded {
        current: u32,
        max: u32,
        window_ms: u64,
    },
}

/// 直播间消息限流器
///
/// 固定窗口计数，每个用户独立统计。防止单个观众刷屏。
pub struct LiveRateLimiter {
    max_messages: u32,
    window_duration: Duration,
    user_quotas: Mutex<HashMap<UserId, UserQuota>>,
}

impl LiveRateLimiter {
    pub fn new(max_messages: u32, window_duration: Duration) -> Self {
        Self {
            max_messages,
            window_duration,
            user_quotas: Mutex::new(HashMap::new()),
        }
    }

    /// 检查用户是否可以再发送一条消息，允许时计数加一
    pub fn check(&self, user_id: UserId) -> Result<(), RateLimitError> {
        let mut quotas = self
            .user_quotas
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let quota = quotas.entry(user_id).or_default();
        if quota.window_start.elapsed() >= self.window_duration {
            quota.reset_window();
        }

        if quota.is_over_limit(self.max_messages) {
            return Err(RateLimitError::RateLimitExceeded {
                current: quota.message_count,
                max: self.max_messages,
                window_ms: self.window_duration.as_millis() as u64,
            });
        }

        quota.increment();
        Ok(())
    }

    /// 清理过期的配额记录（防止内存泄漏）
    pub fn cleanup_expired_quotas(&self) {
        let window = self.window_duration;
        self.user_quotas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, quota| quota.window_start.elapsed() < window * 2);
    }

    pub fn tracked_users(&self) -> usize {
        self.user_quotas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for LiveRateLimiter {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1)) // 默认每秒5条
    }
}
