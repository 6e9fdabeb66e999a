use std::time::Duration;

/// 重连退避策略
///
/// 第 n 次重连前等待 `base_delay * 2^(n-1)`，超过 `max_attempts` 次后停止。
/// 连接保持 `stable_after` 以上视为稳定，计数清零。
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
    pub stable_after: Duration,
    /// 断线期间最多缓存的待发送帧
    pub max_queued: usize,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_attempts: 5,
            stable_after: Duration::from_secs(10),
            max_queued: 256,
        }
    }
}

impl ReconnectPolicy {
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_stable_after(mut self, stable_after: Duration) -> Self {
        self.stable_after = stable_after;
        self
    }

    /// 第 `attempt` 次重连前的等待时间，`attempt` 从 1 开始
    pub fn delay_at(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.base_delay.saturating_mul(1u32 << shift)
    }

    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures > self.max_attempts
    }
}
