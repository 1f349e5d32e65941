use std::time::Duration;

/// 重连退避策略：指数增长，封顶于 `max`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// 第 `attempt` 次失败后的等待时间（从 1 开始计数）
    pub fn delay_at(&self, attempt: u32) -> Duration {
        let exp = std::cmp::min(attempt.saturating_sub(1), 20);
        let factor = 1u32 << exp;
        std::cmp::min(self.base.saturating_mul(factor), self.max)
    }
}
