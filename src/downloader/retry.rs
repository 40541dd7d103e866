//! 分段重试策略（指数退避，有上限）

use crate::config::DownloadConfig;
use crate::remote::FetchError;
use std::time::Duration;

/// 重试决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 放弃，分段进入 Error
    GiveUp,
    /// 等待后重试剩余区间
    RetryAfter(Duration),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 最大尝试次数（包括首次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DownloadConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            max_attempts: config.max_retries.saturating_add(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// `attempt` 从 1 开始，表示刚刚失败的是第几次尝试
    pub fn decide(&self, attempt: u32, err: &FetchError) -> RetryDecision {
        if attempt >= self.max_attempts || !err.is_transient() {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.backoff(attempt))
    }

    /// base * 2^(attempt-1)，不超过 max_delay
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(exp).min(self.max_delay)
    }
}
