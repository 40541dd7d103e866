//! 进度事件节流器
//!
//! 按任务ID分别节流：同一任务两次进度事件之间至少间隔 `interval`。
//! 只由聚合器这一个消费者使用，所以不需要原子操作。

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

#[derive(Debug)]
pub struct ProgressThrottler {
    interval: Duration,
    last_emit: HashMap<String, Instant>,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: HashMap::new(),
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距离该任务上次发布已超过间隔时返回 true 并记录时间
    pub fn should_emit(&mut self, key: &str) -> bool {
        self.should_emit_at(key, Instant::now())
    }

    fn should_emit_at(&mut self, key: &str, now: Instant) -> bool {
        match self.last_emit.get_mut(key) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            Some(last) => {
                *last = now;
                true
            }
            None => {
                self.last_emit.insert(key.to_string(), now);
                true
            }
        }
    }

    /// 任务结束后清理记录
    pub fn forget(&mut self, key: &str) {
        self.last_emit.remove(key);
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
