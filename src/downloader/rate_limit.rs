//! 服务器级限速（令牌桶）
//!
//! 同一服务器的所有分段 worker 共享一个桶，限速值可在运行时调整，0 表示不限速

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 单次最长等待，避免进度看起来卡死
const MAX_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct SpeedLimiter {
    /// bytes/s，0 = 不限速
    limit_bps: AtomicU64,
    bucket: Mutex<Bucket>,
}

impl SpeedLimiter {
    pub fn new(limit_bps: u64) -> Self {
        Self {
            limit_bps: AtomicU64::new(limit_bps),
            bucket: Mutex::new(Bucket {
                tokens: limit_bps as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// 按 KB/s 创建
    pub fn from_kbps(kbps: u64) -> Self {
        Self::new(kbps.saturating_mul(1024))
    }

    pub fn limit_bps(&self) -> u64 {
        self.limit_bps.load(Ordering::Relaxed)
    }

    pub fn set_limit_kbps(&self, kbps: u64) {
        let limit = kbps.saturating_mul(1024);
        self.limit_bps.store(limit, Ordering::Relaxed);
        let mut bucket = self.bucket.lock();
        bucket.tokens = bucket.tokens.min(limit as f64);
    }

    /// 消耗令牌，不够时返回需要等待的时长
    fn reserve(&self, bytes: u64) -> Option<Duration> {
        let limit = self.limit_bps();
        if limit == 0 {
            return None;
        }

        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        // 最多积攒 1 秒的令牌
        bucket.tokens = (bucket.tokens + elapsed * limit as f64).min(limit as f64);
        bucket.last_refill = now;
        bucket.tokens -= bytes as f64;

        if bucket.tokens >= 0.0 {
            None
        } else {
            let wait = Duration::from_secs_f64(-bucket.tokens / limit as f64);
            Some(wait.min(MAX_WAIT))
        }
    }

    /// 为刚收到的 `bytes` 字节限速
    pub async fn acquire(&self, bytes: u64) {
        if let Some(wait) = self.reserve(bytes) {
            if wait > Duration::from_millis(1) {
                tokio::time::sleep(wait).await;
            }
        }
    }
}
