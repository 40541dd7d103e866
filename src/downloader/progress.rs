use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 默认滑动窗口: 5 秒
pub const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(5);

/// 速度计算器（滑动窗口）
///
/// 每收到一块数据调用 `add_sample`，`speed()` 返回窗口内的平均速度 (bytes/s)
#[derive(Debug)]
pub struct SpeedCalculator {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    window_bytes: u64,
    started_at: Instant,
}

impl SpeedCalculator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            window_bytes: 0,
            started_at: Instant::now(),
        }
    }

    pub fn with_default_window() -> Self {
        Self::new(DEFAULT_SPEED_WINDOW)
    }

    /// 记录新下载的字节数
    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(Instant::now(), bytes);
    }

    fn add_sample_at(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.window_bytes += bytes;
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(at, bytes)) = self.samples.front() {
            if now.duration_since(at) <= self.window {
                break;
            }
            self.samples.pop_front();
            self.window_bytes -= bytes;
        }
    }

    /// 当前速度 (bytes/s)
    pub fn speed(&mut self) -> u64 {
        self.speed_at(Instant::now())
    }

    fn speed_at(&mut self, now: Instant) -> u64 {
        self.evict(now);
        if self.window_bytes == 0 {
            return 0;
        }
        // 刚开始时窗口没填满，按实际经过时间计算
        let elapsed = now
            .duration_since(self.started_at)
            .min(self.window)
            .as_secs_f64()
            .max(0.001);
        (self.window_bytes as f64 / elapsed) as u64
    }
}
