//! 分段规划
//!
//! 把一个文件切分成若干连续、互不重叠的字节区间，每个区间由一个 worker 独立下载。
//! 规划是确定性的：同样的输入总是得到同样的区间，重启后重新规划再叠加已持久化的
//! `bytes_received` 就能精确续传。

use serde::{Deserialize, Serialize};
use std::ops::{Range, RangeInclusive};

/// 分段状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Queued,
    Downloading,
    Completed,
    Stopped,
    Error,
}

/// 分段下载记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadWorkerTask {
    /// `{task_id}-{index}`
    pub id: String,
    /// 所属叶子任务
    pub download_task_id: String,
    /// 分段索引
    pub index: usize,
    /// 字节范围（左闭右开）
    pub range: Range<u64>,
    /// 已接收字节数，始终不超过分段长度
    pub bytes_received: u64,
    /// 当前速度 (bytes/s)
    #[serde(default)]
    pub speed: u64,
    pub status: WorkerStatus,
    #[serde(default)]
    pub error: Option<String>,
}

impl DownloadWorkerTask {
    pub fn new(task_id: &str, index: usize, range: Range<u64>) -> Self {
        let status = if range.is_empty() {
            WorkerStatus::Completed
        } else {
            WorkerStatus::Queued
        };
        Self {
            id: format!("{}-{}", task_id, index),
            download_task_id: task_id.to_string(),
            index,
            range,
            bytes_received: 0,
            speed: 0,
            status,
            error: None,
        }
    }

    /// 分段长度
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 分段首字节
    pub fn start(&self) -> u64 {
        self.range.start
    }

    /// 分段末字节（闭区间）；零长度分段没有末字节
    pub fn end_inclusive(&self) -> Option<u64> {
        if self.range.is_empty() {
            None
        } else {
            Some(self.range.end - 1)
        }
    }

    /// 剩余待下载的闭区间，用于 Range 请求头
    pub fn remaining_range(&self) -> Option<RangeInclusive<u64>> {
        let next = self.next_offset();
        if next >= self.range.end {
            None
        } else {
            Some(next..=self.range.end - 1)
        }
    }

    /// 下一次写入的文件偏移
    pub fn next_offset(&self) -> u64 {
        self.range.start + self.bytes_received
    }

    pub fn remaining(&self) -> u64 {
        self.size().saturating_sub(self.bytes_received)
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_received >= self.size()
    }
}

/// 分段策略：大于阈值的文件切成固定段数，否则只用一段
#[derive(Debug, Clone, Copy)]
pub struct SegmentPlanner {
    pub segment_count: u32,
    pub min_split_size: u64,
}

impl SegmentPlanner {
    pub fn new(segment_count: u32, min_split_size: u64) -> Self {
        Self {
            segment_count: segment_count.max(1),
            min_split_size,
        }
    }

    /// 按策略计算段数
    pub fn segments_for(&self, total_size: u64) -> u64 {
        if total_size == 0 || total_size <= self.min_split_size {
            1
        } else {
            (self.segment_count as u64).min(total_size)
        }
    }

    /// 规划分段区间
    pub fn plan_ranges(&self, total_size: u64) -> Vec<Range<u64>> {
        Self::split(total_size, self.segments_for(total_size))
    }

    /// 等分为 `count` 段，最后一段吸收整除余数
    fn split(total_size: u64, count: u64) -> Vec<Range<u64>> {
        if total_size == 0 {
            return vec![0..0];
        }
        let count = count.clamp(1, total_size);
        let base = total_size / count;
        (0..count)
            .map(|i| {
                let start = i * base;
                let end = if i == count - 1 {
                    total_size
                } else {
                    start + base
                };
                start..end
            })
            .collect()
    }

    /// 为叶子任务生成新的分段记录
    pub fn plan(&self, task_id: &str, total_size: u64) -> Vec<DownloadWorkerTask> {
        self.plan_ranges(total_size)
            .into_iter()
            .enumerate()
            .map(|(index, range)| DownloadWorkerTask::new(task_id, index, range))
            .collect()
    }

    /// 用持久化的分段记录恢复计划
    ///
    /// 以记录中的段数重新规划（不受当前配置影响），区间一致时沿用各段的
    /// `bytes_received`；区间对不上说明记录已损坏，放弃旧进度重新规划。
    pub fn reconcile(
        &self,
        task_id: &str,
        total_size: u64,
        persisted: &[DownloadWorkerTask],
    ) -> Vec<DownloadWorkerTask> {
        if persisted.is_empty() {
            return self.plan(task_id, total_size);
        }

        let mut sorted: Vec<&DownloadWorkerTask> = persisted.iter().collect();
        sorted.sort_by_key(|w| w.index);

        let expected = Self::split(total_size, sorted.len() as u64);
        let matches = expected.len() == sorted.len()
            && expected
                .iter()
                .zip(&sorted)
                .all(|(range, worker)| *range == worker.range);

        if !matches {
            tracing::warn!(
                "任务 {} 的分段记录与文件大小 {} 不一致，重新规划",
                task_id,
                total_size
            );
            return self.plan(task_id, total_size);
        }

        expected
            .into_iter()
            .zip(sorted)
            .enumerate()
            .map(|(index, (range, old))| {
                let mut worker = DownloadWorkerTask::new(task_id, index, range);
                worker.bytes_received = old.bytes_received.min(worker.size());
                worker.status = if worker.is_complete() {
                    WorkerStatus::Completed
                } else {
                    WorkerStatus::Queued
                };
                worker.error = old.error.clone();
                worker
            })
            .collect()
    }
}
