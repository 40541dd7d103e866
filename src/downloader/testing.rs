//! 测试用的模拟服务器和辅助函数

use super::manager::DownloadManager;
use super::task::DownloadStatus;
use crate::config::DownloadConfig;
use crate::remote::{ByteStream, FetchError, RemoteFetcher, ResourceLocator};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 模拟文件在 `offset` 处的字节
pub(crate) fn byte_at(offset: u64) -> u8 {
    (offset % 251) as u8
}

pub(crate) fn expected_bytes(size: u64) -> Vec<u8> {
    (0..size).map(byte_at).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RangeRequest {
    pub url: String,
    pub start: u64,
    pub end_inclusive: u64,
}

#[derive(Default)]
struct MockState {
    requests: Vec<RangeRequest>,
    /// 到达这些偏移后流挂起
    stalls: HashMap<String, Vec<u64>>,
    /// 到达这些偏移后流提前结束
    truncations: HashMap<String, Vec<u64>>,
    /// 剩余失败次数，u32::MAX 表示一直失败
    failures: HashMap<String, (u32, FetchError)>,
    ignore_end: HashSet<String>,
}

/// 按请求区间生成确定内容的模拟服务器
pub(crate) struct MockFetcher {
    state: Mutex<MockState>,
    chunk_size: u64,
    chunk_delay: Duration,
    bytes_served: Arc<AtomicU64>,
}

impl MockFetcher {
    pub fn new(chunk_size: u64) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            chunk_size: chunk_size.max(1),
            chunk_delay: Duration::ZERO,
            bytes_served: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn stall_at(&self, url: &str, offset: u64) {
        self.state
            .lock()
            .stalls
            .entry(url.to_string())
            .or_default()
            .push(offset);
    }

    pub fn truncate_at(&self, url: &str, offset: u64) {
        self.state
            .lock()
            .truncations
            .entry(url.to_string())
            .or_default()
            .push(offset);
    }

    pub fn clear_stalls(&self) {
        let mut state = self.state.lock();
        state.stalls.clear();
        state.truncations.clear();
    }

    pub fn fail(&self, url: &str, times: u32, err: FetchError) {
        self.state
            .lock()
            .failures
            .insert(url.to_string(), (times, err));
    }

    /// 忽略请求的结束位置，多返回一些字节
    pub fn ignore_range_end(&self, url: &str) {
        self.state.lock().ignore_end.insert(url.to_string());
    }

    pub fn requests(&self) -> Vec<RangeRequest> {
        self.state.lock().requests.clone()
    }

    pub fn requests_for(&self, url: &str) -> Vec<RangeRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.url == url)
            .cloned()
            .collect()
    }

    /// 已经交给调用方的字节数
    pub fn bytes_served(&self) -> u64 {
        self.bytes_served.load(Ordering::SeqCst)
    }
}

fn first_in_range(offsets: Option<&Vec<u64>>, start: u64, end_inclusive: u64) -> Option<u64> {
    offsets?
        .iter()
        .copied()
        .filter(|o| *o >= start && *o <= end_inclusive)
        .min()
}

#[async_trait]
impl RemoteFetcher for MockFetcher {
    async fn open_range(
        &self,
        locator: &ResourceLocator,
        start: u64,
        end_inclusive: u64,
    ) -> Result<ByteStream, FetchError> {
        let url = locator.url.clone();
        let (stall, truncate, extra) = {
            let mut state = self.state.lock();
            state.requests.push(RangeRequest {
                url: url.clone(),
                start,
                end_inclusive,
            });
            if let Some((remaining, err)) = state.failures.get_mut(&url) {
                if *remaining > 0 {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    return Err(err.clone());
                }
            }
            (
                first_in_range(state.stalls.get(&url), start, end_inclusive),
                first_in_range(state.truncations.get(&url), start, end_inclusive),
                if state.ignore_end.contains(&url) { 100 } else { 0 },
            )
        };

        let serve_end = stall
            .into_iter()
            .chain(truncate)
            .min()
            .unwrap_or(end_inclusive + 1 + extra);

        let mut chunks = Vec::new();
        let mut pos = start;
        while pos < serve_end {
            let end = (pos + self.chunk_size).min(serve_end);
            chunks.push(Bytes::from((pos..end).map(byte_at).collect::<Vec<u8>>()));
            pos = end;
        }

        let served = self.bytes_served.clone();
        let delay = self.chunk_delay;
        let data = stream::iter(chunks).then(move |chunk| {
            let served = served.clone();
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                served.fetch_add(chunk.len() as u64, Ordering::SeqCst);
                Ok::<Bytes, FetchError>(chunk)
            }
        });

        let stalls_first = match (stall, truncate) {
            (Some(s), Some(t)) => s <= t,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if stalls_first {
            Ok(data
                .chain(stream::pending::<Result<Bytes, FetchError>>())
                .boxed())
        } else {
            Ok(data.boxed())
        }
    }
}

/// 测试配置：3 个分段、不限最小分段、失败重试 2 次、不节流
pub(crate) fn test_config(dir: &Path) -> DownloadConfig {
    DownloadConfig {
        download_dir: dir.join("incomplete"),
        segment_count: 3,
        min_split_size_bytes: 0,
        max_concurrent_per_server: 1,
        max_retries: 2,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        read_timeout_secs: 5,
        connect_timeout_secs: 5,
        progress_interval_ms: 0,
        checkpoint_interval_ms: 0,
        merge_retries: 2,
        merge_retry_delay_ms: 1,
        event_channel_capacity: 4096,
    }
}

const WAIT_LIMIT: Duration = Duration::from_secs(10);

pub(crate) async fn wait_for_status(manager: &DownloadManager, task_id: &str, status: DownloadStatus) {
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        let current = manager.get_task(task_id).await.map(|t| t.status);
        if current == Some(status) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "等待任务 {} 进入 {:?} 超时，当前 {:?}",
            task_id,
            status,
            current
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// 等待叶子的已下载量达到 `bytes`
pub(crate) async fn wait_for_downloaded(manager: &DownloadManager, task_id: &str, bytes: u64) {
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        let current = manager.get_task(task_id).await.map(|t| t.downloaded_size);
        if current.is_some_and(|d| d >= bytes) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "等待任务 {} 下载到 {} 字节超时，当前 {:?}",
            task_id,
            bytes,
            current
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// 等待分段记录满足条件
pub(crate) async fn wait_for_workers<F>(manager: &DownloadManager, task_id: &str, what: &str, check: F)
where
    F: Fn(&[crate::downloader::DownloadWorkerTask]) -> bool,
{
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        let workers = manager.worker_tasks(task_id).await;
        if check(&workers) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "等待分段条件超时: {}，当前 {:?}",
            what,
            workers
                .iter()
                .map(|w| (w.bytes_received, w.status))
                .collect::<Vec<_>>()
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// 等待某个任务发布指定的状态变更事件
pub(crate) async fn wait_for_status_event(
    events: &mut tokio::sync::broadcast::Receiver<crate::events::DownloadEvent>,
    task_id: &str,
    status: DownloadStatus,
) {
    use crate::events::DownloadEvent;
    use tokio::sync::broadcast::error::RecvError;

    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .unwrap_or_else(|_| panic!("等待任务 {} 的 {:?} 事件超时", task_id, status));
        match event {
            Ok(DownloadEvent::StatusChanged {
                task_id: id,
                new_status,
                ..
            }) if id == task_id && new_status == status => return,
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => panic!("事件通道已关闭"),
        }
    }
}
