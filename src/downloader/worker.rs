//! 分段下载 worker
//!
//! 每个 worker 负责一个分段：把远程区间流式写入临时文件的固定偏移，按间隔上报进度，
//! 瞬时错误原地重试剩余区间。多个 worker 写同一个文件的不相交区间，不需要文件锁。

use super::aggregator::{AggregatorMessage, WorkerOutcome};
use super::progress::SpeedCalculator;
use super::rate_limit::SpeedLimiter;
use super::retry::{RetryDecision, RetryPolicy};
use crate::remote::{FetchError, RemoteFetcher, ResourceLocator};
use futures::StreamExt;
use std::io::SeekFrom;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 单次尝试的失败原因
#[derive(Debug)]
enum AttemptError {
    Cancelled,
    Fetch(FetchError),
    /// 本地写入失败，不重试
    Io(std::io::Error),
}

impl From<std::io::Error> for AttemptError {
    fn from(e: std::io::Error) -> Self {
        AttemptError::Io(e)
    }
}

pub(crate) struct WorkerContext {
    pub task_id: String,
    pub index: usize,
    pub range: Range<u64>,
    /// 已持久化的进度，从 `range.start + bytes_received` 续传
    pub bytes_received: u64,
    pub locator: ResourceLocator,
    pub file_path: PathBuf,
    pub fetcher: Arc<dyn RemoteFetcher>,
    pub limiter: Arc<SpeedLimiter>,
    pub retry: RetryPolicy,
    pub read_timeout: Duration,
    pub progress_interval: Duration,
    pub cancel: CancellationToken,
    pub tx: mpsc::Sender<AggregatorMessage>,
}

pub(crate) struct DownloadWorker {
    ctx: WorkerContext,
    received: u64,
    speed: SpeedCalculator,
    last_report: Option<Instant>,
}

impl DownloadWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        let received = ctx.bytes_received.min(ctx.range.end - ctx.range.start);
        Self {
            ctx,
            received,
            speed: SpeedCalculator::with_default_window(),
            last_report: None,
        }
    }

    fn size(&self) -> u64 {
        self.ctx.range.end - self.ctx.range.start
    }

    fn remaining(&self) -> u64 {
        self.size() - self.received
    }

    /// 运行到完成、取消或重试耗尽，最后总会发送一条 `WorkerFinished`
    pub async fn run(mut self) {
        let outcome = self.download().await;
        let msg = AggregatorMessage::WorkerFinished {
            task_id: self.ctx.task_id.clone(),
            index: self.ctx.index,
            bytes_received: self.received,
            outcome,
        };
        if self.ctx.tx.send(msg).await.is_err() {
            debug!("聚合器已关闭，丢弃分段结束消息: {}-{}", self.ctx.task_id, self.ctx.index);
        }
    }

    async fn download(&mut self) -> WorkerOutcome {
        if self.remaining() == 0 {
            return WorkerOutcome::Completed;
        }

        let mut file = match OpenOptions::new().write(true).open(&self.ctx.file_path).await {
            Ok(f) => f,
            Err(e) => {
                error!("打开临时文件失败 {:?}: {}", self.ctx.file_path, e);
                return WorkerOutcome::Failed(format!("打开临时文件失败: {}", e));
            }
        };

        let mut attempt = 0u32;
        loop {
            if self.ctx.cancel.is_cancelled() {
                return WorkerOutcome::Stopped;
            }
            attempt += 1;
            let before = self.received;

            let err = match self.fetch_remaining(&mut file).await {
                Ok(()) => return WorkerOutcome::Completed,
                Err(AttemptError::Cancelled) => {
                    debug!(
                        "分段 {}-{} 已取消，停在 {} 字节",
                        self.ctx.task_id, self.ctx.index, self.received
                    );
                    return WorkerOutcome::Stopped;
                }
                Err(AttemptError::Io(e)) => {
                    error!("分段 {}-{} 写入失败: {}", self.ctx.task_id, self.ctx.index, e);
                    return WorkerOutcome::Failed(format!("写入文件失败: {}", e));
                }
                Err(AttemptError::Fetch(e)) => e,
            };

            // 本次尝试有进展就重新计数
            if self.received > before {
                attempt = 1;
            }

            match self.ctx.retry.decide(attempt, &err) {
                RetryDecision::GiveUp => {
                    error!(
                        "分段 {}-{} 重试耗尽（第 {} 次）: {}，已接收 {} 字节",
                        self.ctx.task_id, self.ctx.index, attempt, err, self.received
                    );
                    return WorkerOutcome::Failed(err.to_string());
                }
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        "分段 {}-{} 下载失败: {}，{:?} 后重试（第 {} 次）",
                        self.ctx.task_id, self.ctx.index, err, delay, attempt
                    );
                    tokio::select! {
                        biased;
                        _ = self.ctx.cancel.cancelled() => return WorkerOutcome::Stopped,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// 请求并写入剩余区间，只有整段写完才返回 Ok
    async fn fetch_remaining(&mut self, file: &mut File) -> Result<(), AttemptError> {
        let start = self.ctx.range.start + self.received;
        let end_inclusive = self.ctx.range.end - 1;
        debug!(
            "分段 {}-{} 请求 bytes={}-{}",
            self.ctx.task_id, self.ctx.index, start, end_inclusive
        );

        let open = tokio::time::timeout(
            self.ctx.read_timeout,
            self.ctx.fetcher.open_range(&self.ctx.locator, start, end_inclusive),
        );
        let mut stream = tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => return Err(AttemptError::Cancelled),
            opened = open => match opened {
                Err(_) => return Err(AttemptError::Fetch(FetchError::Timeout)),
                Ok(Err(e)) => return Err(AttemptError::Fetch(e)),
                Ok(Ok(stream)) => stream,
            },
        };

        file.flush().await?;
        file.seek(SeekFrom::Start(start)).await?;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => {
                    file.flush().await?;
                    return Err(AttemptError::Cancelled);
                }
                next = tokio::time::timeout(self.ctx.read_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    file.flush().await?;
                    return Err(AttemptError::Fetch(FetchError::Timeout));
                }
                Ok(None) => {
                    file.flush().await?;
                    return Err(AttemptError::Fetch(FetchError::Incomplete));
                }
                Ok(Some(Err(e))) => {
                    file.flush().await?;
                    return Err(AttemptError::Fetch(e));
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            // 服务器多给的字节丢弃，不能越过本分段的区间
            let take = (chunk.len() as u64).min(self.remaining()) as usize;
            file.write_all(&chunk[..take]).await?;
            self.received += take as u64;
            self.speed.add_sample(take as u64);

            if self.remaining() == 0 {
                file.flush().await?;
                self.report(true).await;
                return Ok(());
            }

            if self.report_due() {
                file.flush().await?;
                self.report(false).await;
            }

            self.ctx.limiter.acquire(take as u64).await;
        }
    }

    fn report_due(&self) -> bool {
        match self.last_report {
            None => true,
            Some(at) => at.elapsed() >= self.ctx.progress_interval,
        }
    }

    async fn report(&mut self, finished: bool) {
        self.last_report = Some(Instant::now());
        let speed = if finished { 0 } else { self.speed.speed() };
        let msg = AggregatorMessage::Progress {
            task_id: self.ctx.task_id.clone(),
            index: self.ctx.index,
            bytes_received: self.received,
            speed,
        };
        // 通道有界，聚合器处理不过来时这里会等待
        let _ = self.ctx.tx.send(msg).await;
    }
}
