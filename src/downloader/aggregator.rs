//! 进度与状态汇总
//!
//! 所有 worker 的进度和结束消息都经过一个有界通道，由单个聚合任务顺序处理：
//! 更新分段记录、刷新叶子和祖先的进度、按间隔写检查点、在叶子的全部分段结束后
//! 决定叶子的最终状态。叶子的完成只在这里判定一次。

use super::finalize::finalize_download;
use super::manager::DownloadCore;
use super::scheduler::HaltKind;
use super::segment::{DownloadWorkerTask, WorkerStatus};
use super::task::DownloadStatus;
use crate::events::ProgressThrottler;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 分段结束方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkerOutcome {
    Completed,
    Stopped,
    Failed(String),
}

#[derive(Debug)]
pub(crate) enum AggregatorMessage {
    /// `bytes_received` 是分段内的累计值
    Progress {
        task_id: String,
        index: usize,
        bytes_received: u64,
        speed: u64,
    },
    WorkerFinished {
        task_id: String,
        index: usize,
        bytes_received: u64,
        outcome: WorkerOutcome,
    },
    Finalized {
        task_id: String,
        result: Result<(), String>,
    },
    /// 没有分段需要运行时直接评估叶子
    Evaluate { task_id: String },
}

/// 由子节点状态汇总父节点状态
///
/// 全部完成才是 Completed；有一个失败就是 Error；否则只要还有在下载的就是
/// Downloading，还有排队的就是 Queued。剩下的全是 Stopped/Paused/Completed 时，
/// 有 Stopped 为 Stopped，否则为 Paused。
pub fn rollup_status(children: &[DownloadStatus]) -> DownloadStatus {
    use DownloadStatus::*;

    if children.is_empty() {
        return Queued;
    }
    let any = |s: DownloadStatus| children.contains(&s);

    if children.iter().all(|s| *s == Completed) {
        Completed
    } else if any(Error) {
        Error
    } else if any(Downloading) {
        Downloading
    } else if any(Queued) {
        Queued
    } else if any(Stopped) {
        Stopped
    } else if any(Paused) {
        Paused
    } else {
        Queued
    }
}

/// 叶子在全部分段结束后的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LeafOutcome {
    /// 还有分段在运行
    Running,
    AllCompleted,
    Failed(String),
    Halted(HaltKind),
}

/// 根据分段记录和停止请求决定叶子结果，停止请求优先
pub(crate) fn leaf_outcome(workers: &[DownloadWorkerTask], halt: Option<HaltKind>) -> LeafOutcome {
    if workers.iter().any(|w| w.status == WorkerStatus::Downloading) {
        return LeafOutcome::Running;
    }
    if let Some(kind) = halt {
        return LeafOutcome::Halted(kind);
    }
    if let Some(failed) = workers.iter().find(|w| w.status == WorkerStatus::Error) {
        let reason = failed
            .error
            .clone()
            .unwrap_or_else(|| format!("分段 {} 下载失败", failed.index));
        return LeafOutcome::Failed(reason);
    }
    if workers.iter().all(|w| w.is_complete()) {
        return LeafOutcome::AllCompleted;
    }
    LeafOutcome::Halted(HaltKind::Stop)
}

pub(crate) struct Aggregator {
    core: Arc<DownloadCore>,
    throttler: ProgressThrottler,
    checkpoint_interval: Duration,
    last_checkpoint: HashMap<String, Instant>,
    stop: CancellationToken,
}

impl Aggregator {
    pub fn new(core: Arc<DownloadCore>, stop: CancellationToken) -> Self {
        let throttler = ProgressThrottler::new(core.config.progress_interval());
        let checkpoint_interval = core.config.checkpoint_interval();
        Self {
            core,
            throttler,
            checkpoint_interval,
            last_checkpoint: HashMap::new(),
            stop,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<AggregatorMessage>) {
        debug!("进度聚合任务启动");
        loop {
            // 先把通道里的消息处理完再退出
            tokio::select! {
                biased;
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = self.stop.cancelled() => break,
            }
        }
        debug!("进度聚合任务退出");
    }

    async fn handle(&mut self, msg: AggregatorMessage) {
        match msg {
            AggregatorMessage::Progress {
                task_id,
                index,
                bytes_received,
                speed,
            } => self.on_progress(&task_id, index, bytes_received, speed).await,
            AggregatorMessage::WorkerFinished {
                task_id,
                index,
                bytes_received,
                outcome,
            } => {
                self.on_worker_finished(&task_id, index, bytes_received, outcome)
                    .await
            }
            AggregatorMessage::Finalized { task_id, result } => {
                self.on_finalized(&task_id, result).await
            }
            AggregatorMessage::Evaluate { task_id } => self.evaluate_leaf(&task_id).await,
        }
    }

    fn checkpoint_due(&mut self, worker_id: &str) -> bool {
        let now = Instant::now();
        match self.last_checkpoint.get(worker_id) {
            Some(last) if now.duration_since(*last) < self.checkpoint_interval => false,
            _ => {
                self.last_checkpoint.insert(worker_id.to_string(), now);
                true
            }
        }
    }

    async fn on_progress(&mut self, task_id: &str, index: usize, bytes_received: u64, speed: u64) {
        let (worker_id, received, changes, events) = {
            let mut tree = self.core.tree.write().await;
            let Some(worker) = tree.workers_mut(task_id).and_then(|ws| ws.get_mut(index)) else {
                debug!("忽略已移除分段的进度: {}-{}", task_id, index);
                return;
            };
            worker.bytes_received = bytes_received.min(worker.size());
            worker.speed = speed;
            let worker_id = worker.id.clone();
            let received = worker.bytes_received;

            let changes = tree.refresh_leaf_progress(task_id);
            let events = if self.throttler.should_emit(task_id) {
                tree.progress_events(task_id)
            } else {
                Vec::new()
            };
            (worker_id, received, changes, events)
        };

        self.core.apply_changes(changes).await;
        for event in events {
            self.core.emit(event);
        }

        if self.checkpoint_due(&worker_id) {
            if let Err(e) = self
                .core
                .store
                .save_worker_checkpoint(&worker_id, received, WorkerStatus::Downloading)
                .await
            {
                warn!("保存分段检查点失败 {}: {:#}", worker_id, e);
            }
        }
    }

    async fn on_worker_finished(
        &mut self,
        task_id: &str,
        index: usize,
        bytes_received: u64,
        outcome: WorkerOutcome,
    ) {
        let (status, error) = match outcome {
            WorkerOutcome::Completed => (WorkerStatus::Completed, None),
            WorkerOutcome::Stopped => (WorkerStatus::Stopped, None),
            WorkerOutcome::Failed(e) => (WorkerStatus::Error, Some(e)),
        };

        let (checkpoint, changes) = {
            let mut tree = self.core.tree.write().await;
            let checkpoint = tree
                .workers_mut(task_id)
                .and_then(|ws| ws.get_mut(index))
                .map(|worker| {
                    worker.bytes_received = bytes_received.min(worker.size());
                    worker.speed = 0;
                    worker.status = status;
                    worker.error = error;
                    (worker.id.clone(), worker.bytes_received)
                });
            (checkpoint, tree.refresh_leaf_progress(task_id))
        };
        self.core.apply_changes(changes).await;

        // 分段结束时总是写检查点
        if let Some((worker_id, received)) = checkpoint {
            self.last_checkpoint.remove(&worker_id);
            if let Err(e) = self
                .core
                .store
                .save_worker_checkpoint(&worker_id, received, status)
                .await
            {
                warn!("保存分段检查点失败 {}: {:#}", worker_id, e);
            }
        }

        let remaining = {
            let mut running = self.core.running.lock().await;
            match running.get_mut(task_id) {
                Some(rt) => {
                    rt.outstanding = rt.outstanding.saturating_sub(1);
                    rt.outstanding
                }
                None => return,
            }
        };
        if remaining == 0 {
            self.evaluate_leaf(task_id).await;
        }
    }

    async fn evaluate_leaf(&mut self, task_id: &str) {
        let halt = {
            let running = self.core.running.lock().await;
            match running.get(task_id) {
                Some(rt) if rt.outstanding == 0 && !rt.finalizing => rt.halt,
                _ => return,
            }
        };

        let workers = self
            .core
            .tree
            .read()
            .await
            .workers(task_id)
            .cloned()
            .unwrap_or_default();

        match leaf_outcome(&workers, halt) {
            LeafOutcome::Running => {}
            LeafOutcome::AllCompleted => self.start_finalize(task_id).await,
            LeafOutcome::Failed(reason) => {
                error!("任务下载失败: {}: {}", task_id, reason);
                self.throttler.forget(task_id);
                self.core
                    .finish_running_leaf(task_id, Some(DownloadStatus::Error), Some(reason))
                    .await;
            }
            LeafOutcome::Halted(kind) => {
                info!("任务已{}: {}", kind.describe(), task_id);
                self.throttler.forget(task_id);
                self.core
                    .finish_running_leaf(task_id, kind.target_status(), None)
                    .await;
            }
        }
    }

    /// 在后台移动文件，结果通过 `Finalized` 回到聚合任务
    async fn start_finalize(&mut self, task_id: &str) {
        {
            let mut running = self.core.running.lock().await;
            match running.get_mut(task_id) {
                Some(rt) => rt.finalizing = true,
                None => return,
            }
        }

        let target = {
            let tree = self.core.tree.read().await;
            tree.get(task_id)
                .and_then(|t| t.destination_path.clone().map(|d| (d, t.total_size)))
        };
        let Some((dest, total_size)) = target else {
            self.core
                .finish_running_leaf(
                    task_id,
                    Some(DownloadStatus::Error),
                    Some("缺少目标路径".to_string()),
                )
                .await;
            return;
        };

        let temp = self.core.temp_path(task_id);
        let attempts = self.core.config.merge_retries;
        let delay = self.core.config.merge_retry_delay();
        let tx = self.core.agg_tx.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            let result = finalize_download(&temp, &dest, total_size, attempts, delay)
                .await
                .map_err(|e| e.to_string());
            if tx
                .send(AggregatorMessage::Finalized {
                    task_id: task_id.clone(),
                    result,
                })
                .await
                .is_err()
            {
                warn!("聚合器已关闭，文件移动结果丢失: {}", task_id);
            }
        });
    }

    async fn on_finalized(&mut self, task_id: &str, result: Result<(), String>) {
        self.throttler.forget(task_id);
        match result {
            Ok(()) => {
                info!("✅ 任务下载完成: {}", task_id);
                self.core
                    .finish_running_leaf(task_id, Some(DownloadStatus::Completed), None)
                    .await;
            }
            Err(e) => {
                error!("任务收尾失败: {}: {}", task_id, e);
                self.core
                    .finish_running_leaf(
                        task_id,
                        Some(DownloadStatus::Error),
                        Some(format!("移动文件失败: {}", e)),
                    )
                    .await;
            }
        }
    }
}
