//! 服务器级调度
//!
//! 每台服务器一个 FIFO 等待队列、一个任务位池和一个调度循环。调度循环在有空闲槽位时
//! 从队首取出叶子，规划分段并为每个未完成的分段启动一个 worker。
//!
//! 锁顺序：等待队列 -> 运行表 -> 任务树，任何地方都不能反过来。

use super::aggregator::AggregatorMessage;
use super::finalize::prepare_temp_file;
use super::manager::DownloadCore;
use super::rate_limit::SpeedLimiter;
use super::segment::{DownloadWorkerTask, WorkerStatus};
use super::task::{DownloadStatus, DownloadTask};
use super::task_slot_pool::TaskSlotPool;
use super::worker::{DownloadWorker, WorkerContext};
use crate::error::{DownloadError, DownloadResult};
use crate::remote::ServerConnection;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 停止运行中叶子的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HaltKind {
    Stop,
    Pause,
    /// 进程退出：状态保持不变，重启后恢复
    Shutdown,
}

impl HaltKind {
    pub fn target_status(self) -> Option<DownloadStatus> {
        match self {
            HaltKind::Stop => Some(DownloadStatus::Stopped),
            HaltKind::Pause => Some(DownloadStatus::Paused),
            HaltKind::Shutdown => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            HaltKind::Stop => "停止",
            HaltKind::Pause => "暂停",
            HaltKind::Shutdown => "挂起",
        }
    }
}

/// 已占用槽位的叶子
#[derive(Debug)]
pub(crate) struct RunningTask {
    pub server_id: u64,
    pub cancel: CancellationToken,
    pub halt: Option<HaltKind>,
    /// 还没结束的 worker 数
    pub outstanding: usize,
    /// 正在移动文件，不能再次评估
    pub finalizing: bool,
    /// 离开运行表时置为 true
    pub done: watch::Sender<bool>,
}

impl RunningTask {
    pub fn new(server_id: u64) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            server_id,
            cancel: CancellationToken::new(),
            halt: None,
            outstanding: 0,
            finalizing: false,
            done,
        }
    }

    /// 请求停止并返回一个等待结束的接收端
    pub fn halt(&mut self, kind: HaltKind) -> watch::Receiver<bool> {
        // 退出请求不会被普通停止覆盖
        if self.halt != Some(HaltKind::Shutdown) {
            self.halt = Some(kind);
        }
        self.cancel.cancel();
        self.done.subscribe()
    }
}

/// 单台服务器的调度状态
#[derive(Debug)]
pub(crate) struct ServerQueue {
    pub server_id: u64,
    pub connection: RwLock<ServerConnection>,
    /// 等待中的叶子ID（FIFO）
    pub pending: Mutex<VecDeque<String>>,
    pub slots: TaskSlotPool,
    pub notify: Notify,
    pub limiter: Arc<SpeedLimiter>,
}

impl ServerQueue {
    pub fn new(connection: ServerConnection, max_concurrent: usize, speed_limit_kbps: u64) -> Self {
        Self {
            server_id: connection.server_id,
            connection: RwLock::new(connection),
            pending: Mutex::new(VecDeque::new()),
            slots: TaskSlotPool::new(max_concurrent.max(1)),
            notify: Notify::new(),
            limiter: Arc::new(SpeedLimiter::from_kbps(speed_limit_kbps)),
        }
    }

    /// 追加到队尾（已在队列中的跳过）
    pub async fn push_back<I>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut pending = self.pending.lock().await;
        let mut added = 0;
        for id in ids {
            if !pending.contains(&id) {
                pending.push_back(id);
                added += 1;
            }
        }
        drop(pending);
        if added > 0 {
            self.notify.notify_one();
        }
        added
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// 服务器调度循环
pub(crate) async fn run_dispatcher(core: Arc<DownloadCore>, queue: Arc<ServerQueue>) {
    info!("服务器 {} 调度循环启动", queue.server_id);
    'outer: loop {
        while let Some(task_id) = next_admission(&core, &queue).await {
            admit(&core, &queue, &task_id).await;
            if core.dispatch_token.is_cancelled() {
                break 'outer;
            }
        }

        tokio::select! {
            _ = core.dispatch_token.cancelled() => break,
            _ = queue.notify.notified() => {}
        }
    }
    info!("服务器 {} 调度循环退出", queue.server_id);
}

/// 取出队首可调度的叶子并占用槽位
///
/// 出队、占槽、登记运行表在等待队列锁内一起完成，停止操作看到的要么是排队中，要么是运行中
async fn next_admission(core: &DownloadCore, queue: &ServerQueue) -> Option<String> {
    if core.dispatch_token.is_cancelled() {
        return None;
    }
    let mut pending = queue.pending.lock().await;
    loop {
        let task_id = pending.front()?.clone();

        let queued = core
            .tree
            .read()
            .await
            .get(&task_id)
            .is_some_and(|t| t.status == DownloadStatus::Queued);
        if !queued {
            // 已删除或状态已变，直接丢弃
            debug!("跳过失效的排队任务: {}", task_id);
            pending.pop_front();
            continue;
        }

        let slot = queue.slots.allocate(&task_id).await?;
        pending.pop_front();
        core.running
            .lock()
            .await
            .insert(task_id.clone(), RunningTask::new(queue.server_id));
        debug!("任务 {} 占用服务器 {} 的槽位 {}", task_id, queue.server_id, slot);
        return Some(task_id);
    }
}

async fn admit(core: &Arc<DownloadCore>, queue: &ServerQueue, task_id: &str) {
    if let Err(e) = start_workers(core, queue, task_id).await {
        error!("任务 {} 启动失败: {}", task_id, e);
        core.finish_running_leaf(task_id, Some(DownloadStatus::Error), Some(e.to_string()))
            .await;
    }
}

async fn start_workers(
    core: &Arc<DownloadCore>,
    queue: &ServerQueue,
    task_id: &str,
) -> DownloadResult<()> {
    let (task, persisted) = {
        let tree = core.tree.read().await;
        let task = tree
            .get(task_id)
            .cloned()
            .ok_or_else(|| DownloadError::TaskNotFound(task_id.to_string()))?;
        (task, tree.workers(task_id).cloned().unwrap_or_default())
    };
    let file_location = task
        .file_location
        .clone()
        .ok_or_else(|| DownloadError::Validation(format!("任务缺少文件位置: {}", task_id)))?;

    let temp = core.temp_path(task_id);
    let mut workers = core.planner.reconcile(task_id, task.total_size, &persisted);

    // 已记录的偏移只有在临时文件还在时才可信
    if workers.iter().any(|w| w.bytes_received > 0) && !fs::try_exists(&temp).await? {
        let all_done = workers.iter().all(|w| w.is_complete());
        if all_done && destination_complete(&task).await {
            // 上次移动完文件后、记录完成状态前退出
            info!("临时文件已移动到目标路径，直接完成: {} ({})", task.title, task_id);
            return complete_moved_leaf(core, task_id, workers).await;
        }
        warn!(
            "任务 {} 的临时文件丢失，已记录的 {} 字节作废，从头下载",
            task_id,
            workers.iter().map(|w| w.bytes_received).sum::<u64>()
        );
        workers = core.planner.plan(task_id, task.total_size);
    }

    core.store.save_worker_tasks(task_id, &workers).await?;
    prepare_temp_file(&temp, task.total_size).await?;

    let changes = {
        let mut tree = core.tree.write().await;
        tree.set_workers(task_id, workers.clone());
        tree.refresh_leaf_progress(task_id)
    };
    core.apply_changes(changes).await;
    core.apply_leaf_status(task_id, DownloadStatus::Downloading, None)
        .await?;

    let todo: Vec<DownloadWorkerTask> = workers.into_iter().filter(|w| !w.is_complete()).collect();
    info!(
        "开始下载: {} ({})，大小 {} 字节，待下载分段 {} 个",
        task.title,
        task_id,
        task.total_size,
        todo.len()
    );

    let cancel = {
        let mut running = core.running.lock().await;
        let Some(rt) = running.get_mut(task_id) else {
            return Ok(());
        };
        rt.outstanding = if rt.cancel.is_cancelled() { 0 } else { todo.len() };
        (rt.outstanding > 0).then(|| rt.cancel.clone())
    };

    let Some(cancel) = cancel else {
        // 已被停止或已全部下载，交给聚合任务决定结果
        let _ = core
            .agg_tx
            .send(AggregatorMessage::Evaluate {
                task_id: task_id.to_string(),
            })
            .await;
        return Ok(());
    };

    {
        let mut tree = core.tree.write().await;
        if let Some(ws) = tree.workers_mut(task_id) {
            for w in ws.iter_mut().filter(|w| !w.is_complete()) {
                w.status = WorkerStatus::Downloading;
                w.error = None;
            }
        }
    }

    let locator = queue.connection.read().await.locator(&file_location);
    for w in todo {
        let worker = DownloadWorker::new(WorkerContext {
            task_id: task_id.to_string(),
            index: w.index,
            range: w.range.clone(),
            bytes_received: w.bytes_received,
            locator: locator.clone(),
            file_path: temp.clone(),
            fetcher: core.fetcher.clone(),
            limiter: queue.limiter.clone(),
            retry: core.retry,
            read_timeout: core.config.read_timeout(),
            progress_interval: core.config.progress_interval(),
            cancel: cancel.clone(),
            tx: core.agg_tx.clone(),
        });
        tokio::spawn(worker.run());
    }
    Ok(())
}

/// 目标文件已存在且大小与任务一致
async fn destination_complete(task: &DownloadTask) -> bool {
    let Some(dest) = &task.destination_path else {
        return false;
    };
    match fs::metadata(dest).await {
        Ok(meta) => meta.is_file() && meta.len() == task.total_size,
        Err(_) => false,
    }
}

/// 文件已经在目标路径，不再重建临时文件，直接把叶子记为完成
async fn complete_moved_leaf(
    core: &Arc<DownloadCore>,
    task_id: &str,
    workers: Vec<DownloadWorkerTask>,
) -> DownloadResult<()> {
    let changes = {
        let mut tree = core.tree.write().await;
        tree.set_workers(task_id, workers);
        tree.refresh_leaf_progress(task_id)
    };
    core.apply_changes(changes).await;
    core.apply_leaf_status(task_id, DownloadStatus::Downloading, None)
        .await?;
    core.finish_running_leaf(task_id, Some(DownloadStatus::Completed), None)
        .await;
    Ok(())
}
