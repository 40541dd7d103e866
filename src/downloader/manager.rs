//! 下载管理器
//!
//! 对外入口：入队、停止、暂停、继续、重新下载、删除、恢复、关闭。
//! 内部状态都放在 [`DownloadCore`] 里，由调度循环、worker 和聚合任务共享。

use super::aggregator::{Aggregator, AggregatorMessage};
use super::finalize::remove_temp_file;
use super::retry::RetryPolicy;
use super::scheduler::{run_dispatcher, HaltKind, RunningTask, ServerQueue};
use super::segment::{DownloadWorkerTask, SegmentPlanner};
use super::task::{DownloadStatus, DownloadTask, DownloadTaskNode};
use super::tree::{materialize, StatusChange, TaskTree};
use crate::config::DownloadConfig;
use crate::error::{DownloadError, DownloadResult};
use crate::events::DownloadEvent;
use crate::persistence::TaskStore;
use crate::remote::{RemoteFetcher, ServerConnection};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 管理器内部共享状态
pub(crate) struct DownloadCore {
    pub config: DownloadConfig,
    pub planner: SegmentPlanner,
    pub retry: RetryPolicy,
    /// 全部任务节点和分段记录
    pub tree: RwLock<TaskTree>,
    /// 服务器ID -> 调度状态
    pub servers: DashMap<u64, Arc<ServerQueue>>,
    /// 占用槽位的叶子
    pub running: Mutex<HashMap<String, RunningTask>>,
    pub store: Arc<dyn TaskStore>,
    pub fetcher: Arc<dyn RemoteFetcher>,
    pub events: broadcast::Sender<DownloadEvent>,
    pub agg_tx: mpsc::Sender<AggregatorMessage>,
    /// 下一个入队序号
    pub queue_seq: AtomicU64,
    /// 取消后调度循环不再启动新任务
    pub dispatch_token: CancellationToken,
}

impl DownloadCore {
    pub fn emit(&self, event: DownloadEvent) {
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(event);
    }

    pub fn server(&self, server_id: u64) -> Option<Arc<ServerQueue>> {
        self.servers.get(&server_id).map(|q| q.value().clone())
    }

    /// 叶子的临时文件路径
    pub fn temp_path(&self, task_id: &str) -> PathBuf {
        self.config.download_dir.join(format!("{}.part", task_id))
    }

    /// 持久化并发布一批状态变化
    pub async fn apply_changes(&self, changes: Vec<StatusChange>) {
        for change in changes {
            debug!(
                "任务状态变更: {} {} -> {}",
                change.task_id, change.old_status, change.new_status
            );
            if let Err(e) = self
                .store
                .save_task_status(&change.task_id, change.new_status)
                .await
            {
                warn!("保存任务状态失败 {}: {:#}", change.task_id, e);
            }
            self.emit(change.to_event());
        }
    }

    pub async fn apply_leaf_status(
        &self,
        task_id: &str,
        status: DownloadStatus,
        error: Option<String>,
    ) -> DownloadResult<()> {
        let changes = self
            .tree
            .write()
            .await
            .set_leaf_status(task_id, status, error)?;
        self.apply_changes(changes).await;
        Ok(())
    }

    pub async fn emit_progress(&self, task_id: &str) {
        let events = self.tree.read().await.progress_events(task_id);
        for event in events {
            self.emit(event);
        }
    }

    /// 叶子离开运行表，只会成功一次
    ///
    /// `status` 为 None 表示进程退出：保留原状态，重启后恢复
    pub async fn finish_running_leaf(
        &self,
        task_id: &str,
        status: Option<DownloadStatus>,
        error: Option<String>,
    ) {
        let removed = self.running.lock().await.remove(task_id);
        let Some(running) = removed else {
            debug!("任务不在运行中，忽略: {}", task_id);
            return;
        };

        if status == Some(DownloadStatus::Completed) {
            self.tree.write().await.remove_workers(task_id);
            if let Err(e) = self.store.delete_worker_tasks(task_id).await {
                warn!("删除分段记录失败 {}: {:#}", task_id, e);
            }
        }

        match status {
            Some(status) => {
                if let Err(e) = self.apply_leaf_status(task_id, status, error).await {
                    warn!("更新任务状态失败 {}: {}", task_id, e);
                }
            }
            None => {
                let changes = self.tree.write().await.refresh_leaf_progress(task_id);
                self.apply_changes(changes).await;
            }
        }
        self.emit_progress(task_id).await;

        // 状态发布之后再释放槽位，下一个任务的开始事件一定在本任务结束事件之后
        let queue = self.server(running.server_id);
        if let Some(queue) = &queue {
            queue.slots.release(task_id).await;
        }
        running.done.send_replace(true);
        if let Some(queue) = queue {
            queue.notify.notify_one();
        }
    }
}

/// 下载管理器
pub struct DownloadManager {
    core: Arc<DownloadCore>,
    /// 各服务器的调度循环
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    aggregator: Mutex<Option<JoinHandle<()>>>,
    aggregator_token: CancellationToken,
    /// 入队的校验和写入串行执行，两个请求不会抢到同一个目标路径
    enqueue_lock: Mutex<()>,
}

impl DownloadManager {
    /// 创建管理器并启动聚合任务（需要在 tokio 运行时内调用）
    pub fn new(
        config: DownloadConfig,
        fetcher: Arc<dyn RemoteFetcher>,
        store: Arc<dyn TaskStore>,
    ) -> DownloadResult<Self> {
        config
            .validate()
            .map_err(|e| DownloadError::Validation(format!("{:#}", e)))?;

        let capacity = config.event_channel_capacity;
        let (agg_tx, agg_rx) = mpsc::channel(capacity);
        let (events, _) = broadcast::channel(capacity);

        info!(
            "创建下载管理器: 临时目录={:?}, 分段数={}, 每服务器并发={}",
            config.download_dir, config.segment_count, config.max_concurrent_per_server
        );

        let core = Arc::new(DownloadCore {
            planner: SegmentPlanner::new(config.segment_count, config.min_split_size_bytes),
            retry: RetryPolicy::from_config(&config),
            config,
            tree: RwLock::new(TaskTree::new()),
            servers: DashMap::new(),
            running: Mutex::new(HashMap::new()),
            store,
            fetcher,
            events,
            agg_tx,
            queue_seq: AtomicU64::new(0),
            dispatch_token: CancellationToken::new(),
        });

        let aggregator_token = CancellationToken::new();
        let handle = tokio::spawn(Aggregator::new(core.clone(), aggregator_token.clone()).run(agg_rx));

        Ok(Self {
            core,
            dispatchers: Mutex::new(Vec::new()),
            aggregator: Mutex::new(Some(handle)),
            aggregator_token,
            enqueue_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.core.config
    }

    /// 订阅任务事件
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.core.events.subscribe()
    }

    /// 注册服务器（已注册的更新连接信息和限制）
    ///
    /// 新注册时启动该服务器的调度循环，并接管已在表中等待该服务器的排队叶子
    pub async fn register_server(
        &self,
        connection: ServerConnection,
        max_concurrent: Option<usize>,
        speed_limit_kbps: u64,
    ) {
        let server_id = connection.server_id;
        let max = max_concurrent
            .unwrap_or(self.core.config.max_concurrent_per_server)
            .max(1);

        if let Some(queue) = self.core.server(server_id) {
            info!("更新服务器 {} 的连接信息", server_id);
            *queue.connection.write().await = connection;
            queue.slots.resize(max).await;
            queue.limiter.set_limit_kbps(speed_limit_kbps);
            queue.notify.notify_one();
            return;
        }

        let queue = Arc::new(ServerQueue::new(connection, max, speed_limit_kbps));
        self.core.servers.insert(server_id, queue.clone());

        let orphans: Vec<String> = {
            let tree = self.core.tree.read().await;
            let mut leaves: Vec<&DownloadTask> = tree
                .iter()
                .filter(|t| {
                    t.is_leaf() && t.server_id == server_id && t.status == DownloadStatus::Queued
                })
                .collect();
            leaves.sort_by_key(|t| t.queue_order);
            leaves.into_iter().map(|t| t.id.clone()).collect()
        };
        if !orphans.is_empty() {
            info!("服务器 {} 接管 {} 个排队任务", server_id, orphans.len());
            queue.push_back(orphans).await;
        }

        let handle = tokio::spawn(run_dispatcher(self.core.clone(), queue));
        self.dispatchers.lock().await.push(handle);
        info!(
            "✅ 服务器 {} 已注册: 并发={}, 限速={}KB/s",
            server_id, max, speed_limit_kbps
        );
    }

    /// 运行时调整服务器的并发数或限速
    pub async fn update_server_limits(
        &self,
        server_id: u64,
        max_concurrent: Option<usize>,
        speed_limit_kbps: Option<u64>,
    ) -> DownloadResult<()> {
        let queue = self
            .core
            .server(server_id)
            .ok_or(DownloadError::UnknownServer(server_id))?;
        if let Some(max) = max_concurrent {
            queue.slots.resize(max.max(1)).await;
        }
        if let Some(kbps) = speed_limit_kbps {
            queue.limiter.set_limit_kbps(kbps);
        }
        queue.notify.notify_one();
        Ok(())
    }

    /// 入队一棵任务树，返回根任务ID
    pub async fn enqueue(&self, node: DownloadTaskNode) -> DownloadResult<String> {
        let mut roots = self.enqueue_many(vec![node]).await?;
        roots
            .pop()
            .ok_or_else(|| DownloadError::Validation("没有可入队的任务".to_string()))
    }

    /// 批量入队，任何一棵树不合法则全部拒绝
    pub async fn enqueue_many(&self, nodes: Vec<DownloadTaskNode>) -> DownloadResult<Vec<String>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = self.enqueue_lock.lock().await;

        {
            let tree = self.core.tree.read().await;
            let mut seen: HashSet<&PathBuf> = HashSet::new();
            for node in &nodes {
                node.validate().map_err(DownloadError::Validation)?;
                if !self.core.servers.contains_key(&node.server_id) {
                    return Err(DownloadError::UnknownServer(node.server_id));
                }
                for dest in node.leaf_destinations() {
                    if !seen.insert(dest) || tree.has_pending_destination(dest) {
                        return Err(DownloadError::Validation(format!(
                            "目标路径已在下载队列中: {:?}",
                            dest
                        )));
                    }
                }
            }
        }

        let batches: Vec<Vec<DownloadTask>> = nodes
            .iter()
            .map(|node| materialize(node, &self.core.queue_seq))
            .collect();
        let all: Vec<DownloadTask> = batches.iter().flatten().cloned().collect();
        self.core.store.save_tasks(&all).await?;

        {
            let mut tree = self.core.tree.write().await;
            for batch in &batches {
                tree.insert_tasks(batch.clone());
            }
        }

        for task in &all {
            self.core.emit(DownloadEvent::Created {
                task_id: task.id.clone(),
                root_task_id: task.root_task_id.clone(),
                parent_task_id: task.parent_task_id.clone(),
                title: task.title.clone(),
                total_size: task.total_size,
            });
        }

        let mut roots = Vec::with_capacity(batches.len());
        for batch in batches {
            let Some(root) = batch.first() else { continue };
            info!(
                "已添加下载任务: {} ({})，文件 {} 个，共 {} 字节",
                root.title,
                root.id,
                batch.iter().filter(|t| t.is_leaf()).count(),
                root.total_size
            );
            roots.push(root.id.clone());
            if let Some(queue) = self.core.server(root.server_id) {
                queue
                    .push_back(batch.into_iter().filter(|t| t.is_leaf()).map(|t| t.id))
                    .await;
            }
        }
        Ok(roots)
    }

    /// 停止子树，返回受影响的叶子
    pub async fn stop(&self, task_id: &str) -> DownloadResult<Vec<String>> {
        self.halt_subtree(task_id, HaltKind::Stop).await
    }

    /// 暂停子树，返回受影响的叶子
    pub async fn pause(&self, task_id: &str) -> DownloadResult<Vec<String>> {
        self.halt_subtree(task_id, HaltKind::Pause).await
    }

    /// 运行中的叶子取消 worker 并等待其结束；排队中的直接出队
    async fn halt_subtree(&self, task_id: &str, kind: HaltKind) -> DownloadResult<Vec<String>> {
        let Some(target) = kind.target_status() else {
            return Ok(Vec::new());
        };
        let leaves = self.core.tree.read().await.leaves_under(task_id)?;

        let mut waiters: Vec<watch::Receiver<bool>> = Vec::new();
        let mut affected = Vec::new();
        let mut direct = Vec::new();

        for leaf in leaves {
            let Some(server_id) = self.core.tree.read().await.get(&leaf).map(|t| t.server_id) else {
                continue;
            };
            let queue = self.core.server(server_id);

            // 锁顺序：等待队列 -> 运行表 -> 任务树
            let mut pending = match &queue {
                Some(q) => Some(q.pending.lock().await),
                None => None,
            };
            let mut running = self.core.running.lock().await;
            let status = self.core.tree.read().await.get(&leaf).map(|t| t.status);

            if let Some(rt) = running.get_mut(&leaf) {
                waiters.push(rt.halt(kind));
                affected.push(leaf);
                continue;
            }
            match status {
                Some(DownloadStatus::Queued) => {
                    if let Some(pending) = pending.as_mut() {
                        pending.retain(|id| *id != leaf);
                    }
                    direct.push(leaf);
                }
                Some(DownloadStatus::Paused) if target == DownloadStatus::Stopped => {
                    direct.push(leaf)
                }
                _ => {}
            }
        }

        for leaf in direct {
            match self.core.apply_leaf_status(&leaf, target, None).await {
                Ok(()) => affected.push(leaf),
                Err(e) => debug!("跳过任务 {}: {}", leaf, e),
            }
        }

        for mut rx in waiters {
            let _ = rx.wait_for(|done| *done).await;
        }

        if !affected.is_empty() {
            info!("已{}任务 {}，影响 {} 个文件", kind.describe(), task_id, affected.len());
        }
        Ok(affected)
    }

    /// 继续子树中已暂停/停止/失败的叶子，排到各自服务器队列的末尾
    pub async fn resume(&self, task_id: &str) -> DownloadResult<Vec<String>> {
        let leaves = self.core.tree.read().await.leaves_under(task_id)?;

        let mut resumed: Vec<(u64, String)> = Vec::new();
        for leaf in leaves {
            let Some((server_id, status)) = self
                .core
                .tree
                .read()
                .await
                .get(&leaf)
                .map(|t| (t.server_id, t.status))
            else {
                continue;
            };
            if !status.is_resumable() {
                continue;
            }
            match self
                .core
                .apply_leaf_status(&leaf, DownloadStatus::Queued, None)
                .await
            {
                Ok(()) => resumed.push((server_id, leaf)),
                Err(e) => debug!("跳过任务 {}: {}", leaf, e),
            }
        }

        if resumed.is_empty() {
            let status = self.core.tree.read().await.get(task_id).map(|t| t.status);
            if status == Some(DownloadStatus::Completed) {
                return Err(DownloadError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: DownloadStatus::Completed,
                    to: DownloadStatus::Queued,
                });
            }
            return Ok(Vec::new());
        }

        self.requeue(&resumed).await;
        info!("已继续任务 {}，{} 个文件重新排队", task_id, resumed.len());
        Ok(resumed.into_iter().map(|(_, id)| id).collect())
    }

    async fn requeue(&self, leaves: &[(u64, String)]) {
        let mut by_server: Vec<(u64, Vec<String>)> = Vec::new();
        for (server_id, id) in leaves {
            match by_server.iter_mut().find(|(s, _)| s == server_id) {
                Some((_, ids)) => ids.push(id.clone()),
                None => by_server.push((*server_id, vec![id.clone()])),
            }
        }
        for (server_id, ids) in by_server {
            match self.core.server(server_id) {
                Some(queue) => {
                    queue.push_back(ids).await;
                }
                None => warn!("服务器 {} 未注册，{} 个任务等待注册后调度", server_id, ids.len()),
            }
        }
    }

    /// 丢弃已下载的数据，从头重新下载子树中未完成的叶子
    pub async fn restart(&self, task_id: &str) -> DownloadResult<Vec<String>> {
        self.halt_subtree(task_id, HaltKind::Stop).await?;
        let leaves = self.core.tree.read().await.leaves_under(task_id)?;

        let mut restarted: Vec<(u64, String)> = Vec::new();
        for leaf in leaves {
            let Some((server_id, status)) = self
                .core
                .tree
                .read()
                .await
                .get(&leaf)
                .map(|t| (t.server_id, t.status))
            else {
                continue;
            };
            if status == DownloadStatus::Completed || status.is_active() {
                continue;
            }

            self.core.tree.write().await.reset_leaf_progress(&leaf);
            self.core.store.delete_worker_tasks(&leaf).await?;
            remove_temp_file(&self.core.temp_path(&leaf)).await;
            self.core
                .apply_leaf_status(&leaf, DownloadStatus::Queued, None)
                .await?;
            self.core.emit_progress(&leaf).await;
            restarted.push((server_id, leaf));
        }

        self.requeue(&restarted).await;
        info!("已重新下载任务 {}，{} 个文件", task_id, restarted.len());
        Ok(restarted.into_iter().map(|(_, id)| id).collect())
    }

    /// 删除子树及其临时文件，返回删除的全部任务ID
    ///
    /// 父节点因此变空时一并删除
    pub async fn remove(&self, task_id: &str) -> DownloadResult<Vec<String>> {
        self.halt_subtree(task_id, HaltKind::Stop).await?;

        let result = self.core.tree.write().await.remove_subtree(task_id);
        let ids: Vec<String> = result.removed.iter().map(|t| t.id.clone()).collect();

        for task in result.removed.iter().filter(|t| t.is_leaf()) {
            remove_temp_file(&self.core.temp_path(&task.id)).await;
        }
        self.core.store.delete_tasks(&ids).await?;

        for task in &result.removed {
            self.core.emit(DownloadEvent::Removed {
                task_id: task.id.clone(),
                root_task_id: task.root_task_id.clone(),
            });
        }
        self.core.apply_changes(result.changes).await;
        if let Some(survivor) = result.survivor {
            self.core.emit_progress(&survivor).await;
        }

        info!("已删除任务 {}，共 {} 个节点", task_id, ids.len());
        Ok(ids)
    }

    /// 删除所有已完成的根任务
    pub async fn clear_completed(&self) -> DownloadResult<Vec<String>> {
        let roots: Vec<String> = self
            .core
            .tree
            .read()
            .await
            .root_tasks()
            .into_iter()
            .filter(|t| t.status == DownloadStatus::Completed)
            .map(|t| t.id)
            .collect();

        let mut cleared = Vec::new();
        for root in roots {
            let result = self.core.tree.write().await.remove_subtree(&root);
            let ids: Vec<String> = result.removed.iter().map(|t| t.id.clone()).collect();
            self.core.store.delete_tasks(&ids).await?;
            for task in &result.removed {
                self.core.emit(DownloadEvent::Removed {
                    task_id: task.id.clone(),
                    root_task_id: task.root_task_id.clone(),
                });
            }
            cleared.extend(ids);
        }
        if !cleared.is_empty() {
            info!("已清除 {} 个已完成任务节点", cleared.len());
        }
        Ok(cleared)
    }

    /// 从持久化记录恢复未完成的任务树，返回重新排队的叶子数
    ///
    /// 上次退出时正在下载的叶子排在最前面，其余按原入队顺序
    pub async fn recover(&self) -> DownloadResult<usize> {
        let state = self.core.store.load_pending_and_active_tasks().await?;
        if state.tasks.is_empty() {
            info!("没有需要恢复的任务");
            return Ok(0);
        }

        let mut readmit: Vec<(u8, u64, u64, String)> = Vec::new();
        {
            let mut tree = self.core.tree.write().await;
            let mut max_order = 0;
            let mut fresh = Vec::with_capacity(state.tasks.len());
            for mut task in state.tasks {
                if tree.contains(&task.id) {
                    continue;
                }
                max_order = max_order.max(task.queue_order);
                if task.is_leaf() {
                    match task.status {
                        // 只在内存中改回排队，持久化状态等调度时再更新
                        DownloadStatus::Downloading => {
                            task.status = DownloadStatus::Queued;
                            readmit.push((0, task.queue_order, task.server_id, task.id.clone()));
                        }
                        DownloadStatus::Queued => {
                            readmit.push((1, task.queue_order, task.server_id, task.id.clone()));
                        }
                        _ => {}
                    }
                    task.speed = 0;
                }
                fresh.push(task);
            }
            tree.insert_tasks(fresh);

            for (task_id, workers) in state.workers {
                if tree.contains(&task_id) {
                    tree.set_workers(&task_id, workers);
                    tree.refresh_leaf_progress(&task_id);
                }
            }
            tree.sort_roots();
            tree.recompute_all();
            self.core.queue_seq.fetch_max(max_order + 1, Ordering::SeqCst);
        }

        readmit.sort();
        let count = readmit.len();
        let leaves: Vec<(u64, String)> = readmit
            .into_iter()
            .map(|(_, _, server_id, id)| (server_id, id))
            .collect();
        self.requeue(&leaves).await;

        info!("✅ 恢复了 {} 个未完成的文件任务", count);
        Ok(count)
    }

    /// 停止调度并挂起所有运行中的任务，状态保持不变以便重启后恢复
    pub async fn shutdown(&self) {
        info!("正在关闭下载管理器...");
        self.core.dispatch_token.cancel();
        let dispatchers = std::mem::take(&mut *self.dispatchers.lock().await);
        for handle in dispatchers {
            let _ = handle.await;
        }

        let waiters: Vec<watch::Receiver<bool>> = self
            .core
            .running
            .lock()
            .await
            .values_mut()
            .map(|rt| rt.halt(HaltKind::Shutdown))
            .collect();
        if !waiters.is_empty() {
            info!("等待 {} 个运行中的任务保存进度", waiters.len());
        }
        for mut rx in waiters {
            let _ = rx.wait_for(|done| *done).await;
        }

        self.aggregator_token.cancel();
        if let Some(handle) = self.aggregator.lock().await.take() {
            let _ = handle.await;
        }
        info!("下载管理器已关闭");
    }

    pub async fn get_task(&self, task_id: &str) -> Option<DownloadTask> {
        self.core.tree.read().await.get(task_id).cloned()
    }

    /// 全部任务（先序）
    pub async fn get_all_tasks(&self) -> Vec<DownloadTask> {
        self.core.tree.read().await.all_tasks()
    }

    pub async fn root_tasks(&self) -> Vec<DownloadTask> {
        self.core.tree.read().await.root_tasks()
    }

    pub async fn children(&self, task_id: &str) -> Vec<DownloadTask> {
        self.core
            .tree
            .read()
            .await
            .children(task_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn worker_tasks(&self, task_id: &str) -> Vec<DownloadWorkerTask> {
        self.core
            .tree
            .read()
            .await
            .workers(task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// 服务器当前占用的槽位数
    pub async fn running_count(&self, server_id: u64) -> usize {
        match self.core.server(server_id) {
            Some(queue) => queue.slots.used_slots().await,
            None => 0,
        }
    }

    pub async fn pending_count(&self, server_id: u64) -> usize {
        match self.core.server(server_id) {
            Some(queue) => queue.pending_len().await,
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::task::MediaType;
    use crate::downloader::testing::*;
    use crate::persistence::MemoryTaskStore;
    use crate::remote::FetchError;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    const BASE_URL: &str = "http://media.local:32400";

    struct Env {
        dir: TempDir,
        fetcher: Arc<MockFetcher>,
        store: Arc<MemoryTaskStore>,
        manager: DownloadManager,
    }

    fn url(name: &str) -> String {
        format!("{}/library/parts/{}", BASE_URL, name)
    }

    fn media_dir(dir: &Path) -> PathBuf {
        dir.join("media")
    }

    fn movie(dir: &Path, name: &str, size: u64) -> DownloadTaskNode {
        DownloadTaskNode::file(
            name,
            MediaType::Movie,
            1,
            format!("/library/parts/{}", name),
            media_dir(dir).join(name),
            size,
        )
    }

    fn episode(dir: &Path, name: &str, size: u64) -> DownloadTaskNode {
        DownloadTaskNode::file(
            name,
            MediaType::Episode,
            1,
            format!("/library/parts/{}", name),
            media_dir(dir).join("Show").join(name),
            size,
        )
    }

    fn show(dir: &Path, seasons: Vec<Vec<(&str, u64)>>) -> DownloadTaskNode {
        let seasons = seasons
            .into_iter()
            .enumerate()
            .map(|(i, eps)| {
                DownloadTaskNode::folder(
                    format!("Season {}", i + 1),
                    MediaType::Season,
                    1,
                    eps.into_iter().map(|(n, s)| episode(dir, n, s)).collect(),
                )
            })
            .collect();
        DownloadTaskNode::folder("Show", MediaType::TvShow, 1, seasons)
    }

    async fn start_manager(
        dir: &Path,
        fetcher: Arc<MockFetcher>,
        store: Arc<MemoryTaskStore>,
        max_concurrent: usize,
    ) -> DownloadManager {
        let manager = DownloadManager::new(test_config(dir), fetcher, store).unwrap();
        manager
            .register_server(ServerConnection::new(1, BASE_URL, None), Some(max_concurrent), 0)
            .await;
        manager
    }

    async fn setup(max_concurrent: usize, fetcher: MockFetcher) -> Env {
        setup_with(max_concurrent, fetcher, |_| {}).await
    }

    async fn setup_with<F>(max_concurrent: usize, fetcher: MockFetcher, tweak: F) -> Env
    where
        F: FnOnce(&mut DownloadConfig),
    {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(fetcher);
        let store = Arc::new(MemoryTaskStore::new());
        let mut config = test_config(dir.path());
        tweak(&mut config);
        let manager = DownloadManager::new(config, fetcher.clone(), store.clone()).unwrap();
        manager
            .register_server(
                ServerConnection::new(1, BASE_URL, None),
                Some(max_concurrent),
                0,
            )
            .await;
        Env {
            dir,
            fetcher,
            store,
            manager,
        }
    }

    async fn leaf_ids(manager: &DownloadManager) -> Vec<String> {
        manager
            .get_all_tasks()
            .await
            .into_iter()
            .filter(|t| t.is_leaf())
            .map(|t| t.id)
            .collect()
    }

    async fn wait_for_count<F, Fut>(what: &str, mut count: F, expected: usize)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = usize>,
    {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let current = count().await;
            if current == expected {
                return;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "{}: 期望 {}，当前 {}",
                what,
                expected,
                current
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_file_completes() {
        let env = setup(1, MockFetcher::new(64)).await;
        let mut events = env.manager.subscribe();

        let id = env
            .manager
            .enqueue(movie(env.dir.path(), "movie.mkv", 1000))
            .await
            .unwrap();
        wait_for_status_event(&mut events, &id, DownloadStatus::Completed).await;

        let task = env.manager.get_task(&id).await.unwrap();
        assert_eq!(task.downloaded_size, 1000);
        assert!(task.completed_at.is_some());

        let dest = media_dir(env.dir.path()).join("movie.mkv");
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), expected_bytes(1000));
        assert!(!env.manager.core.temp_path(&id).exists());

        // 完成后分段记录删除，任务记录保留
        assert!(env.store.workers(&id).is_empty());
        assert_eq!(env.store.task(&id).unwrap().status, DownloadStatus::Completed);
        assert_eq!(env.fetcher.requests().len(), 3);
        assert_eq!(env.fetcher.bytes_served(), 1000);

        env.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_completes_only_after_every_segment() {
        let env = setup_with(1, MockFetcher::new(100), |c| c.read_timeout_secs = 1).await;
        let u = url("big.mkv");
        // 第三个分段读到 2100 后卡住，读取超时后续传
        env.fetcher.stall_at(&u, 2100);

        let id = env
            .manager
            .enqueue(movie(env.dir.path(), "big.mkv", 3000))
            .await
            .unwrap();
        wait_for_workers(&env.manager, &id, "前两个分段完成", |ws| {
            ws.len() == 3 && ws[0].is_complete() && ws[1].is_complete() && ws[2].bytes_received == 100
        })
        .await;

        let task = env.manager.get_task(&id).await.unwrap();
        assert_eq!(task.status, DownloadStatus::Downloading);
        assert_eq!(task.downloaded_size, 2100);
        let dest = media_dir(env.dir.path()).join("big.mkv");
        assert!(!dest.exists());

        env.fetcher.clear_stalls();
        wait_for_status(&env.manager, &id, DownloadStatus::Completed).await;
        let starts: Vec<u64> = env.fetcher.requests_for(&u).iter().map(|r| r.start).collect();
        assert!(starts.contains(&2100));
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), expected_bytes(3000));

        env.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_and_resume_continues_from_offsets() {
        let env = setup(1, MockFetcher::new(100)).await;
        let u = url("film.mkv");
        env.fetcher.stall_at(&u, 400);
        env.fetcher.stall_at(&u, 1000);
        env.fetcher.stall_at(&u, 2000);

        let id = env
            .manager
            .enqueue(movie(env.dir.path(), "film.mkv", 3000))
            .await
            .unwrap();
        wait_for_workers(&env.manager, &id, "第一个分段到 400", |ws| {
            ws.len() == 3 && ws[0].bytes_received == 400
        })
        .await;

        let affected = env.manager.stop(&id).await.unwrap();
        assert_eq!(affected, vec![id.clone()]);
        let task = env.manager.get_task(&id).await.unwrap();
        assert_eq!(task.status, DownloadStatus::Stopped);
        assert_eq!(task.downloaded_size, 400);
        assert_eq!(env.manager.running_count(1).await, 0);

        let saved: Vec<u64> = env.store.workers(&id).iter().map(|w| w.bytes_received).collect();
        assert_eq!(saved, vec![400, 0, 0]);
        assert_eq!(env.store.task(&id).unwrap().status, DownloadStatus::Stopped);

        env.fetcher.clear_stalls();
        let first_round = env.fetcher.requests().len();
        env.manager.resume(&id).await.unwrap();
        wait_for_status(&env.manager, &id, DownloadStatus::Completed).await;

        let mut starts: Vec<u64> = env.fetcher.requests()[first_round..]
            .iter()
            .map(|r| r.start)
            .collect();
        starts.sort();
        assert_eq!(starts, vec![400, 1000, 2000]);
        // 每个字节只下载一次
        assert_eq!(env.fetcher.bytes_served(), 3000);
        let dest = media_dir(env.dir.path()).join("film.mkv");
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), expected_bytes(3000));

        env.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_server_concurrency_limit_and_fifo() {
        let env = setup(2, MockFetcher::new(100).with_chunk_delay(Duration::from_millis(2))).await;
        let mut events = env.manager.subscribe();

        let mut ids = Vec::new();
        for i in 0..5 {
            let name = format!("m{}.mkv", i);
            ids.push(
                env.manager
                    .enqueue(movie(env.dir.path(), &name, 2000))
                    .await
                    .unwrap(),
            );
        }

        let mut active: HashSet<String> = HashSet::new();
        let mut started = Vec::new();
        let mut completed = 0;
        let mut max_active = 0;
        while completed < 5 {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("等待事件超时")
                .unwrap();
            if let DownloadEvent::StatusChanged {
                task_id, new_status, ..
            } = event
            {
                match new_status {
                    DownloadStatus::Downloading => {
                        active.insert(task_id.clone());
                        started.push(task_id);
                    }
                    DownloadStatus::Completed => {
                        active.remove(&task_id);
                        completed += 1;
                    }
                    other => panic!("意外的状态 {:?}", other),
                }
                max_active = max_active.max(active.len());
                assert!(active.len() <= 2);
            }
        }
        assert_eq!(max_active, 2);
        assert_eq!(started, ids);

        env.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_retry_exhaustion_fails_leaf_and_continues() {
        let env = setup(1, MockFetcher::new(64)).await;
        env.fetcher
            .fail(&url("E1.mkv"), u32::MAX, FetchError::HttpStatus(500));

        let root = env
            .manager
            .enqueue(show(env.dir.path(), vec![vec![("E1.mkv", 500), ("E2.mkv", 500)]]))
            .await
            .unwrap();
        let leaves = leaf_ids(&env.manager).await;

        wait_for_status(&env.manager, &leaves[1], DownloadStatus::Completed).await;
        let e1 = env.manager.get_task(&leaves[0]).await.unwrap();
        assert_eq!(e1.status, DownloadStatus::Error);
        assert!(e1.error.unwrap().contains("500"));

        let season = env.manager.children(&root).await.remove(0);
        assert_eq!(season.status, DownloadStatus::Error);
        assert_eq!(env.manager.get_task(&root).await.unwrap().status, DownloadStatus::Error);
        // 每个分段：首次 + 2 次重试
        assert_eq!(env.fetcher.requests_for(&url("E1.mkv")).len(), 9);

        env.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_restart_after_failure_downloads_from_zero() {
        let env = setup(1, MockFetcher::new(64)).await;
        env.fetcher
            .fail(&url("x.mkv"), u32::MAX, FetchError::HttpStatus(503));

        let id = env
            .manager
            .enqueue(movie(env.dir.path(), "x.mkv", 600))
            .await
            .unwrap();
        wait_for_status(&env.manager, &id, DownloadStatus::Error).await;

        env.fetcher.fail(&url("x.mkv"), 0, FetchError::HttpStatus(503));
        let before = env.fetcher.requests().len();
        let restarted = env.manager.restart(&id).await.unwrap();
        assert_eq!(restarted, vec![id.clone()]);
        wait_for_status(&env.manager, &id, DownloadStatus::Completed).await;

        let mut starts: Vec<u64> = env.fetcher.requests()[before..]
            .iter()
            .map(|r| r.start)
            .collect();
        starts.sort();
        assert_eq!(starts, vec![0, 200, 400]);
        assert!(env.manager.get_task(&id).await.unwrap().error.is_none());

        env.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_recover_after_restart() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryTaskStore::new());

        let first = Arc::new(MockFetcher::new(100));
        let u = url("long.mkv");
        first.stall_at(&u, 500);
        first.stall_at(&u, 1500);
        first.stall_at(&u, 2000);
        let manager = start_manager(dir.path(), first.clone(), store.clone(), 1).await;
        let id = manager.enqueue(movie(dir.path(), "long.mkv", 3000)).await.unwrap();
        let queued = manager
            .enqueue(movie(dir.path(), "later.mkv", 300))
            .await
            .unwrap();
        wait_for_workers(&manager, &id, "前两个分段各 500 字节", |ws| {
            ws.len() == 3 && ws[0].bytes_received == 500 && ws[1].bytes_received == 500
        })
        .await;
        manager.shutdown().await;

        // 退出不改变持久化状态
        assert_eq!(store.task(&id).unwrap().status, DownloadStatus::Downloading);
        assert_eq!(store.task(&queued).unwrap().status, DownloadStatus::Queued);

        let second = Arc::new(MockFetcher::new(100));
        let manager = start_manager(dir.path(), second.clone(), store.clone(), 1).await;
        assert_eq!(manager.recover().await.unwrap(), 2);
        assert_eq!(manager.get_task(&id).await.unwrap().downloaded_size, 1000);

        wait_for_status(&manager, &id, DownloadStatus::Completed).await;
        wait_for_status(&manager, &queued, DownloadStatus::Completed).await;

        let mut starts: Vec<u64> = second.requests_for(&u).iter().map(|r| r.start).collect();
        starts.sort();
        assert_eq!(starts, vec![500, 1500, 2000]);
        assert_eq!(second.bytes_served(), 2000 + 300);
        let dest = media_dir(dir.path()).join("long.mkv");
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), expected_bytes(3000));

        // 新入队的序号排在恢复的任务之后
        let next = manager.enqueue(movie(dir.path(), "new.mkv", 10)).await.unwrap();
        let order = |t: Option<DownloadTask>| t.unwrap().queue_order;
        assert!(order(manager.get_task(&next).await) > order(manager.get_task(&queued).await));

        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pause_and_resume_show() {
        let env = setup(1, MockFetcher::new(50)).await;
        env.fetcher.stall_at(&url("E1.mkv"), 50);

        let root = env
            .manager
            .enqueue(show(
                env.dir.path(),
                vec![vec![("E1.mkv", 300), ("E2.mkv", 300)], vec![("E3.mkv", 300)]],
            ))
            .await
            .unwrap();
        let leaves = leaf_ids(&env.manager).await;
        wait_for_downloaded(&env.manager, &leaves[0], 50).await;
        assert_eq!(env.manager.pending_count(1).await, 2);

        let paused = env.manager.pause(&root).await.unwrap();
        assert_eq!(paused.len(), 3);
        for id in leaves.iter().chain([&root]) {
            assert_eq!(env.manager.get_task(id).await.unwrap().status, DownloadStatus::Paused);
        }
        assert_eq!(env.manager.pending_count(1).await, 0);
        assert_eq!(env.manager.running_count(1).await, 0);

        env.fetcher.clear_stalls();
        let resumed = env.manager.resume(&root).await.unwrap();
        assert_eq!(resumed, leaves);
        wait_for_status(&env.manager, &root, DownloadStatus::Completed).await;
        for id in &leaves {
            assert_eq!(env.manager.get_task(id).await.unwrap().status, DownloadStatus::Completed);
        }

        // 已完成的任务不能继续
        let err = env.manager.resume(&root).await.unwrap_err();
        assert!(matches!(err, DownloadError::InvalidTransition { .. }));

        env.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_paused_leaf_becomes_stopped() {
        let env = setup(1, MockFetcher::new(50)).await;
        env.fetcher.stall_at(&url("a.mkv"), 0);
        let a = env.manager.enqueue(movie(env.dir.path(), "a.mkv", 100)).await.unwrap();
        let b = env.manager.enqueue(movie(env.dir.path(), "b.mkv", 100)).await.unwrap();

        assert_eq!(env.manager.pause(&b).await.unwrap(), vec![b.clone()]);
        assert_eq!(env.manager.get_task(&b).await.unwrap().status, DownloadStatus::Paused);
        assert_eq!(env.manager.stop(&b).await.unwrap(), vec![b.clone()]);
        assert_eq!(env.manager.get_task(&b).await.unwrap().status, DownloadStatus::Stopped);
        // 再次停止没有影响
        assert!(env.manager.stop(&b).await.unwrap().is_empty());

        env.manager.stop(&a).await.unwrap();
        env.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_remove_cascades_and_cleans_up() {
        let env = setup(1, MockFetcher::new(50)).await;
        env.fetcher.stall_at(&url("E1.mkv"), 50);
        let mut events = env.manager.subscribe();

        let root = env
            .manager
            .enqueue(show(
                env.dir.path(),
                vec![vec![("E1.mkv", 300), ("E2.mkv", 300)], vec![("E3.mkv", 300)]],
            ))
            .await
            .unwrap();
        let leaves = leaf_ids(&env.manager).await;
        wait_for_downloaded(&env.manager, &leaves[0], 50).await;
        assert!(env.manager.core.temp_path(&leaves[0]).exists());

        // 删除 S2 唯一的剧集，S2 一起删除
        let removed = env.manager.remove(&leaves[2]).await.unwrap();
        assert_eq!(removed.len(), 2);
        let root_task = env.manager.get_task(&root).await.unwrap();
        assert_eq!(root_task.total_size, 600);
        assert_eq!(root_task.children.len(), 1);
        assert!(env.store.task(&leaves[2]).is_none());

        let removed = env.manager.remove(&root).await.unwrap();
        assert_eq!(removed.len(), 4);
        assert!(env.manager.get_all_tasks().await.is_empty());
        assert_eq!(env.store.task_count(), 0);
        assert!(!env.manager.core.temp_path(&leaves[0]).exists());
        assert_eq!(env.manager.running_count(1).await, 0);

        let mut removed_events = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, DownloadEvent::Removed { .. }) {
                removed_events += 1;
            }
        }
        assert_eq!(removed_events, 6);

        let err = env.manager.remove(&root).await.unwrap_err();
        assert!(matches!(err, DownloadError::TaskNotFound(_)));

        env.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_clear_completed() {
        let env = setup(2, MockFetcher::new(64)).await;
        let a = env.manager.enqueue(movie(env.dir.path(), "a.mkv", 100)).await.unwrap();
        let b = env.manager.enqueue(movie(env.dir.path(), "b.mkv", 100)).await.unwrap();
        wait_for_status(&env.manager, &a, DownloadStatus::Completed).await;
        wait_for_status(&env.manager, &b, DownloadStatus::Completed).await;

        let mut cleared = env.manager.clear_completed().await.unwrap();
        cleared.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(cleared, expected);
        assert!(env.manager.root_tasks().await.is_empty());
        assert_eq!(env.store.task_count(), 0);

        // 文件本身保留
        assert!(media_dir(env.dir.path()).join("a.mkv").exists());
        env.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_raise_concurrency_at_runtime() {
        let env = setup(1, MockFetcher::new(50)).await;
        env.fetcher.stall_at(&url("a.mkv"), 50);
        env.fetcher.stall_at(&url("b.mkv"), 50);
        env.manager.enqueue(movie(env.dir.path(), "a.mkv", 100)).await.unwrap();
        env.manager.enqueue(movie(env.dir.path(), "b.mkv", 100)).await.unwrap();

        let m = &env.manager;
        wait_for_count("运行数", move || m.running_count(1), 1).await;
        assert_eq!(m.pending_count(1).await, 1);

        m.update_server_limits(1, Some(2), Some(1024)).await.unwrap();
        wait_for_count("运行数", move || m.running_count(1), 2).await;
        assert_eq!(m.pending_count(1).await, 0);

        let err = m.update_server_limits(9, Some(2), None).await.unwrap_err();
        assert!(matches!(err, DownloadError::UnknownServer(9)));
        m.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_enqueue_validation() {
        let env = setup(1, MockFetcher::new(64)).await;
        let dir = env.dir.path();

        let unknown = DownloadTaskNode::file("x", MediaType::Movie, 7, "/p/x", dir.join("x"), 10);
        assert!(matches!(
            env.manager.enqueue(unknown).await.unwrap_err(),
            DownloadError::UnknownServer(7)
        ));

        let empty = DownloadTaskNode::folder("Show", MediaType::TvShow, 1, vec![]);
        assert!(matches!(
            env.manager.enqueue(empty).await.unwrap_err(),
            DownloadError::Validation(_)
        ));

        assert!(matches!(
            env.manager.enqueue(movie(dir, "zero.mkv", 0)).await.unwrap_err(),
            DownloadError::Validation(_)
        ));

        // 同一批次里重复的目标路径
        let err = env
            .manager
            .enqueue_many(vec![movie(dir, "dup.mkv", 10), movie(dir, "dup.mkv", 10)])
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Validation(_)));
        assert_eq!(env.store.task_count(), 0);

        // 与队列中未完成的任务冲突
        env.fetcher.stall_at(&url("dup.mkv"), 0);
        env.manager.enqueue(movie(dir, "dup.mkv", 10)).await.unwrap();
        let err = env.manager.enqueue(movie(dir, "dup.mkv", 10)).await.unwrap_err();
        assert!(matches!(err, DownloadError::Validation(_)));
        assert_eq!(env.store.task_count(), 1);

        assert!(env.manager.enqueue_many(vec![]).await.unwrap().is_empty());
        assert!(matches!(
            env.manager.stop("missing").await.unwrap_err(),
            DownloadError::TaskNotFound(_)
        ));

        env.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_created_event_per_node() {
        let env = setup(1, MockFetcher::new(64)).await;
        let mut events = env.manager.subscribe();

        let root = env
            .manager
            .enqueue(show(env.dir.path(), vec![vec![("E1.mkv", 100)], vec![("E2.mkv", 100)]]))
            .await
            .unwrap();
        wait_for_status(&env.manager, &root, DownloadStatus::Completed).await;

        let mut created = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let DownloadEvent::Created { task_id, root_task_id, .. } = event {
                assert_eq!(root_task_id, root);
                created.push(task_id);
            }
        }
        let all: Vec<String> = env.manager.get_all_tasks().await.into_iter().map(|t| t.id).collect();
        assert_eq!(created, all);
        assert_eq!(created.len(), 5);

        env.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_recover_waits_for_server_registration() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryTaskStore::new());

        let first = Arc::new(MockFetcher::new(50));
        first.stall_at(&url("a.mkv"), 0);
        let manager = start_manager(dir.path(), first, store.clone(), 1).await;
        let id = manager.enqueue(movie(dir.path(), "a.mkv", 200)).await.unwrap();
        wait_for_status(&manager, &id, DownloadStatus::Downloading).await;
        manager.shutdown().await;

        let second = Arc::new(MockFetcher::new(50));
        let manager =
            DownloadManager::new(test_config(dir.path()), second.clone(), store.clone()).unwrap();
        assert_eq!(manager.recover().await.unwrap(), 1);
        assert_eq!(manager.get_task(&id).await.unwrap().status, DownloadStatus::Queued);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(second.requests().is_empty());

        manager
            .register_server(ServerConnection::new(1, BASE_URL, None), None, 0)
            .await;
        wait_for_status(&manager, &id, DownloadStatus::Completed).await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.segment_count = 0;
        let result = DownloadManager::new(
            config,
            Arc::new(MockFetcher::new(1)),
            Arc::new(MemoryTaskStore::new()),
        );
        assert!(matches!(result, Err(DownloadError::Validation(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_recover_after_move_keeps_finished_file() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryTaskStore::new());

        let first = Arc::new(MockFetcher::new(100));
        let manager = start_manager(dir.path(), first, store.clone(), 1).await;
        let id = manager.enqueue(movie(dir.path(), "done.mkv", 900)).await.unwrap();
        wait_for_status(&manager, &id, DownloadStatus::Completed).await;
        manager.shutdown().await;

        // 模拟文件已移动、完成状态还没写入时进程退出
        let mut workers = SegmentPlanner::new(3, 0).plan(&id, 900);
        for w in workers.iter_mut() {
            w.bytes_received = w.size();
            w.status = crate::downloader::WorkerStatus::Completed;
        }
        store
            .save_task_status(&id, DownloadStatus::Downloading)
            .await
            .unwrap();
        store.save_worker_tasks(&id, &workers).await.unwrap();

        let second = Arc::new(MockFetcher::new(100));
        let manager = start_manager(dir.path(), second.clone(), store.clone(), 1).await;
        assert_eq!(manager.recover().await.unwrap(), 1);
        wait_for_status(&manager, &id, DownloadStatus::Completed).await;

        assert!(second.requests().is_empty());
        let dest = media_dir(dir.path()).join("done.mkv");
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), expected_bytes(900));
        assert!(!manager.core.temp_path(&id).exists());
        assert_eq!(store.task(&id).unwrap().status, DownloadStatus::Completed);
        assert!(store.workers(&id).is_empty());
        let m = &manager;
        wait_for_count("运行数", move || m.running_count(1), 0).await;

        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_recover_without_temp_file_downloads_from_zero() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryTaskStore::new());

        let first = Arc::new(MockFetcher::new(50));
        let u = url("lost.mkv");
        first.stall_at(&u, 100);
        let manager = start_manager(dir.path(), first, store.clone(), 1).await;
        let id = manager.enqueue(movie(dir.path(), "lost.mkv", 900)).await.unwrap();
        wait_for_workers(&manager, &id, "第一段 100 字节，其余完成", |ws| {
            ws.len() == 3
                && ws[0].bytes_received == 100
                && ws[1].is_complete()
                && ws[2].is_complete()
        })
        .await;
        manager.shutdown().await;

        tokio::fs::remove_file(manager.core.temp_path(&id)).await.unwrap();

        let second = Arc::new(MockFetcher::new(50));
        let manager = start_manager(dir.path(), second.clone(), store.clone(), 1).await;
        assert_eq!(manager.recover().await.unwrap(), 1);
        wait_for_status(&manager, &id, DownloadStatus::Completed).await;

        let mut starts: Vec<u64> = second.requests_for(&u).iter().map(|r| r.start).collect();
        starts.sort();
        assert_eq!(starts, vec![0, 300, 600]);
        let dest = media_dir(dir.path()).join("lost.mkv");
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), expected_bytes(900));

        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_merge_failure_sets_error_and_releases_slot() {
        let env = setup(1, MockFetcher::new(64)).await;
        // 目标目录的位置上是一个普通文件，移动必然失败
        tokio::fs::create_dir_all(media_dir(env.dir.path())).await.unwrap();
        tokio::fs::write(media_dir(env.dir.path()).join("Show"), b"")
            .await
            .unwrap();

        let root = env
            .manager
            .enqueue(show(env.dir.path(), vec![vec![("E1.mkv", 300)]]))
            .await
            .unwrap();
        let next = env
            .manager
            .enqueue(movie(env.dir.path(), "next.mkv", 300))
            .await
            .unwrap();
        let e1 = leaf_ids(&env.manager).await.remove(0);

        wait_for_status(&env.manager, &e1, DownloadStatus::Error).await;
        let task = env.manager.get_task(&e1).await.unwrap();
        assert_eq!(task.downloaded_size, 300);
        assert!(task.error.unwrap().contains("移动文件失败"));

        let season = env.manager.children(&root).await.remove(0);
        assert_eq!(season.status, DownloadStatus::Error);
        let root_task = env.manager.get_task(&root).await.unwrap();
        assert_eq!(root_task.status, DownloadStatus::Error);
        assert_eq!(root_task.downloaded_size, 300);
        assert_eq!(env.store.task(&e1).unwrap().status, DownloadStatus::Error);
        // 已下载的数据保留在临时文件中
        assert!(env.manager.core.temp_path(&e1).exists());

        // 槽位已释放，下一个任务照常完成
        wait_for_status(&env.manager, &next, DownloadStatus::Completed).await;
        let dest = media_dir(env.dir.path()).join("next.mkv");
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), expected_bytes(300));

        env.manager.shutdown().await;
    }
}
