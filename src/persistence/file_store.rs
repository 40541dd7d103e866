use super::metadata;
use super::{select_unfinished_trees, worker_owner, PersistedState, TaskStore};
use crate::downloader::{DownloadStatus, DownloadTask, DownloadWorkerTask, WorkerStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// 基于 JSON 文件的任务存储
///
/// 文件读写放到阻塞线程池执行；读-改-写操作用一把锁串行化
#[derive(Debug, Clone)]
pub struct FileTaskStore {
    state_dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileTaskStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Result<Self> {
        let state_dir = state_dir.into();
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("创建状态目录失败: {:?}", state_dir))?;
        info!("任务状态目录: {:?}", state_dir);
        Ok(Self {
            state_dir,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T> + Send + 'static,
    {
        let dir = self.state_dir.clone();
        let lock = self.write_lock.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            op(&dir)
        })
        .await
        .context("持久化线程异常退出")?
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn load_pending_and_active_tasks(&self) -> Result<PersistedState> {
        self.blocking(|dir| {
            let mut all = metadata::scan_all_tasks(dir).context("扫描任务记录失败")?;
            all.sort_by(|a, b| {
                a.queue_order
                    .cmp(&b.queue_order)
                    .then(a.created_at.cmp(&b.created_at))
            });
            let tasks = select_unfinished_trees(all);

            let mut workers = std::collections::HashMap::new();
            for task in tasks.iter().filter(|t| t.is_leaf()) {
                let saved = metadata::load_workers(dir, &task.id)
                    .with_context(|| format!("读取分段记录失败: {}", task.id))?;
                if !saved.is_empty() {
                    workers.insert(task.id.clone(), saved);
                }
            }
            debug!("加载未完成任务 {} 个", tasks.len());
            Ok(PersistedState { tasks, workers })
        })
        .await
    }

    async fn save_tasks(&self, tasks: &[DownloadTask]) -> Result<()> {
        let tasks = tasks.to_vec();
        self.blocking(move |dir| {
            for task in &tasks {
                metadata::save_task(dir, task)
                    .with_context(|| format!("保存任务记录失败: {}", task.id))?;
            }
            Ok(())
        })
        .await
    }

    async fn save_task_status(&self, task_id: &str, status: DownloadStatus) -> Result<()> {
        let task_id = task_id.to_string();
        self.blocking(move |dir| {
            let found = metadata::update_task(dir, &task_id, |t| t.status = status)
                .with_context(|| format!("更新任务状态失败: {}", task_id))?;
            if !found {
                anyhow::bail!("任务记录不存在: {}", task_id);
            }
            Ok(())
        })
        .await
    }

    async fn save_worker_tasks(
        &self,
        task_id: &str,
        workers: &[DownloadWorkerTask],
    ) -> Result<()> {
        let task_id = task_id.to_string();
        let workers = workers.to_vec();
        self.blocking(move |dir| {
            metadata::save_workers(dir, &task_id, &workers)
                .with_context(|| format!("保存分段记录失败: {}", task_id))
        })
        .await
    }

    async fn save_worker_checkpoint(
        &self,
        worker_id: &str,
        bytes_received: u64,
        status: WorkerStatus,
    ) -> Result<()> {
        let worker_id = worker_id.to_string();
        self.blocking(move |dir| {
            let task_id = worker_owner(&worker_id)
                .with_context(|| format!("无效的分段ID: {}", worker_id))?;
            let mut workers = metadata::load_workers(dir, task_id)
                .with_context(|| format!("读取分段记录失败: {}", task_id))?;
            let worker = workers
                .iter_mut()
                .find(|w| w.id == worker_id)
                .with_context(|| format!("分段记录不存在: {}", worker_id))?;
            worker.bytes_received = bytes_received.min(worker.size());
            worker.status = status;
            metadata::save_workers(dir, task_id, &workers)
                .with_context(|| format!("保存分段检查点失败: {}", worker_id))
        })
        .await
    }

    async fn delete_worker_tasks(&self, task_id: &str) -> Result<()> {
        let task_id = task_id.to_string();
        self.blocking(move |dir| {
            metadata::delete_workers(dir, &task_id)
                .with_context(|| format!("删除分段记录失败: {}", task_id))?;
            Ok(())
        })
        .await
    }

    async fn delete_tasks(&self, task_ids: &[String]) -> Result<()> {
        let task_ids = task_ids.to_vec();
        self.blocking(move |dir| {
            for id in &task_ids {
                metadata::delete_task_files(dir, id)
                    .with_context(|| format!("删除任务记录失败: {}", id))?;
            }
            Ok(())
        })
        .await
    }
}
