use super::{select_unfinished_trees, worker_owner, PersistedState, TaskStore};
use crate::downloader::{DownloadStatus, DownloadTask, DownloadWorkerTask, WorkerStatus};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<String, DownloadTask>,
    /// 保持插入顺序
    order: Vec<String>,
    workers: HashMap<String, Vec<DownloadWorkerTask>>,
}

/// 进程内任务存储
///
/// 可以在多个 `DownloadManager` 之间共享同一个实例来模拟进程重启
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    inner: Mutex<Inner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(&self, task_id: &str) -> Option<DownloadTask> {
        self.inner.lock().tasks.get(task_id).cloned()
    }

    pub fn workers(&self, task_id: &str) -> Vec<DownloadWorkerTask> {
        self.inner
            .lock()
            .workers
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn task_count(&self) -> usize {
        self.inner.lock().tasks.len()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn load_pending_and_active_tasks(&self) -> Result<PersistedState> {
        let inner = self.inner.lock();
        let all: Vec<DownloadTask> = inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect();
        let tasks = select_unfinished_trees(all);
        let workers = tasks
            .iter()
            .filter_map(|t| inner.workers.get(&t.id).map(|w| (t.id.clone(), w.clone())))
            .collect();
        Ok(PersistedState { tasks, workers })
    }

    async fn save_tasks(&self, tasks: &[DownloadTask]) -> Result<()> {
        let mut inner = self.inner.lock();
        for task in tasks {
            if inner.tasks.insert(task.id.clone(), task.clone()).is_none() {
                inner.order.push(task.id.clone());
            }
        }
        Ok(())
    }

    async fn save_task_status(&self, task_id: &str, status: DownloadStatus) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.tasks.get_mut(task_id) {
            Some(task) => {
                task.status = status;
                Ok(())
            }
            None => anyhow::bail!("任务记录不存在: {}", task_id),
        }
    }

    async fn save_worker_tasks(
        &self,
        task_id: &str,
        workers: &[DownloadWorkerTask],
    ) -> Result<()> {
        self.inner
            .lock()
            .workers
            .insert(task_id.to_string(), workers.to_vec());
        Ok(())
    }

    async fn save_worker_checkpoint(
        &self,
        worker_id: &str,
        bytes_received: u64,
        status: WorkerStatus,
    ) -> Result<()> {
        let Some(task_id) = worker_owner(worker_id) else {
            anyhow::bail!("无效的分段ID: {}", worker_id);
        };
        let mut inner = self.inner.lock();
        let worker = inner
            .workers
            .get_mut(task_id)
            .and_then(|ws| ws.iter_mut().find(|w| w.id == worker_id));
        match worker {
            Some(worker) => {
                worker.bytes_received = bytes_received.min(worker.size());
                worker.status = status;
                Ok(())
            }
            None => anyhow::bail!("分段记录不存在: {}", worker_id),
        }
    }

    async fn delete_worker_tasks(&self, task_id: &str) -> Result<()> {
        self.inner.lock().workers.remove(task_id);
        Ok(())
    }

    async fn delete_tasks(&self, task_ids: &[String]) -> Result<()> {
        let mut inner = self.inner.lock();
        for id in task_ids {
            inner.tasks.remove(id);
            inner.workers.remove(id);
        }
        inner.order.retain(|id| !task_ids.contains(id));
        Ok(())
    }
}
