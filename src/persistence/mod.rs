//! 任务持久化模块
//!
//! 下载核心通过 [`TaskStore`] 读写任务记录和分段记录，具体存储方式由实现决定：
//! - [`MemoryTaskStore`]：进程内存储，用于嵌入和测试
//! - [`FileTaskStore`]：每个任务一个 JSON 文件，先写临时文件再原子重命名
//!
//! 一次保存成功返回后，进程崩溃重启也能读到该次写入的内容。
//!
//! ## 文件结构
//!
//! ```text
//! state/
//! ├── {task_id}.meta       # 任务记录（JSON）
//! └── {task_id}.workers    # 叶子任务的分段记录（JSON 数组）
//! ```

pub mod file_store;
pub mod memory;
pub mod metadata;

use crate::downloader::{DownloadStatus, DownloadTask, DownloadWorkerTask, WorkerStatus};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

pub use file_store::FileTaskStore;
pub use memory::MemoryTaskStore;

/// 启动时加载的未完成任务
#[derive(Debug, Clone, Default)]
pub struct PersistedState {
    /// 仍有未完成叶子的任务树（整棵树的全部节点）
    pub tasks: Vec<DownloadTask>,
    /// 叶子任务ID -> 分段记录
    pub workers: HashMap<String, Vec<DownloadWorkerTask>>,
}

/// 持久化网关
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 加载所有仍有未完成叶子的任务树及其分段记录
    async fn load_pending_and_active_tasks(&self) -> Result<PersistedState>;

    /// 新增或覆盖任务记录
    async fn save_tasks(&self, tasks: &[DownloadTask]) -> Result<()>;

    /// 更新任务状态
    async fn save_task_status(&self, task_id: &str, status: DownloadStatus) -> Result<()>;

    /// 覆盖叶子任务的全部分段记录
    async fn save_worker_tasks(&self, task_id: &str, workers: &[DownloadWorkerTask])
        -> Result<()>;

    /// 分段检查点
    async fn save_worker_checkpoint(
        &self,
        worker_id: &str,
        bytes_received: u64,
        status: WorkerStatus,
    ) -> Result<()>;

    async fn delete_worker_tasks(&self, task_id: &str) -> Result<()>;

    async fn delete_tasks(&self, task_ids: &[String]) -> Result<()>;
}

/// 从分段ID（`{task_id}-{index}`）解析出任务ID
pub fn worker_owner(worker_id: &str) -> Option<&str> {
    let (task_id, index) = worker_id.rsplit_once('-')?;
    index.parse::<usize>().ok()?;
    Some(task_id)
}

/// 只保留仍有未完成叶子的任务树
pub fn select_unfinished_trees(tasks: Vec<DownloadTask>) -> Vec<DownloadTask> {
    let unfinished_roots: HashSet<String> = tasks
        .iter()
        .filter(|t| t.is_leaf() && t.status != DownloadStatus::Completed)
        .map(|t| t.root_task_id.clone())
        .collect();

    tasks
        .into_iter()
        .filter(|t| unfinished_roots.contains(&t.root_task_id))
        .collect()
}
