//! 扁平任务表
//!
//! 所有节点按 id 存放在一张表里，父子关系只用 id 引用。非叶子节点的大小、进度、
//! 速度和状态都在叶子变化后自底向上重新计算，从不直接设置。

use super::aggregator::rollup_status;
use super::segment::{DownloadWorkerTask, WorkerStatus};
use super::task::{new_task_id, DownloadStatus, DownloadTask, DownloadTaskNode};
use crate::error::{DownloadError, DownloadResult};
use crate::events::DownloadEvent;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// 一次状态变化，用于发布事件和持久化
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub task_id: String,
    pub root_task_id: String,
    pub old_status: DownloadStatus,
    pub new_status: DownloadStatus,
    pub error: Option<String>,
}

impl StatusChange {
    pub fn to_event(&self) -> DownloadEvent {
        DownloadEvent::StatusChanged {
            task_id: self.task_id.clone(),
            root_task_id: self.root_task_id.clone(),
            old_status: self.old_status,
            new_status: self.new_status,
            error: self.error.clone(),
        }
    }
}

/// 把入队请求展开为任务记录（先序），非叶子大小为子任务之和
pub fn materialize(node: &DownloadTaskNode, queue_seq: &AtomicU64) -> Vec<DownloadTask> {
    let mut out = Vec::new();
    let now = chrono::Utc::now().timestamp();
    build(node, None, None, queue_seq, now, &mut out);
    out
}

fn build(
    node: &DownloadTaskNode,
    root: Option<&str>,
    parent: Option<&str>,
    queue_seq: &AtomicU64,
    now: i64,
    out: &mut Vec<DownloadTask>,
) -> (String, u64) {
    let id = new_task_id();
    let root_id = root.unwrap_or(id.as_str()).to_string();
    let leaf = node.is_leaf();

    let pos = out.len();
    out.push(DownloadTask {
        id: id.clone(),
        root_task_id: root_id.clone(),
        parent_task_id: parent.map(str::to_string),
        children: Vec::new(),
        title: node.title.clone(),
        media_type: node.media_type,
        server_id: node.server_id,
        library_id: node.library_id,
        file_location: if leaf { node.file_location.clone() } else { None },
        destination_path: if leaf { node.destination_path.clone() } else { None },
        total_size: if leaf { node.total_size } else { 0 },
        downloaded_size: 0,
        speed: 0,
        status: DownloadStatus::Queued,
        queue_order: queue_seq.fetch_add(1, Ordering::SeqCst),
        created_at: now,
        started_at: None,
        completed_at: None,
        error: None,
    });

    if leaf {
        return (id, node.total_size);
    }

    let mut children = Vec::with_capacity(node.children.len());
    let mut size = 0;
    for child in &node.children {
        let (child_id, child_size) = build(child, Some(&root_id), Some(&id), queue_seq, now, out);
        children.push(child_id);
        size += child_size;
    }
    out[pos].children = children;
    out[pos].total_size = size;
    (id, size)
}

#[derive(Debug, Default)]
pub struct TaskTree {
    tasks: HashMap<String, DownloadTask>,
    /// 根任务，按入队顺序
    roots: Vec<String>,
    /// 叶子任务ID -> 分段记录
    workers: HashMap<String, Vec<DownloadWorkerTask>>,
}

impl TaskTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入任务记录（父节点必须先于子节点出现）
    pub fn insert_tasks(&mut self, tasks: Vec<DownloadTask>) {
        for task in tasks {
            if task.is_root() && !self.roots.contains(&task.id) {
                self.roots.push(task.id.clone());
            }
            self.tasks.insert(task.id.clone(), task);
        }
    }

    /// 按入队顺序重排根任务（恢复时记录的读取顺序不可靠）
    pub fn sort_roots(&mut self) {
        let tasks = &self.tasks;
        self.roots
            .sort_by_key(|id| tasks.get(id).map(|t| t.queue_order).unwrap_or(u64::MAX));
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn get(&self, task_id: &str) -> Option<&DownloadTask> {
        self.tasks.get(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn require(&self, task_id: &str) -> DownloadResult<&DownloadTask> {
        self.tasks
            .get(task_id)
            .ok_or_else(|| DownloadError::TaskNotFound(task_id.to_string()))
    }

    pub fn children(&self, task_id: &str) -> Vec<&DownloadTask> {
        self.tasks
            .get(task_id)
            .map(|t| t.children.iter().filter_map(|c| self.tasks.get(c)).collect())
            .unwrap_or_default()
    }

    /// 祖先ID，父节点在前，根节点在最后
    pub fn ancestors(&self, task_id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut current = self.tasks.get(task_id).and_then(|t| t.parent_task_id.clone());
        while let Some(id) = current {
            current = self.tasks.get(&id).and_then(|t| t.parent_task_id.clone());
            out.push(id);
        }
        out
    }

    /// 子树的全部ID（先序，包括自身）
    pub fn subtree_ids(&self, task_id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = vec![task_id.to_string()];
        while let Some(id) = stack.pop() {
            if let Some(task) = self.tasks.get(&id) {
                stack.extend(task.children.iter().rev().cloned());
                out.push(id);
            }
        }
        out
    }

    /// 子树下的全部叶子（先序）
    pub fn leaves_under(&self, task_id: &str) -> DownloadResult<Vec<String>> {
        self.require(task_id)?;
        Ok(self
            .subtree_ids(task_id)
            .into_iter()
            .filter(|id| self.tasks.get(id).is_some_and(|t| t.is_leaf()))
            .collect())
    }

    /// 整张表的先序快照
    pub fn all_tasks(&self) -> Vec<DownloadTask> {
        self.roots
            .iter()
            .flat_map(|root| self.subtree_ids(root))
            .filter_map(|id| self.tasks.get(&id).cloned())
            .collect()
    }

    /// 无序遍历全部节点
    pub fn iter(&self) -> impl Iterator<Item = &DownloadTask> {
        self.tasks.values()
    }

    pub fn root_tasks(&self) -> Vec<DownloadTask> {
        self.roots
            .iter()
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect()
    }

    /// 是否已有未完成的叶子写向同一目标路径
    pub fn has_pending_destination(&self, path: &Path) -> bool {
        self.tasks.values().any(|t| {
            t.is_leaf()
                && t.status != DownloadStatus::Completed
                && t.destination_path.as_deref() == Some(path)
        })
    }

    pub fn workers(&self, task_id: &str) -> Option<&Vec<DownloadWorkerTask>> {
        self.workers.get(task_id)
    }

    pub fn workers_mut(&mut self, task_id: &str) -> Option<&mut Vec<DownloadWorkerTask>> {
        self.workers.get_mut(task_id)
    }

    pub fn set_workers(&mut self, task_id: &str, workers: Vec<DownloadWorkerTask>) {
        self.workers.insert(task_id.to_string(), workers);
    }

    pub fn remove_workers(&mut self, task_id: &str) -> Option<Vec<DownloadWorkerTask>> {
        self.workers.remove(task_id)
    }

    /// 设置叶子状态并向上汇总
    ///
    /// 非叶子的状态只能由子任务汇总得出，直接设置返回 `NotLeaf`
    pub fn set_leaf_status(
        &mut self,
        task_id: &str,
        status: DownloadStatus,
        error: Option<String>,
    ) -> DownloadResult<Vec<StatusChange>> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| DownloadError::TaskNotFound(task_id.to_string()))?;
        if !task.is_leaf() {
            return Err(DownloadError::NotLeaf(task_id.to_string()));
        }

        let old = task.status;
        if !old.can_transition_to(status) {
            return Err(DownloadError::InvalidTransition {
                task_id: task_id.to_string(),
                from: old,
                to: status,
            });
        }

        match status {
            DownloadStatus::Downloading => task.mark_downloading(),
            DownloadStatus::Completed => task.mark_completed(),
            DownloadStatus::Error => {
                task.mark_failed(error.clone().unwrap_or_else(|| "未知错误".to_string()))
            }
            DownloadStatus::Queued => {
                task.status = status;
                task.speed = 0;
                task.error = None;
            }
            DownloadStatus::Paused | DownloadStatus::Stopped => {
                task.status = status;
                task.speed = 0;
            }
        }

        let mut changes = Vec::new();
        if old != status {
            changes.push(StatusChange {
                task_id: task.id.clone(),
                root_task_id: task.root_task_id.clone(),
                old_status: old,
                new_status: status,
                error: task.error.clone(),
            });
        }

        if status != DownloadStatus::Downloading {
            if let Some(workers) = self.workers.get_mut(task_id) {
                for worker in workers.iter_mut() {
                    worker.speed = 0;
                }
            }
        }

        changes.extend(self.recompute_upwards(task_id));
        Ok(changes)
    }

    /// 根据分段记录刷新叶子的已下载量和速度，并向上汇总
    pub fn refresh_leaf_progress(&mut self, task_id: &str) -> Vec<StatusChange> {
        let Some(workers) = self.workers.get(task_id) else {
            return Vec::new();
        };
        let downloaded: u64 = workers.iter().map(|w| w.bytes_received).sum();
        let speed: u64 = workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Downloading)
            .map(|w| w.speed)
            .sum();

        if let Some(task) = self.tasks.get_mut(task_id) {
            task.downloaded_size = downloaded.min(task.total_size);
            task.speed = if task.status == DownloadStatus::Downloading {
                speed
            } else {
                0
            };
        }
        self.recompute_upwards(task_id)
    }

    /// 清零叶子进度（重新下载）
    pub fn reset_leaf_progress(&mut self, task_id: &str) {
        self.workers.remove(task_id);
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.downloaded_size = 0;
            task.speed = 0;
            task.started_at = None;
            task.completed_at = None;
        }
        self.recompute_upwards(task_id);
    }

    /// 重新计算所有祖先的大小、进度、速度和状态
    pub fn recompute_upwards(&mut self, task_id: &str) -> Vec<StatusChange> {
        self.ancestors(task_id)
            .into_iter()
            .filter_map(|id| self.recompute_node(&id))
            .collect()
    }

    /// 重新计算所有非叶子节点（恢复后调用）
    pub fn recompute_all(&mut self) -> Vec<StatusChange> {
        let mut changes = Vec::new();
        for root in self.roots.clone() {
            // 先序反过来就是子节点先于父节点
            for id in self.subtree_ids(&root).into_iter().rev() {
                if self.tasks.get(&id).is_some_and(|t| !t.is_leaf()) {
                    changes.extend(self.recompute_node(&id));
                }
            }
        }
        changes
    }

    fn recompute_node(&mut self, task_id: &str) -> Option<StatusChange> {
        let task = self.tasks.get(task_id)?;
        if task.is_leaf() {
            return None;
        }

        let children: Vec<&DownloadTask> = task
            .children
            .iter()
            .filter_map(|c| self.tasks.get(c))
            .collect();
        let total_size = children.iter().map(|c| c.total_size).sum();
        let downloaded_size = children.iter().map(|c| c.downloaded_size).sum();
        let speed = children.iter().map(|c| c.speed).sum();
        let statuses: Vec<DownloadStatus> = children.iter().map(|c| c.status).collect();
        let status = rollup_status(&statuses);
        let started_at = children.iter().filter_map(|c| c.started_at).min();
        let error = children.iter().find_map(|c| c.error.clone());

        let task = self.tasks.get_mut(task_id)?;
        task.total_size = total_size;
        task.downloaded_size = downloaded_size;
        task.speed = speed;
        task.started_at = started_at;
        task.error = if status == DownloadStatus::Error {
            error
        } else {
            None
        };

        let old = task.status;
        if old == status {
            return None;
        }
        task.status = status;
        task.completed_at = if status == DownloadStatus::Completed {
            Some(chrono::Utc::now().timestamp())
        } else {
            None
        };
        Some(StatusChange {
            task_id: task.id.clone(),
            root_task_id: task.root_task_id.clone(),
            old_status: old,
            new_status: status,
            error: task.error.clone(),
        })
    }

    /// 叶子及其祖先的进度事件
    pub fn progress_events(&self, task_id: &str) -> Vec<DownloadEvent> {
        std::iter::once(task_id.to_string())
            .chain(self.ancestors(task_id))
            .filter_map(|id| self.tasks.get(&id))
            .map(|t| DownloadEvent::Progress {
                task_id: t.id.clone(),
                root_task_id: t.root_task_id.clone(),
                downloaded_size: t.downloaded_size,
                total_size: t.total_size,
                speed: t.speed,
                status: t.status,
            })
            .collect()
    }

    /// 删除子树；父节点因此变空时一并删除
    pub fn remove_subtree(&mut self, task_id: &str) -> RemovedSubtree {
        let mut result = RemovedSubtree::default();
        let mut target = task_id.to_string();

        loop {
            let parent = self.tasks.get(&target).and_then(|t| t.parent_task_id.clone());
            for id in self.subtree_ids(&target) {
                self.workers.remove(&id);
                if let Some(task) = self.tasks.remove(&id) {
                    result.removed.push(task);
                }
            }
            self.roots.retain(|r| *r != target);

            let Some(parent_id) = parent else {
                return result;
            };
            let Some(parent) = self.tasks.get_mut(&parent_id) else {
                return result;
            };
            parent.children.retain(|c| *c != target);
            if !parent.children.is_empty() {
                result.changes.extend(self.recompute_node(&parent_id));
                result.changes.extend(self.recompute_upwards(&parent_id));
                result.survivor = Some(parent_id);
                return result;
            }
            // 空的分组节点没有意义，继续向上删除
            target = parent_id;
        }
    }
}

/// [`TaskTree::remove_subtree`] 的结果
#[derive(Debug, Default)]
pub struct RemovedSubtree {
    /// 被删除的任务（先序）
    pub removed: Vec<DownloadTask>,
    /// 仍然存在的最近祖先
    pub survivor: Option<String>,
    /// 祖先重新汇总产生的状态变化
    pub changes: Vec<StatusChange>,
}
