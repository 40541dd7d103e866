use crate::downloader::DownloadStatus;
use serde::{Deserialize, Serialize};

/// 下载任务事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// 任务创建（每个节点一条）
    Created {
        task_id: String,
        root_task_id: String,
        parent_task_id: Option<String>,
        title: String,
        total_size: u64,
    },
    /// 进度更新（按节流间隔合并）
    Progress {
        task_id: String,
        root_task_id: String,
        downloaded_size: u64,
        total_size: u64,
        speed: u64,
        status: DownloadStatus,
    },
    /// 状态变更（从不合并）
    StatusChanged {
        task_id: String,
        root_task_id: String,
        old_status: DownloadStatus,
        new_status: DownloadStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// 任务删除
    Removed {
        task_id: String,
        root_task_id: String,
    },
}

impl DownloadEvent {
    pub fn task_id(&self) -> &str {
        match self {
            DownloadEvent::Created { task_id, .. }
            | DownloadEvent::Progress { task_id, .. }
            | DownloadEvent::StatusChanged { task_id, .. }
            | DownloadEvent::Removed { task_id, .. } => task_id,
        }
    }

    pub fn root_task_id(&self) -> &str {
        match self {
            DownloadEvent::Created { root_task_id, .. }
            | DownloadEvent::Progress { root_task_id, .. }
            | DownloadEvent::StatusChanged { root_task_id, .. }
            | DownloadEvent::Removed { root_task_id, .. } => root_task_id,
        }
    }
}
