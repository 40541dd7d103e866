use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// 下载任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// 排队等待
    Queued,
    /// 下载中
    Downloading,
    /// 已暂停（用户发起）
    Paused,
    /// 已停止（用户发起）
    Stopped,
    /// 已完成
    Completed,
    /// 出错（重试耗尽或合并失败）
    Error,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Stopped => "stopped",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Error => "error",
        }
    }

    /// 状态机允许的迁移
    ///
    /// `Completed` 是终态；`Paused/Stopped/Error` 只能回到 `Queued`（恢复或手动重试）
    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Queued, Downloading)
                | (Queued, Paused)
                | (Queued, Stopped)
                | (Queued, Error)
                | (Downloading, Completed)
                | (Downloading, Paused)
                | (Downloading, Stopped)
                | (Downloading, Error)
                | (Paused, Queued)
                | (Paused, Stopped)
                | (Stopped, Queued)
                | (Error, Queued)
        )
    }

    /// 是否仍在队列或下载中
    pub fn is_active(&self) -> bool {
        matches!(self, DownloadStatus::Queued | DownloadStatus::Downloading)
    }

    /// 是否可以通过 resume 重新入队
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Paused | DownloadStatus::Stopped | DownloadStatus::Error
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 媒体类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    TvShow,
    Season,
    Episode,
}

/// 下载任务
///
/// 任务树以扁平表的形式存放，父子关系通过 id 引用。
/// 叶子任务对应一个实际文件；非叶子任务（季、剧集）没有自己的文件，
/// 其大小、进度和状态都由子任务汇总得出。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    /// 任务ID
    pub id: String,
    /// 根任务ID（根任务为自身）
    pub root_task_id: String,
    /// 父任务ID（根任务为 None）
    pub parent_task_id: Option<String>,
    /// 子任务ID，保持入队时的顺序
    #[serde(default)]
    pub children: Vec<String>,
    /// 标题 / 目标文件名
    pub title: String,
    pub media_type: MediaType,
    /// 所属服务器
    pub server_id: u64,
    /// 所属媒体库
    pub library_id: u64,
    /// 服务器上的文件位置（仅叶子）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_location: Option<String>,
    /// 本地目标路径（仅叶子）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_path: Option<PathBuf>,
    /// 文件大小（非叶子为子任务之和）
    pub total_size: u64,
    /// 已下载大小
    pub downloaded_size: u64,
    /// 下载速度 (bytes/s)
    #[serde(default)]
    pub speed: u64,
    /// 任务状态
    pub status: DownloadStatus,
    /// 入队顺序（全局递增）
    pub queue_order: u64,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    #[serde(default)]
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    #[serde(default)]
    pub completed_at: Option<i64>,
    /// 错误信息
    #[serde(default)]
    pub error: Option<String>,
}

impl DownloadTask {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.parent_task_id.is_none()
    }

    /// 标记为下载中
    pub fn mark_downloading(&mut self) {
        self.status = DownloadStatus::Downloading;
        self.error = None;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) {
        self.status = DownloadStatus::Completed;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.downloaded_size = self.total_size;
        self.speed = 0;
        self.error = None;
    }

    /// 标记为失败，保留已下载进度
    pub fn mark_failed(&mut self, error: String) {
        self.status = DownloadStatus::Error;
        self.speed = 0;
        self.error = Some(error);
    }
}

/// 入队请求：一棵待下载的任务树
///
/// 由目录服务提供，叶子节点带文件位置和目标路径，中间节点只负责分组
#[derive(Debug, Clone)]
pub struct DownloadTaskNode {
    pub title: String,
    pub media_type: MediaType,
    pub server_id: u64,
    pub library_id: u64,
    pub file_location: Option<String>,
    pub destination_path: Option<PathBuf>,
    pub total_size: u64,
    pub children: Vec<DownloadTaskNode>,
}

impl DownloadTaskNode {
    /// 文件节点（电影或单集）
    pub fn file(
        title: impl Into<String>,
        media_type: MediaType,
        server_id: u64,
        file_location: impl Into<String>,
        destination_path: impl Into<PathBuf>,
        total_size: u64,
    ) -> Self {
        Self {
            title: title.into(),
            media_type,
            server_id,
            library_id: 0,
            file_location: Some(file_location.into()),
            destination_path: Some(destination_path.into()),
            total_size,
            children: Vec::new(),
        }
    }

    /// 分组节点（剧集或季）
    pub fn folder(
        title: impl Into<String>,
        media_type: MediaType,
        server_id: u64,
        children: Vec<DownloadTaskNode>,
    ) -> Self {
        Self {
            title: title.into(),
            media_type,
            server_id,
            library_id: 0,
            file_location: None,
            destination_path: None,
            total_size: 0,
            children,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// 结构校验：分组节点至少一个子节点，叶子需要非零大小、文件位置和带文件名的目标路径，
    /// 整棵树属于同一台服务器
    pub fn validate(&self) -> Result<(), String> {
        self.validate_with_server(self.server_id)
    }

    fn validate_with_server(&self, server_id: u64) -> Result<(), String> {
        if self.server_id != server_id {
            return Err(format!(
                "{}: 服务器 {} 与根任务的服务器 {} 不一致",
                self.title, self.server_id, server_id
            ));
        }

        if matches!(self.media_type, MediaType::TvShow | MediaType::Season) && self.is_leaf() {
            return Err(format!("{}: 分组任务没有任何子任务", self.title));
        }

        if self.is_leaf() {
            if self.total_size == 0 {
                return Err(format!("{}: 文件大小为 0", self.title));
            }
            match self.file_location.as_deref() {
                Some(location) if !location.trim().is_empty() => {}
                _ => return Err(format!("{}: 缺少文件位置", self.title)),
            }
            match &self.destination_path {
                Some(path) if path.file_name().is_some() => {}
                _ => return Err(format!("{}: 目标路径无法解析出文件名", self.title)),
            }
            return Ok(());
        }

        for child in &self.children {
            child.validate_with_server(server_id)?;
        }
        Ok(())
    }

    /// 叶子节点数量
    pub fn leaf_count(&self) -> usize {
        if self.is_leaf() {
            1
        } else {
            self.children.iter().map(|c| c.leaf_count()).sum()
        }
    }

    /// 先序遍历所有叶子的目标路径
    pub fn leaf_destinations(&self) -> Vec<&PathBuf> {
        let mut out = Vec::new();
        self.collect_destinations(&mut out);
        out
    }

    fn collect_destinations<'a>(&'a self, out: &mut Vec<&'a PathBuf>) {
        if self.is_leaf() {
            if let Some(path) = &self.destination_path {
                out.push(path);
            }
        } else {
            for child in &self.children {
                child.collect_destinations(out);
            }
        }
    }
}

/// 生成新的任务ID
pub fn new_task_id() -> String {
    Uuid::new_v4().to_string()
}
