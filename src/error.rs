//! 下载核心错误类型
//!
//! - `Validation`：任务树不合法，入队时直接拒绝，不会进入队列
//! - 网络类瞬时错误由 worker 内部重试吸收，见 [`crate::remote::FetchError`]
//! - 合并失败见 [`crate::downloader::finalize::MergeError`]
//! - 容量不足不是错误，任务只会排队等待

use crate::downloader::DownloadStatus;
use thiserror::Error;

/// 下载核心对外操作的统一错误
#[derive(Debug, Error)]
pub enum DownloadError {
    /// 任务树校验失败
    #[error("任务校验失败: {0}")]
    Validation(String),

    /// 任务不存在
    #[error("任务不存在: {0}")]
    TaskNotFound(String),

    /// 非法的状态迁移
    #[error("任务 {task_id} 不允许从 {from} 迁移到 {to}")]
    InvalidTransition {
        task_id: String,
        from: DownloadStatus,
        to: DownloadStatus,
    },

    /// 非叶子任务的状态由子任务汇总得出，不能直接设置
    #[error("任务 {0} 不是文件任务，其状态只能由子任务汇总")]
    NotLeaf(String),

    /// 服务器未注册连接信息
    #[error("服务器 {0} 未注册")]
    UnknownServer(u64),

    /// 持久化网关错误
    #[error("持久化失败: {0:#}")]
    Persistence(#[from] anyhow::Error),

    /// 本地文件错误
    #[error("文件操作失败: {0}")]
    Io(#[from] std::io::Error),
}

pub type DownloadResult<T> = std::result::Result<T, DownloadError>;
