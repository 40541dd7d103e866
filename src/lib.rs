// Media Ripper Library
// 媒体服务器下载核心库：剧集/季/集任务树、分段下载、每服务器并发控制、进度汇总与断点恢复

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志模块
pub mod logging;

// 下载引擎模块
pub mod downloader;

// 任务事件
pub mod events;

// 任务持久化
pub mod persistence;

// 远程取数
pub mod remote;

// 导出常用类型
pub use config::AppConfig;
pub use downloader::{
    DownloadManager, DownloadStatus, DownloadTask, DownloadTaskNode, DownloadWorkerTask,
    MediaType, WorkerStatus,
};
pub use error::{DownloadError, DownloadResult};
pub use events::DownloadEvent;
pub use persistence::{FileTaskStore, MemoryTaskStore, TaskStore};
pub use remote::{FetchError, HttpFetcher, RemoteFetcher, ServerConnection};
