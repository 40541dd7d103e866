// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
    /// 媒体服务器列表（地址和令牌由外部解析好）
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 下载配置
///
/// 重试次数、检查点间隔等数值都可以在配置文件中覆盖，默认值只是保守的起点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 未完成文件（`{task_id}.part`）的存放目录
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 大文件切分的分段数
    #[serde(default = "default_segment_count")]
    pub segment_count: u32,
    /// 小于该大小的文件只用一个分段
    #[serde(default = "default_min_split_size_bytes")]
    pub min_split_size_bytes: u64,
    /// 每台服务器同时下载的文件数
    #[serde(default = "default_max_concurrent_per_server")]
    pub max_concurrent_per_server: usize,
    /// 分段失败后的最大重试次数（不含首次请求），0 表示不重试
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试退避基数
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// 重试退避上限
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// 单次读取超时（秒）
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// 建立连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 进度上报最小间隔
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// 分段偏移持久化间隔
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
    /// 合并（重命名到目标路径）最大尝试次数
    #[serde(default = "default_merge_retries")]
    pub merge_retries: u32,
    /// 合并重试间隔
    #[serde(default = "default_merge_retry_delay_ms")]
    pub merge_retry_delay_ms: u64,
    /// worker → 聚合器通道容量，同时也是事件广播容量
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads/.incomplete")
}

fn default_segment_count() -> u32 {
    4
}

fn default_min_split_size_bytes() -> u64 {
    50 * 1024 * 1024 // 50MB
}

fn default_max_concurrent_per_server() -> usize {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_progress_interval_ms() -> u64 {
    200
}

fn default_checkpoint_interval_ms() -> u64 {
    1000
}

fn default_merge_retries() -> u32 {
    3
}

fn default_merge_retry_delay_ms() -> u64 {
    500
}

fn default_event_channel_capacity() -> usize {
    1024
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            segment_count: default_segment_count(),
            min_split_size_bytes: default_min_split_size_bytes(),
            max_concurrent_per_server: default_max_concurrent_per_server(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            read_timeout_secs: default_read_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            progress_interval_ms: default_progress_interval_ms(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            merge_retries: default_merge_retries(),
            merge_retry_delay_ms: default_merge_retry_delay_ms(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl DownloadConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn merge_retry_delay(&self) -> Duration {
        Duration::from_millis(self.merge_retry_delay_ms)
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.segment_count == 0 {
            anyhow::bail!("segment_count 必须大于 0");
        }
        if self.max_concurrent_per_server == 0 {
            anyhow::bail!("max_concurrent_per_server 必须大于 0");
        }
        if self.merge_retries == 0 {
            anyhow::bail!("merge_retries 必须大于 0");
        }
        if self.event_channel_capacity == 0 {
            anyhow::bail!("event_channel_capacity 必须大于 0");
        }
        if self.read_timeout_secs == 0 {
            anyhow::bail!("read_timeout_secs 必须大于 0");
        }
        Ok(())
    }
}

/// 持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 任务与分段记录目录
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// 启动时是否自动恢复未完成任务
    #[serde(default = "default_auto_recover_tasks")]
    pub auto_recover_tasks: bool,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_auto_recover_tasks() -> bool {
    true
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            auto_recover_tasks: default_auto_recover_tasks(),
        }
    }
}

/// 媒体服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server_id: u64,
    #[serde(default)]
    pub name: String,
    /// 已解析可达的服务器地址
    pub base_url: String,
    /// 访问令牌
    #[serde(default)]
    pub access_token: Option<String>,
    /// 覆盖 `download.max_concurrent_per_server`
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    /// 限速（KB/s），0 表示不限速
    #[serde(default)]
    pub speed_limit_kbps: u64,
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context(format!("读取配置文件失败: {}", path))?;

        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;
        config.download.validate().context("下载配置不合法")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.download.validate().context("下载配置不合法")?;

        let content = toml::to_string_pretty(self).context("序列化配置失败")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("创建配置目录失败")?;
        }

        fs::write(path, content).await.context("写入配置文件失败")?;
        tracing::info!("配置已保存到: {}", path);
        Ok(())
    }

    /// 加载配置，文件不存在或解析失败时使用默认值
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("已加载配置文件: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("加载配置失败（{:#}），使用默认配置", e);
                Self::default()
            }
        }
    }
}
