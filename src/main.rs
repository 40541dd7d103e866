use anyhow::Context;
use media_ripper::{
    logging, AppConfig, DownloadEvent, DownloadManager, FileTaskStore, HttpFetcher,
    ServerConnection,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

const CONFIG_PATH: &str = "config/app.toml";

/// 把任务事件写进日志
async fn log_events(manager: Arc<DownloadManager>) {
    let mut events = manager.subscribe();
    loop {
        match events.recv().await {
            Ok(DownloadEvent::StatusChanged {
                task_id,
                old_status,
                new_status,
                error,
                ..
            }) => match error {
                Some(error) => warn!(
                    "任务 {} 状态变更: {:?} -> {:?}, 错误: {}",
                    task_id, old_status, new_status, error
                ),
                None => info!(
                    "任务 {} 状态变更: {:?} -> {:?}",
                    task_id, old_status, new_status
                ),
            },
            Ok(DownloadEvent::Progress {
                task_id,
                downloaded_size,
                total_size,
                speed,
                ..
            }) => debug!(
                "任务 {} 进度: {}/{} bytes, 速度 {} B/s",
                task_id, downloaded_size, total_size, speed
            ),
            Ok(event) => debug!("任务事件: {:?}", event),
            Err(RecvError::Lagged(n)) => warn!("事件日志落后，跳过 {} 条事件", n),
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 🔥 配置加载失败时使用默认配置，日志系统初始化后再报告
    let loaded = AppConfig::load_from_file(CONFIG_PATH).await;
    let config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => AppConfig::default(),
    };

    // 🔥 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    info!("Media Ripper v{} 启动中...", env!("CARGO_PKG_VERSION"));
    if let Err(e) = loaded {
        warn!("加载配置失败（{:#}），使用默认配置", e);
    }

    let store = FileTaskStore::new(&config.persistence.state_dir)?;
    let fetcher = HttpFetcher::new(&config.download)?;
    let manager = Arc::new(
        DownloadManager::new(config.download.clone(), Arc::new(fetcher), Arc::new(store))
            .context("创建下载管理器失败")?,
    );

    tokio::spawn(log_events(manager.clone()));

    for server in &config.servers {
        let connection = ServerConnection::new(
            server.server_id,
            server.base_url.clone(),
            server.access_token.clone(),
        );
        manager
            .register_server(connection, server.max_concurrent, server.speed_limit_kbps)
            .await;
    }
    info!("已注册 {} 台媒体服务器", config.servers.len());

    if config.persistence.auto_recover_tasks {
        let recovered = manager.recover().await.context("恢复任务失败")?;
        info!("已恢复 {} 个未完成任务", recovered);
    }

    info!("✅ 下载服务已就绪，按 Ctrl+C 退出");
    tokio::signal::ctrl_c().await.context("监听退出信号失败")?;

    info!("收到退出信号，正在停止下载...");
    manager.shutdown().await;
    info!("已退出");

    Ok(())
}
