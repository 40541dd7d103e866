//! 下载完成后的收尾：校验临时文件并移动到目标路径

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("临时文件不存在: {0:?}")]
    MissingTemp(PathBuf),

    #[error("文件大小不一致: 期望 {expected}，实际 {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("文件操作失败: {0}")]
    Io(#[from] io::Error),
}

/// 创建或打开临时文件并预分配到 `total_size`
///
/// 不截断已有内容，续传时保留之前写入的字节
pub(crate) async fn prepare_temp_file(path: &Path, total_size: u64) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    if file.metadata().await?.len() != total_size {
        file.set_len(total_size).await?;
    }
    Ok(())
}

pub(crate) async fn remove_temp_file(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("已删除临时文件: {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除临时文件失败 {:?}: {}", path, e),
    }
}

/// 把临时文件移动到目标路径，失败时按间隔重试
pub async fn finalize_download(
    temp: &Path,
    dest: &Path,
    total_size: u64,
    attempts: u32,
    delay: Duration,
) -> Result<(), MergeError> {
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match finalize_once(temp, dest, total_size).await {
            Ok(()) => {
                info!("✅ 文件已完成: {:?}", dest);
                return Ok(());
            }
            // 大小不对重试也没用
            Err(e @ MergeError::SizeMismatch { .. }) => return Err(e),
            Err(e) => {
                warn!("移动文件失败（第 {}/{} 次）{:?}: {}", attempt, attempts, dest, e);
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| MergeError::MissingTemp(temp.to_path_buf())))
}

async fn finalize_once(temp: &Path, dest: &Path, total_size: u64) -> Result<(), MergeError> {
    let meta = match fs::metadata(temp).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            // 上次已经移动过（移动后、记录状态前进程退出）
            if let Ok(done) = fs::metadata(dest).await {
                if done.len() == total_size {
                    return Ok(());
                }
            }
            return Err(MergeError::MissingTemp(temp.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    if meta.len() < total_size {
        return Err(MergeError::SizeMismatch {
            expected: total_size,
            actual: meta.len(),
        });
    }
    if meta.len() > total_size {
        let file = fs::OpenOptions::new().write(true).open(temp).await?;
        file.set_len(total_size).await?;
    }

    if let Some(dir) = dest.parent() {
        fs::create_dir_all(dir).await?;
    }

    if let Err(e) = fs::rename(temp, dest).await {
        // 跨文件系统时 rename 会失败，退回复制
        debug!("重命名失败，改为复制 {:?} -> {:?}: {}", temp, dest, e);
        fs::copy(temp, dest).await?;
        fs::remove_file(temp).await?;
    }
    Ok(())
}
