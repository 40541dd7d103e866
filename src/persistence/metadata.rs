//! 任务记录文件操作
//!
//! 任务记录和分段记录都是 JSON 文件：
//! - `{task_id}.meta`：单个 [`DownloadTask`]
//! - `{task_id}.workers`：叶子任务的 [`DownloadWorkerTask`] 数组
//!
//! 写入时先写 `.tmp` 再原子重命名，避免写入中断导致文件损坏。

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::downloader::{DownloadTask, DownloadWorkerTask};

/// 任务记录扩展名
const META_EXTENSION: &str = "meta";
/// 分段记录扩展名
const WORKERS_EXTENSION: &str = "workers";

pub fn get_metadata_path(state_dir: &Path, task_id: &str) -> PathBuf {
    state_dir.join(format!("{}.{}", task_id, META_EXTENSION))
}

pub fn get_workers_path(state_dir: &Path, task_id: &str) -> PathBuf {
    state_dir.join(format!("{}.{}", task_id, WORKERS_EXTENSION))
}

fn ensure_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        debug!("已创建目录: {:?}", dir);
    }
    Ok(())
}

/// 序列化为 JSON 并原子写入
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        ensure_dir(dir)?;
    }

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let file = File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.flush()?;
    writer.get_ref().sync_data()?;
    drop(writer);

    fs::rename(&temp_path, path)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn save_task(state_dir: &Path, task: &DownloadTask) -> io::Result<()> {
    write_json_atomic(&get_metadata_path(state_dir, &task.id), task)
}

/// 加载任务记录，文件不存在时返回 None
pub fn load_task(state_dir: &Path, task_id: &str) -> io::Result<Option<DownloadTask>> {
    let path = get_metadata_path(state_dir, task_id);
    match read_json(&path) {
        Ok(task) => Ok(Some(task)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// 读取-修改-写回任务记录
///
/// 返回 `Ok(false)` 表示记录不存在
pub fn update_task<F>(state_dir: &Path, task_id: &str, updater: F) -> io::Result<bool>
where
    F: FnOnce(&mut DownloadTask),
{
    let Some(mut task) = load_task(state_dir, task_id)? else {
        debug!("任务记录不存在，无法更新: task_id={}", task_id);
        return Ok(false);
    };
    updater(&mut task);
    save_task(state_dir, &task)?;
    Ok(true)
}

pub fn save_workers(
    state_dir: &Path,
    task_id: &str,
    workers: &[DownloadWorkerTask],
) -> io::Result<()> {
    write_json_atomic(&get_workers_path(state_dir, task_id), workers)
}

/// 加载分段记录，文件不存在时返回空列表
pub fn load_workers(state_dir: &Path, task_id: &str) -> io::Result<Vec<DownloadWorkerTask>> {
    match read_json(&get_workers_path(state_dir, task_id)) {
        Ok(workers) => Ok(workers),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

pub fn delete_workers(state_dir: &Path, task_id: &str) -> io::Result<bool> {
    remove_if_exists(&get_workers_path(state_dir, task_id))
}

/// 删除任务的全部文件（任务记录 + 分段记录）
pub fn delete_task_files(state_dir: &Path, task_id: &str) -> io::Result<usize> {
    let mut deleted = 0;
    if remove_if_exists(&get_metadata_path(state_dir, task_id))? {
        deleted += 1;
    }
    if delete_workers(state_dir, task_id)? {
        deleted += 1;
    }
    Ok(deleted)
}

/// 扫描目录中的全部任务记录（跳过无法解析的文件）
pub fn scan_all_tasks(state_dir: &Path) -> io::Result<Vec<DownloadTask>> {
    if !state_dir.exists() {
        return Ok(Vec::new());
    }

    let mut tasks = Vec::new();
    let mut skipped = 0;

    for entry in fs::read_dir(state_dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().map_or(true, |ext| ext != META_EXTENSION) {
            continue;
        }
        match read_json::<DownloadTask>(&path) {
            Ok(task) => tasks.push(task),
            Err(e) => {
                warn!("跳过无效任务记录 {:?}: {}", path, e);
                skipped += 1;
            }
        }
    }

    if skipped > 0 {
        warn!("扫描任务记录完成，跳过 {} 个无效文件", skipped);
    }
    debug!("扫描到 {} 个任务记录", tasks.len());

    Ok(tasks)
}
